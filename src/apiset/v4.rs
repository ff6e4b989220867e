//! Schema `Version == 4`: namespace-relative offsets, contracts sorted by
//! name and searched with a binary search (no hash table yet — that's new in
//! `V6`). Strings are addressed relative to the namespace's own base, unlike
//! `V2`'s absolute offsets.

use crate::bounds::ByteReader;
use crate::error::EngineError;

use super::{normalize_contract_key, pick_alternate, read_utf16le};

const HEADER_SIZE: usize = 16;
const ENTRY_SIZE: usize = 12;
const VALUE_ENTRY_SIZE: usize = 16;

#[derive(Debug, Clone)]
pub struct NamespaceV4 {
    blob: Vec<u8>,
    count: u32,
}

impl NamespaceV4 {
    pub(crate) fn parse(blob: Vec<u8>) -> Result<Self, EngineError> {
        let count = blob.as_slice().read_u32(12)?;
        Ok(Self { blob, count })
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    fn entry_name(&self, index: u32) -> Result<String, EngineError> {
        let base = HEADER_SIZE + index as usize * ENTRY_SIZE;
        let name_offset = self.blob.as_slice().read_u32(base)? as usize;
        let name_length = self.blob.as_slice().read_u32(base + 4)? as usize;
        read_utf16le(&self.blob, name_offset, name_length)
    }

    fn entry_alternates(&self, index: u32) -> Result<Vec<(String, String)>, EngineError> {
        let base = HEADER_SIZE + index as usize * ENTRY_SIZE;
        let data_offset = self.blob.as_slice().read_u32(base + 8)? as usize;
        let value_count = self.blob.as_slice().read_u32(data_offset)?;
        let mut out = Vec::with_capacity(value_count as usize);
        for i in 0..value_count {
            let entry_base = data_offset + 4 + i as usize * VALUE_ENTRY_SIZE;
            let name_offset = self.blob.as_slice().read_u32(entry_base)? as usize;
            let name_length = self.blob.as_slice().read_u32(entry_base + 4)? as usize;
            let value_offset = self.blob.as_slice().read_u32(entry_base + 8)? as usize;
            let value_length = self.blob.as_slice().read_u32(entry_base + 12)? as usize;
            let alias = if name_length == 0 {
                String::new()
            } else {
                read_utf16le(&self.blob, name_offset, name_length)?
            };
            let value = if value_length == 0 {
                String::new()
            } else {
                read_utf16le(&self.blob, value_offset, value_length)?
            };
            out.push((alias, value));
        }
        Ok(out)
    }

    /// Binary search the name-sorted contract array for `key`.
    fn find(&self, key: &str) -> Result<Option<u32>, EngineError> {
        if self.count == 0 {
            return Ok(None);
        }
        let mut lo = 0i64;
        let mut hi = self.count as i64 - 1;
        while lo <= hi {
            let mid = (lo + hi) / 2;
            let candidate = self.entry_name(mid as u32)?;
            match super::ascii_icmp(&candidate, key) {
                std::cmp::Ordering::Equal => return Ok(Some(mid as u32)),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid - 1,
            }
        }
        Ok(None)
    }

    pub(crate) fn resolve(
        &self,
        contract_name: &str,
        parent_name: Option<&str>,
    ) -> Result<String, EngineError> {
        let key = normalize_contract_key(contract_name, true)?;
        let Some(index) = self.find(&key)? else {
            return Err(EngineError::ApiSetNotPresent);
        };
        let alternates = self.entry_alternates(index)?;
        match pick_alternate(&alternates, parent_name) {
            Some(host) if !host.is_empty() => Ok(host.to_string()),
            _ => Err(EngineError::ApiSetNotHosted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    fn push_utf16(buf: &mut Vec<u8>, s: &str) {
        for unit in s.encode_utf16() {
            buf.extend_from_slice(&unit.to_le_bytes());
        }
    }

    /// Build a single-contract `V4` namespace blob. `key` is the already
    /// prefix-stripped, dash-stripped lookup key (e.g. `"ms-win-core-com-l2-1"`).
    fn build_single_contract_blob(key: &str, host: &str) -> Vec<u8> {
        let mut blob = vec![0u8; HEADER_SIZE];
        let w = |blob: &mut Vec<u8>, off: usize, v: u32| {
            blob[off..off + 4].copy_from_slice(&v.to_le_bytes())
        };
        w(&mut blob, 0, 4); // version
        w(&mut blob, 12, 1); // count

        let entry_base = blob.len();
        blob.resize(entry_base + ENTRY_SIZE, 0);

        let data_offset = blob.len();
        push_u32(&mut blob, 1); // value_count

        let value_entry_base = blob.len();
        push_u32(&mut blob, 0); // name_offset (unused, name_length 0)
        push_u32(&mut blob, 0); // name_length
        push_u32(&mut blob, 0); // value_offset placeholder, patched below
        push_u32(&mut blob, host.encode_utf16().count() as u32 * 2); // value_length

        let host_offset = blob.len();
        push_utf16(&mut blob, host);

        let name_offset = blob.len();
        push_utf16(&mut blob, key);

        let name_len_bytes = key.encode_utf16().count() as u32 * 2;
        blob[entry_base..entry_base + 4].copy_from_slice(&(name_offset as u32).to_le_bytes());
        blob[entry_base + 4..entry_base + 8].copy_from_slice(&name_len_bytes.to_le_bytes());
        blob[entry_base + 8..entry_base + 12].copy_from_slice(&(data_offset as u32).to_le_bytes());

        blob[value_entry_base + 8..value_entry_base + 12]
            .copy_from_slice(&(host_offset as u32).to_le_bytes());

        blob
    }

    #[test]
    fn resolves_known_contract_to_its_host() {
        let blob = build_single_contract_blob("ms-win-core-com-l2-1", "combase.dll");
        let ns = NamespaceV4::parse(blob).unwrap();
        assert_eq!(ns.count(), 1);
        let host = ns.resolve("api-ms-win-core-com-l2-1-1", None).unwrap();
        assert_eq!(host, "combase.dll");
    }

    #[test]
    fn unknown_contract_is_not_present() {
        let blob = build_single_contract_blob("ms-win-core-com-l2-1", "combase.dll");
        let ns = NamespaceV4::parse(blob).unwrap();
        let err = ns.resolve("api-ms-win-core-zzz-1-1", None).unwrap_err();
        assert!(matches!(err, EngineError::ApiSetNotPresent));
    }

    #[test]
    fn empty_value_is_not_hosted() {
        let mut blob = build_single_contract_blob("ms-win-core-com-l2-1", "combase.dll");
        let data_offset = blob.as_slice().read_u32(HEADER_SIZE + 8).unwrap() as usize;
        let value_entry_base = data_offset + 4;
        blob[value_entry_base + 12..value_entry_base + 16].copy_from_slice(&0u32.to_le_bytes());

        let ns = NamespaceV4::parse(blob).unwrap();
        let err = ns.resolve("api-ms-win-core-com-l2-1-1", None).unwrap_err();
        assert!(matches!(err, EngineError::ApiSetNotHosted));
    }
}
