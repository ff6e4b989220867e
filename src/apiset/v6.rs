//! Schema `Version == 6`: the current (post-Windows 10) schema. Contracts
//! are found via a sorted hash table (`HashOffset`/`HashMultiplier`) rather
//! than a name comparison, then confirmed by an exact string compare against
//! the hash table's recorded `HashedLength` — a collision in the hash alone
//! must never resolve to the wrong contract.

use crate::bounds::ByteReader;
use crate::error::EngineError;

use super::{hash_key, normalize_contract_key, pick_alternate, read_utf16le};

const HEADER_SIZE: usize = 28;
const HASH_ENTRY_SIZE: usize = 8;
const NAMESPACE_ENTRY_SIZE: usize = 24;
const VALUE_ENTRY_SIZE: usize = 20;

#[derive(Debug, Clone)]
pub struct NamespaceV6 {
    blob: Vec<u8>,
    count: u32,
    entry_offset: u32,
    hash_offset: u32,
    hash_multiplier: u32,
}

impl NamespaceV6 {
    pub(crate) fn parse(blob: Vec<u8>) -> Result<Self, EngineError> {
        let r = blob.as_slice();
        let count = r.read_u32(12)?;
        let entry_offset = r.read_u32(16)?;
        let hash_offset = r.read_u32(20)?;
        let hash_multiplier = r.read_u32(24)?;
        Ok(Self { blob, count, entry_offset, hash_offset, hash_multiplier })
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    fn hash_at(&self, index: u32) -> Result<(u32, u32), EngineError> {
        let base = self.hash_offset as usize + index as usize * HASH_ENTRY_SIZE;
        let hash = self.blob.as_slice().read_u32(base)?;
        let entry_index = self.blob.as_slice().read_u32(base + 4)?;
        Ok((hash, entry_index))
    }

    /// The canonical (hashed) prefix of this entry's name — possibly shorter
    /// than the entry's full stored name, per spec: "the comparable region
    /// has its own declared length shorter than the stored name length".
    fn canonical_name(&self, index: u32) -> Result<String, EngineError> {
        let base = self.entry_offset as usize + index as usize * NAMESPACE_ENTRY_SIZE;
        let name_offset = self.blob.as_slice().read_u32(base + 4)? as usize;
        let hashed_length = self.blob.as_slice().read_u32(base + 12)? as usize;
        read_utf16le(&self.blob, name_offset, hashed_length)
    }

    fn entry_alternates(&self, index: u32) -> Result<Vec<(String, String)>, EngineError> {
        let base = self.entry_offset as usize + index as usize * NAMESPACE_ENTRY_SIZE;
        let value_offset = self.blob.as_slice().read_u32(base + 16)? as usize;
        let value_count = self.blob.as_slice().read_u32(base + 20)?;
        let mut out = Vec::with_capacity(value_count as usize);
        for i in 0..value_count {
            let entry_base = value_offset + i as usize * VALUE_ENTRY_SIZE;
            let name_offset = self.blob.as_slice().read_u32(entry_base + 4)? as usize;
            let name_length = self.blob.as_slice().read_u32(entry_base + 8)? as usize;
            let value_offset_rel = self.blob.as_slice().read_u32(entry_base + 12)? as usize;
            let value_length = self.blob.as_slice().read_u32(entry_base + 16)? as usize;
            let alias = if name_length == 0 {
                String::new()
            } else {
                read_utf16le(&self.blob, name_offset, name_length)?
            };
            // Either a zero ValueOffset or a zero ValueLength marks an empty
            // (present-but-not-hosted) value; reading at offset 0 with the
            // other field nonzero would otherwise pull in unrelated blob bytes.
            let value = if value_length == 0 || value_offset_rel == 0 {
                String::new()
            } else {
                read_utf16le(&self.blob, value_offset_rel, value_length)?
            };
            out.push((alias, value));
        }
        Ok(out)
    }

    /// Binary search the hash-sorted table for `key`'s hash, then confirm by
    /// string compare against the matching contract entry's recorded name.
    fn find(&self, key: &str) -> Result<Option<u32>, EngineError> {
        if self.count == 0 {
            return Ok(None);
        }
        let target_hash = hash_key(key, self.hash_multiplier);
        let mut lo = 0i64;
        let mut hi = self.count as i64 - 1;
        while lo <= hi {
            let mid = (lo + hi) / 2;
            let (hash, entry_index) = self.hash_at(mid as u32)?;
            match hash.cmp(&target_hash) {
                std::cmp::Ordering::Equal => {
                    let canonical = self.canonical_name(entry_index)?;
                    if super::ascii_ieq(&canonical, key) {
                        return Ok(Some(entry_index));
                    }
                    return Ok(None);
                }
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
        // V6's hash covers the full dash-stripped name, prefix included.
        let key = normalize_contract_key(contract_name, false)?;
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

    /// Build a single-contract `V6` namespace blob hosting `contract_key`
    /// (already dash-stripped, prefix included) to `host`.
    fn build_single_contract_blob(contract_key: &str, host: &str) -> Vec<u8> {
        let multiplier = 31u32;
        let mut blob = vec![0u8; HEADER_SIZE];
        let mut w = |blob: &mut Vec<u8>, off: usize, v: u32| {
            blob[off..off + 4].copy_from_slice(&v.to_le_bytes())
        };
        w(&mut blob, 0, 6); // version
        w(&mut blob, 12, 1); // count
        w(&mut blob, 16, HEADER_SIZE as u32); // entry_offset
        w(&mut blob, 20, (HEADER_SIZE + NAMESPACE_ENTRY_SIZE) as u32); // hash_offset
        w(&mut blob, 24, multiplier);

        // namespace entry at entry_offset (strings appended after everything
        // else and patched in at the end).
        let entry_base = blob.len();
        blob.resize(entry_base + NAMESPACE_ENTRY_SIZE, 0);

        // hash entry at hash_offset
        let hash = hash_key(contract_key, multiplier);
        push_u32(&mut blob, hash);
        push_u32(&mut blob, 0); // points at namespace entry 0

        // single value entry: no alias (default), host value.
        let value_entry_base = blob.len();
        push_u32(&mut blob, 0); // flags
        push_u32(&mut blob, 0); // name_offset (unused, name_length 0)
        push_u32(&mut blob, 0); // name_length
        push_u32(&mut blob, 0); // value_offset placeholder, patched below
        push_u32(&mut blob, host.encode_utf16().count() as u32 * 2); // value_length

        let host_offset = blob.len();
        push_utf16(&mut blob, host);

        let name_offset = blob.len();
        push_utf16(&mut blob, contract_key);

        // patch namespace entry: flags, name_offset, name_length, hashed_length, value_offset, value_count
        let name_len_bytes = contract_key.encode_utf16().count() as u32 * 2;
        blob[entry_base..entry_base + 4].copy_from_slice(&0u32.to_le_bytes());
        blob[entry_base + 4..entry_base + 8].copy_from_slice(&(name_offset as u32).to_le_bytes());
        blob[entry_base + 8..entry_base + 12].copy_from_slice(&name_len_bytes.to_le_bytes());
        blob[entry_base + 12..entry_base + 16].copy_from_slice(&name_len_bytes.to_le_bytes());
        blob[entry_base + 16..entry_base + 20]
            .copy_from_slice(&(value_entry_base as u32).to_le_bytes());
        blob[entry_base + 20..entry_base + 24].copy_from_slice(&1u32.to_le_bytes());

        // patch value entry's value_offset now that host_offset is known.
        blob[value_entry_base + 12..value_entry_base + 16]
            .copy_from_slice(&(host_offset as u32).to_le_bytes());

        blob
    }

    #[test]
    fn resolves_known_contract_to_its_host() {
        let blob = build_single_contract_blob("api-ms-win-core-com-l2-1", "combase.dll");
        let ns = NamespaceV6::parse(blob).unwrap();
        assert_eq!(ns.count(), 1);
        let host = ns.resolve("api-ms-win-core-com-l2-1-1", None).unwrap();
        assert_eq!(host, "combase.dll");
    }

    #[test]
    fn unknown_contract_is_not_present() {
        let blob = build_single_contract_blob("api-ms-win-core-com-l2-1", "combase.dll");
        let ns = NamespaceV6::parse(blob).unwrap();
        let err = ns.resolve("api-ms-win-core-zzz-1-1", None).unwrap_err();
        assert!(matches!(err, EngineError::ApiSetNotPresent));
    }

    #[test]
    fn zero_value_offset_with_nonzero_length_is_not_hosted() {
        // Matches the layout `build_single_contract_blob` produces: the sole
        // value entry sits right after the namespace entry and its hash entry.
        let value_entry_base = HEADER_SIZE + NAMESPACE_ENTRY_SIZE + 8;
        let mut blob = build_single_contract_blob("api-ms-win-core-com-l2-1", "combase.dll");
        // ValueOffset@entry+12 is already nonzero (points at "combase.dll");
        // force it to zero while leaving ValueLength nonzero.
        blob[value_entry_base + 12..value_entry_base + 16].copy_from_slice(&0u32.to_le_bytes());

        let ns = NamespaceV6::parse(blob).unwrap();
        let err = ns.resolve("api-ms-win-core-com-l2-1-1", None).unwrap_err();
        assert!(matches!(err, EngineError::ApiSetNotHosted));
    }
}
