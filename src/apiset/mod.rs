//! ApiSet contract resolution (Module G).
//!
//! Grounded on `apiset.c`'s `ApiSetResolveToHost` family. Windows has shipped
//! three on-disk namespace schemas over its lifetime (`Version` 2, 4 and 6);
//! this module parses whichever one a blob declares and resolves a contract
//! name against it. The exact struct layouts aren't in the retrieved source —
//! `apisetschema.h` isn't part of this pack — so the structs below are
//! reconstructed from the field names `apiset.c` actually dereferences
//! (`HashMultiplier`, `Count`, `NameOffset`, `NameLength`, `ValueOffset`,
//! `ValueLength`, `DataOffset`) rather than copied from a header.
//!
//! All three schemas share two pieces of string normalization before any
//! lookup happens:
//!
//! - a case-folded (`ASCII` range only) `API-`/`EXT-` prefix check
//! - a version-suffix strip: scan right to left for the rightmost `-`,
//!   stopping one component short of it; a name with one trailing character
//!   or fewer after that scan is rejected outright
//!
//! `V2`/`V4` additionally drop the four-character prefix from the resulting
//! key before searching (the hash in `V6` is computed over the un-prefix-
//! stripped key, so `V6` keeps it).

mod v2;
mod v4;
mod v6;

use crate::bounds::ByteReader;
use crate::error::EngineError;

pub use v2::NamespaceV2;
pub use v4::NamespaceV4;
pub use v6::NamespaceV6;

/// A parsed ApiSet namespace, tagged by on-disk schema version.
#[derive(Debug, Clone)]
pub enum ApiSetNamespace {
    /// `Version == 2`.
    V2(NamespaceV2),
    /// `Version == 4`.
    V4(NamespaceV4),
    /// `Version == 6`.
    V6(NamespaceV6),
}

impl ApiSetNamespace {
    /// The schema version this namespace declared.
    pub fn version(&self) -> u32 {
        match self {
            Self::V2(_) => 2,
            Self::V4(_) => 4,
            Self::V6(_) => 6,
        }
    }

    /// Number of contracts in this namespace (`apisetnsinfo`).
    pub fn count(&self) -> u32 {
        match self {
            Self::V2(ns) => ns.count(),
            Self::V4(ns) => ns.count(),
            Self::V6(ns) => ns.count(),
        }
    }

    /// Resolve `contract_name` to a host DLL file name.
    ///
    /// `parent_name`, when given, is the name of the module doing the
    /// import; when a contract hosts more than one alternate, the
    /// alternates (all but index 0) are searched for one whose alias
    /// matches `parent_name`'s stem, falling back to index 0 otherwise.
    pub fn resolve(
        &self,
        contract_name: &str,
        parent_name: Option<&str>,
    ) -> Result<String, EngineError> {
        match self {
            Self::V2(ns) => ns.resolve(contract_name, parent_name),
            Self::V4(ns) => ns.resolve(contract_name, parent_name),
            Self::V6(ns) => ns.resolve(contract_name, parent_name),
        }
    }
}

/// Parse a namespace blob, dispatching on its leading `Version` field.
pub fn parse(blob: Vec<u8>) -> Result<ApiSetNamespace, EngineError> {
    let version = blob.as_slice().read_u32(0)?;
    match version {
        2 => Ok(ApiSetNamespace::V2(v2::NamespaceV2::parse(blob)?)),
        4 => Ok(ApiSetNamespace::V4(v4::NamespaceV4::parse(blob)?)),
        6 => Ok(ApiSetNamespace::V6(v6::NamespaceV6::parse(blob)?)),
        other => Err(EngineError::UnsupportedApiSetVersion(other)),
    }
}

fn ascii_upper(c: char) -> char {
    if c.is_ascii_lowercase() {
        (c as u8 - 0x20) as char
    } else {
        c
    }
}

fn ascii_lower(c: char) -> char {
    if c.is_ascii_uppercase() {
        (c as u8 + 0x20) as char
    } else {
        c
    }
}

/// Case-insensitive (ASCII-range only) equality, matching the source's
/// `RtlEqualString`-with-`IgnoreCase` convention rather than full Unicode
/// case folding.
pub(crate) fn ascii_ieq(a: &str, b: &str) -> bool {
    let mut ac = a.chars().map(ascii_upper);
    let mut bc = b.chars().map(ascii_upper);
    loop {
        match (ac.next(), bc.next()) {
            (None, None) => return true,
            (Some(x), Some(y)) if x == y => continue,
            _ => return false,
        }
    }
}

/// Case-insensitive (ASCII-range only) ordering, for the binary-searched schemas.
pub(crate) fn ascii_icmp(a: &str, b: &str) -> std::cmp::Ordering {
    let au: Vec<char> = a.chars().map(ascii_upper).collect();
    let bu: Vec<char> = b.chars().map(ascii_upper).collect();
    au.cmp(&bu)
}

/// Scan right to left for the rightmost `-`, returning the length of the
/// prefix that precedes it. A string with one character or fewer remaining
/// before a dash is found is rejected, matching the source's own abort.
fn strip_version_suffix(chars: &[char]) -> Result<usize, EngineError> {
    let mut len = chars.len();
    loop {
        if len <= 1 {
            return Err(EngineError::InvalidContractName);
        }
        len -= 1;
        if chars[len] == '-' {
            return Ok(len);
        }
    }
}

/// Validate the `API-`/`EXT-` prefix and strip the version suffix, returning
/// the normalized lookup key. When `strip_prefix` is set the leading four
/// characters are dropped from the returned key as well (`V2`/`V4`).
pub(crate) fn normalize_contract_key(
    name: &str,
    strip_prefix: bool,
) -> Result<String, EngineError> {
    let chars: Vec<char> = name.chars().collect();
    if chars.len() < 4 {
        return Err(EngineError::ApiSetNotPresent);
    }
    let prefix: String = chars[0..4].iter().map(|c| ascii_upper(*c)).collect();
    if prefix != "API-" && prefix != "EXT-" {
        return Err(EngineError::ApiSetNotPresent);
    }
    let effective_len = strip_version_suffix(&chars)?;
    let key_chars = &chars[0..effective_len];
    let key_chars = if strip_prefix {
        &key_chars[4.min(key_chars.len())..]
    } else {
        key_chars
    };
    Ok(key_chars.iter().collect())
}

/// Compute `V6`'s case-folded multiplicative hash over `key`.
pub(crate) fn hash_key(key: &str, multiplier: u32) -> u32 {
    let mut hash: u32 = 0;
    for c in key.chars() {
        let folded = ascii_lower(c) as u32;
        hash = hash.wrapping_mul(multiplier).wrapping_add(folded);
    }
    hash
}

/// Read a UTF-16LE string of `len_bytes` bytes starting at `offset`.
pub(crate) fn read_utf16le(blob: &[u8], offset: usize, len_bytes: usize) -> Result<String, EngineError> {
    let bytes = blob
        .get(offset..offset + len_bytes)
        .ok_or(EngineError::OffsetOutOfRange { offset: offset as u64, len: len_bytes as u64 })?;
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

/// Given a contract's list of `(alias, value)` alternates (index 0 is the
/// default), pick the one whose alias matches `parent_stem` (ASCII
/// case-insensitively), falling back to index 0. If the value count is 1,
/// entry 0 is returned unconditionally — no parent bias is possible.
/// Alternates beyond index 0 are assumed pre-sorted by alias and are binary
/// searched, matching `apiset.c`'s host search.
pub(crate) fn pick_alternate<'a>(
    alternates: &'a [(String, String)],
    parent_stem: Option<&str>,
) -> Option<&'a str> {
    if alternates.is_empty() {
        return None;
    }
    if alternates.len() > 1 {
        if let Some(stem) = parent_stem {
            let rest = &alternates[1..];
            let mut lo = 0i64;
            let mut hi = rest.len() as i64 - 1;
            while lo <= hi {
                let mid = (lo + hi) / 2;
                match ascii_icmp(&rest[mid as usize].0, stem) {
                    std::cmp::Ordering::Equal => return Some(&rest[mid as usize].1),
                    std::cmp::Ordering::Less => lo = mid + 1,
                    std::cmp::Ordering::Greater => hi = mid - 1,
                }
            }
        }
    }
    Some(&alternates[0].1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_rejects_short_names() {
        assert!(matches!(
            normalize_contract_key("ap", false),
            Err(EngineError::ApiSetNotPresent)
        ));
    }

    #[test]
    fn normalizes_rejects_bad_prefix() {
        assert!(matches!(
            normalize_contract_key("foo-ms-win-core-1-1", false),
            Err(EngineError::ApiSetNotPresent)
        ));
    }

    #[test]
    fn normalizes_strips_trailing_minor_version() {
        let key = normalize_contract_key("api-ms-win-core-com-l2-1-1", false).unwrap();
        assert_eq!(key, "api-ms-win-core-com-l2-1");
    }

    #[test]
    fn normalizes_strips_prefix_for_v2_v4() {
        let key = normalize_contract_key("api-ms-win-core-com-l2-1-1", true).unwrap();
        assert_eq!(key, "ms-win-core-com-l2-1");
    }

    #[test]
    fn normalizes_rejects_scan_with_no_dash() {
        assert!(matches!(
            normalize_contract_key("apix", false),
            Err(EngineError::InvalidContractName)
        ));
    }

    #[test]
    fn ascii_case_insensitive_helpers_ignore_only_ascii() {
        assert!(ascii_ieq("ABC", "abc"));
        assert!(!ascii_ieq("abc", "abd"));
    }

    #[test]
    fn hash_is_order_sensitive_and_deterministic() {
        let h1 = hash_key("api-ms-win-core-com-l2-1", 31);
        let h2 = hash_key("api-ms-win-core-com-l2-1", 31);
        assert_eq!(h1, h2);
        assert_ne!(h1, hash_key("api-ms-win-core-com-l2-2", 31));
    }

    #[test]
    fn pick_alternate_falls_back_to_default() {
        let alts = vec![
            ("".to_string(), "default.dll".to_string()),
            ("host.exe".to_string(), "special.dll".to_string()),
        ];
        assert_eq!(pick_alternate(&alts, Some("other.exe")), Some("default.dll"));
        assert_eq!(pick_alternate(&alts, Some("host.exe")), Some("special.dll"));
    }
}
