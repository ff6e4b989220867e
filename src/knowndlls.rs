//! KnownDlls data model and pluggable source (Module I, ambient).
//!
//! spec.md fixes the data model (§3, two singly-linked sets keyed by
//! bitness) and the `knowndlls` wire command (§6), but excludes "the host-OS
//! lookup of the KnownDlls object-directory list" (§1) — the real
//! `NtOpenDirectoryObject`/`NtQueryDirectoryObject` enumeration in `util.c`
//! is that excluded collaborator. This module models the data and offers one
//! production [`KnownDllsSource`] that reads a `name\tpath` text fixture, for
//! non-Windows development and testing.

use std::path::Path;

/// One `(short DLL filename, common directory path)` pairing.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KnownDllEntry {
    /// Short file name, e.g. `"kernel32.dll"`.
    pub name: String,
    /// The directory all entries in this bucket resolve against.
    pub path: String,
}

/// The two search roots the original enumerates: `\KnownDlls` (native
/// bitness) and `\KnownDlls32` (WOW64).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct KnownDllsList {
    /// Entries from the native (`64`) search root.
    pub dlls64: Vec<KnownDllEntry>,
    /// Entries from the WOW64 (`32`) search root.
    pub dlls32: Vec<KnownDllEntry>,
    /// Common directory path backing `dlls64` (per spec.md §3, each set
    /// pairs its entries with a *common* directory path).
    pub path64: String,
    /// Common directory path backing `dlls32`.
    pub path32: String,
}

impl KnownDllsList {
    /// Select the bucket for the `knowndlls` command's `32`/`64` argument.
    pub fn bucket(&self, bitness: KnownDllsBitness) -> (&str, &[KnownDllEntry]) {
        match bitness {
            KnownDllsBitness::Bits32 => (&self.path32, &self.dlls32),
            KnownDllsBitness::Bits64 => (&self.path64, &self.dlls64),
        }
    }
}

/// Which KnownDlls search root the `knowndlls` command asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownDllsBitness {
    /// The `32` literal argument (`\KnownDlls32`).
    Bits32,
    /// The `64` literal argument (`\KnownDlls`).
    Bits64,
}

impl KnownDllsBitness {
    /// Parse the command's literal `32`/`64` argument.
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim() {
            "32" => Some(Self::Bits32),
            "64" => Some(Self::Bits64),
            _ => None,
        }
    }
}

/// A pluggable way to populate [`KnownDllsList`] once at startup. The real
/// NT object-directory enumeration is out of scope; this trait exists so the
/// engine can be exercised without it.
pub trait KnownDllsSource {
    /// Produce the populated list, or an error string on failure.
    fn load(&self) -> Result<KnownDllsList, String>;
}

/// Reads a simple two-column `name\tpath` text fixture, one `64` block then
/// one `32` block separated by a line containing only `--`. Intended for
/// development/testing on non-Windows hosts.
pub struct FileKnownDllsSource<'a> {
    /// Path to the fixture file.
    pub path: &'a Path,
}

impl<'a> KnownDllsSource for FileKnownDllsSource<'a> {
    fn load(&self) -> Result<KnownDllsList, String> {
        let text = std::fs::read_to_string(self.path).map_err(|e| e.to_string())?;
        let mut list = KnownDllsList::default();
        let mut in_second_block = false;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == "--" {
                in_second_block = true;
                continue;
            }
            let Some((name, path)) = line.split_once('\t') else {
                continue;
            };
            let entry = KnownDllEntry {
                name: name.to_string(),
                path: path.to_string(),
            };
            if in_second_block {
                if list.path32.is_empty() {
                    list.path32 = path.to_string();
                }
                list.dlls32.push(entry);
            } else {
                if list.path64.is_empty() {
                    list.path64 = path.to_string();
                }
                list.dlls64.push(entry);
            }
        }

        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_blocks() {
        let tmp = std::env::temp_dir().join("windepends-core-test-knowndlls.tsv");
        std::fs::write(
            &tmp,
            "kernel32.dll\tC:\\Windows\\System32\nntdll.dll\tC:\\Windows\\System32\n--\nkernel32.dll\tC:\\Windows\\SysWOW64\n",
        )
        .unwrap();

        let source = FileKnownDllsSource { path: &tmp };
        let list = source.load().unwrap();
        let _ = std::fs::remove_file(&tmp);

        assert_eq!(list.dlls64.len(), 2);
        assert_eq!(list.dlls32.len(), 1);
        assert_eq!(list.path64, "C:\\Windows\\System32");
        assert_eq!(list.path32, "C:\\Windows\\SysWOW64");
    }

    #[test]
    fn bitness_parses_literal_tokens() {
        assert_eq!(KnownDllsBitness::parse("32"), Some(KnownDllsBitness::Bits32));
        assert_eq!(KnownDllsBitness::parse("64"), Some(KnownDllsBitness::Bits64));
        assert_eq!(KnownDllsBitness::parse("16"), None);
    }
}
