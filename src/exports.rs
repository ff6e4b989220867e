//! Export table walker (Module D).
//!
//! Grounded on `get_exports` in `pe32plus.c`: walk `AddressOfFunctions`,
//! probing `AddressOfNameOrdinals` for a name for each non-zero entry, and
//! classifying an entry as a forwarder when its RVA falls inside the export
//! directory's own `[dir_base, dir_base + dir_size)` extent.

use serde::Serialize;

use crate::bounds::ImageView;
use crate::error::EngineError;

/// Sentinel used for "no name" in both `hint` and (for imports) `ordinal`.
pub const NO_HINT: u32 = 0xFFFF_FFFF;

/// Hard cap on the number of exports walked, regardless of what
/// `NumberOfFunctions` declares (spec.md §4.E global bounds).
pub const MAX_EXPORTS: u32 = 65_536;

/// One exported function.
#[derive(Debug, Clone, Serialize)]
pub struct ExportEntry {
    /// `Base + i`: the export ordinal.
    pub ordinal: u32,
    /// Index into the name table, or [`NO_HINT`] if unnamed.
    pub hint: u32,
    /// Exported name, or empty if unnamed.
    pub name: String,
    /// The raw function RVA (forwarder string RVA, if this is a forward).
    pub pointer: u32,
    /// Forwarder target string (`"DLL.Export"`), empty if not a forwarder.
    pub forward: String,
}

/// The parsed export directory plus its walked entries.
#[derive(Debug, Clone, Serialize)]
pub struct ExportLibrary {
    /// `IMAGE_EXPORT_DIRECTORY::TimeDateStamp`.
    pub timestamp: u32,
    /// `NumberOfFunctions`, capped at [`MAX_EXPORTS`].
    pub entries: u32,
    /// `NumberOfNames`.
    pub named: u32,
    /// `Base`: the ordinal number of the first export.
    pub base: u32,
    /// Walked function entries, skipping zero (unused ordinal slots) entries.
    pub functions: Vec<ExportEntry>,
}

/// Walk the export directory at `dir_base`/`dir_size` (from the optional
/// header's export data directory) over `view`.
pub fn walk_exports(
    view: &ImageView,
    dir_base: u32,
    dir_size: u32,
) -> Result<ExportLibrary, EngineError> {
    let base = dir_base as u64;
    let timestamp = view.read_u32(base + 4)?;
    let number_of_functions = view.read_u32(base + 20)?.min(MAX_EXPORTS);
    let number_of_names = view.read_u32(base + 24)?.min(MAX_EXPORTS);
    let ordinal_base = view.read_u32(base + 16)?;
    let functions_rva = view.read_u32(base + 28)? as u64;
    let names_rva = view.read_u32(base + 32)? as u64;
    let name_ordinals_rva = view.read_u32(base + 36)? as u64;

    // Single range check over the whole name-ordinal array before the inner
    // loop; on failure every export below is emitted without a name.
    let names_valid = view
        .slice(name_ordinals_rva, number_of_names as u64 * 2)
        .is_ok();

    let mut functions = Vec::new();
    for i in 0..number_of_functions {
        let Ok(rva) = view.read_u32(functions_rva + i as u64 * 4) else {
            break;
        };
        if rva == 0 {
            continue;
        }

        let mut hint = NO_HINT;
        let mut name = String::new();
        if names_valid {
            for p in 0..number_of_names {
                let ord = view.read_u16(name_ordinals_rva + p as u64 * 2)?;
                if ord as u32 == i {
                    hint = p;
                    let name_rva = view.read_u32(names_rva + p as u64 * 4)?;
                    name = view.read_cstr(name_rva as u64, 4096)?;
                }
            }
        }

        let forward = if rva >= dir_base && rva < dir_base.saturating_add(dir_size) {
            view.read_cstr(rva as u64, 4096)?
        } else {
            String::new()
        };

        functions.push(ExportEntry {
            ordinal: ordinal_base + i,
            hint,
            name,
            pointer: rva,
            forward,
        });
    }

    Ok(ExportLibrary {
        timestamp,
        entries: number_of_functions,
        named: number_of_names,
        base: ordinal_base,
        functions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_image_with_single_export(name: &str, target_rva: u32) -> Vec<u8> {
        let image_size = 0x2000usize;
        let mut buf = vec![0u8; image_size];
        let dir_base: usize = 0x100;
        let functions_rva: u32 = 0x200;
        let names_rva: u32 = 0x300;
        let name_ordinals_rva: u32 = 0x400;
        let name_str_rva: u32 = 0x500;

        let w32 = |buf: &mut [u8], off: usize, v: u32| buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
        w32(&mut buf, dir_base + 4, 0xdead_beef); // timestamp
        w32(&mut buf, dir_base + 16, 1); // base
        w32(&mut buf, dir_base + 20, 1); // NumberOfFunctions
        w32(&mut buf, dir_base + 24, 1); // NumberOfNames
        w32(&mut buf, dir_base + 28, functions_rva); // AddressOfFunctions
        w32(&mut buf, dir_base + 32, names_rva); // AddressOfNames
        w32(&mut buf, dir_base + 36, name_ordinals_rva); // AddressOfNameOrdinals

        w32(&mut buf, functions_rva as usize, target_rva);
        w32(&mut buf, names_rva as usize, name_str_rva);
        buf[name_ordinals_rva as usize..name_ordinals_rva as usize + 2]
            .copy_from_slice(&0u16.to_le_bytes());

        let name_bytes = name.as_bytes();
        buf[name_str_rva as usize..name_str_rva as usize + name_bytes.len()]
            .copy_from_slice(name_bytes);

        buf
    }

    #[test]
    fn walks_a_single_named_export() {
        let buf = build_image_with_single_export("DoThing", 0x1234);
        let view = ImageView::new(&buf, 0);
        let lib = walk_exports(&view, 0x100, 0x20).unwrap();
        assert_eq!(lib.entries, 1);
        assert_eq!(lib.functions.len(), 1);
        let f = &lib.functions[0];
        assert_eq!(f.name, "DoThing");
        assert_eq!(f.hint, 0);
        assert_eq!(f.ordinal, 1);
        assert!(f.forward.is_empty());
    }

    #[test]
    fn detects_forwarder_when_rva_is_inside_directory_extent() {
        let buf = build_image_with_single_export("Forwarded", 0x108);
        let view = ImageView::new(&buf, 0);
        let lib = walk_exports(&view, 0x100, 0x20).unwrap();
        let f = &lib.functions[0];
        assert!(!f.forward.is_empty());
    }

    #[test]
    fn skips_zero_entries_without_emitting_them() {
        let mut buf = vec![0u8; 0x2000];
        let w32 = |buf: &mut [u8], off: usize, v: u32| buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
        w32(&mut buf, 0x104, 0); // timestamp
        w32(&mut buf, 0x110, 1); // base
        w32(&mut buf, 0x114, 1); // NumberOfFunctions
        w32(&mut buf, 0x118, 0); // NumberOfNames
        w32(&mut buf, 0x11c, 0x200); // AddressOfFunctions
        w32(&mut buf, 0x120, 0x300); // AddressOfNames
        w32(&mut buf, 0x124, 0x400); // AddressOfNameOrdinals
        w32(&mut buf, 0x200, 0); // entry 0 is unused
        let view = ImageView::new(&buf, 0);
        let lib = walk_exports(&view, 0x100, 0x20).unwrap();
        assert!(lib.functions.is_empty());
    }
}
