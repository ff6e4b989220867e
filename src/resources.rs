//! Minimal PE resource-directory tree walker.
//!
//! The original engine delegates manifest/version lookup to `FindResource`/
//! `LoadResource`. Those Win32 APIs aren't available here, so this module
//! walks the three-level resource directory tree (type → name → language)
//! itself, far enough to locate `RT_VERSION` and `RT_MANIFEST` entries. The
//! rest of the resource schema (icons, dialogs, string tables, …) is out of
//! scope and not modeled.

use crate::bounds::ImageView;
use crate::error::EngineError;

/// Resource type ID for `RT_VERSION`.
pub const RT_VERSION: u32 = 16;
/// Resource type ID for `RT_MANIFEST`.
pub const RT_MANIFEST: u32 = 24;
/// The resource name Windows uses for the executable's embedded
/// create-process manifest.
pub const CREATEPROCESS_MANIFEST_RESOURCE_ID: u32 = 1;

const HIGH_BIT: u32 = 0x8000_0000;
const DIR_HEADER_SIZE: u64 = 16;
const DIR_ENTRY_SIZE: u64 = 8;

struct DirEntry {
    id: u32,
    offset_to_data: u32,
}

fn read_directory_entries(
    view: &ImageView,
    dir_rva: u32,
) -> Result<Vec<DirEntry>, EngineError> {
    let base = dir_rva as u64;
    let named = view.read_u16(base + 12)? as u64;
    let ids = view.read_u16(base + 14)? as u64;
    let count = named + ids;

    let mut entries = Vec::with_capacity(count as usize);
    for i in 0..count {
        let entry_addr = base + DIR_HEADER_SIZE + i * DIR_ENTRY_SIZE;
        let name = view.read_u32(entry_addr)?;
        let offset = view.read_u32(entry_addr + 4)?;
        // named entries (name & HIGH_BIT != 0) point at a string; this walker
        // only ever looks entries up by numeric type/id, so named directory
        // entries below the type level are skipped by id-match, not resolved.
        entries.push(DirEntry { id: name, offset_to_data: offset });
    }
    Ok(entries)
}

fn find_entry(entries: &[DirEntry], id: u32) -> Option<&DirEntry> {
    entries.iter().find(|e| (e.id & !HIGH_BIT) == id)
}

fn first_entry(entries: &[DirEntry]) -> Option<&DirEntry> {
    entries.first()
}

/// Walk `root_rva` (the resource directory's own RVA) for a specific
/// `type_id`, then descend into the first name and first language entry
/// found, returning the `(data_rva, size)` of the leaf `IMAGE_RESOURCE_DATA_ENTRY`.
///
/// When `name_id` is `Some`, the name level is matched by id instead of
/// taking the first entry (used for the manifest's well-known resource id).
fn find_resource_leaf(
    view: &ImageView,
    root_rva: u32,
    type_id: u32,
    name_id: Option<u32>,
) -> Result<Option<(u32, u32)>, EngineError> {
    if root_rva == 0 {
        return Ok(None);
    }
    let type_entries = read_directory_entries(view, root_rva)?;
    let Some(type_entry) = find_entry(&type_entries, type_id) else {
        return Ok(None);
    };
    if type_entry.offset_to_data & HIGH_BIT == 0 {
        return Ok(None); // malformed: type level must be a subdirectory.
    }
    let name_dir_rva = root_rva + (type_entry.offset_to_data & !HIGH_BIT);
    let name_entries = read_directory_entries(view, name_dir_rva)?;
    let name_entry = match name_id {
        Some(id) => find_entry(&name_entries, id),
        None => first_entry(&name_entries),
    };
    let Some(name_entry) = name_entry else {
        return Ok(None);
    };
    if name_entry.offset_to_data & HIGH_BIT == 0 {
        return Ok(None);
    }
    let lang_dir_rva = root_rva + (name_entry.offset_to_data & !HIGH_BIT);
    let lang_entries = read_directory_entries(view, lang_dir_rva)?;
    let Some(lang_entry) = first_entry(&lang_entries) else {
        return Ok(None);
    };
    if lang_entry.offset_to_data & HIGH_BIT != 0 {
        return Ok(None); // a third level of subdirectories is not modeled.
    }
    let data_entry_rva = (root_rva + lang_entry.offset_to_data) as u64;
    let data_rva = view.read_u32(data_entry_rva)?;
    let size = view.read_u32(data_entry_rva + 4)?;
    Ok(Some((data_rva, size)))
}

/// Locate the create-process manifest resource, returning its raw bytes if present.
pub fn find_manifest_bytes<'a>(
    view: &ImageView<'a>,
    resource_dir_rva: u32,
) -> Result<Option<&'a [u8]>, EngineError> {
    match find_resource_leaf(
        view,
        resource_dir_rva,
        RT_MANIFEST,
        Some(CREATEPROCESS_MANIFEST_RESOURCE_ID),
    )? {
        Some((data_rva, size)) => Ok(Some(view.slice(data_rva as u64, size as u64)?)),
        None => Ok(None),
    }
}

/// A `VS_FIXEDFILEINFO` record, as embedded in the `RT_VERSION` resource.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct FixedFileInfo {
    /// File version, most significant 32 bits.
    pub file_version_ms: u32,
    /// File version, least significant 32 bits.
    pub file_version_ls: u32,
    /// Product version, most significant 32 bits.
    pub product_version_ms: u32,
    /// Product version, least significant 32 bits.
    pub product_version_ls: u32,
}

const VS_FFI_SIGNATURE: u32 = 0xFEEF04BD;

/// Locate and parse the first `VS_FIXEDFILEINFO` record in the `RT_VERSION`
/// resource. Returns `None` when the image has no version resource.
pub fn find_version_info(
    view: &ImageView,
    resource_dir_rva: u32,
) -> Result<Option<FixedFileInfo>, EngineError> {
    let Some((data_rva, size)) = find_resource_leaf(view, resource_dir_rva, RT_VERSION, None)?
    else {
        return Ok(None);
    };
    if size < 6 {
        return Ok(None);
    }
    let bytes = view.slice(data_rva as u64, size as u64)?;

    // VS_VERSIONINFO: wLength(u16) wValueLength(u16) wType(u16) then a
    // NUL-terminated UTF-16LE "VS_VERSION_INFO" key, padded to a 4-byte
    // boundary, then the VS_FIXEDFILEINFO struct itself (when wValueLength != 0).
    let value_length = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
    if value_length == 0 {
        return Ok(None);
    }
    // "VS_VERSION_INFO\0" is 16 UTF-16 code units => 32 bytes, header is 6 bytes,
    // total 38, already 4-byte aligned.
    let fixed_offset = 6 + 32;
    if bytes.len() < fixed_offset + 4 {
        return Ok(None);
    }
    let signature = u32::from_le_bytes(bytes[fixed_offset..fixed_offset + 4].try_into().unwrap());
    if signature != VS_FFI_SIGNATURE {
        return Ok(None);
    }
    // Signature(4) StrucVersion(4) then the four version words we care about.
    let base = fixed_offset + 8;
    if bytes.len() < base + 16 {
        return Ok(None);
    }
    let read_u32_at = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
    Ok(Some(FixedFileInfo {
        file_version_ms: read_u32_at(base),
        file_version_ls: read_u32_at(base + 4),
        product_version_ms: read_u32_at(base + 8),
        product_version_ls: read_u32_at(base + 12),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_resource_directory_yields_no_version_or_manifest() {
        let buf = vec![0u8; 0x1000];
        let view = ImageView::new(&buf, 0);
        assert!(find_version_info(&view, 0).unwrap().is_none());
        assert!(find_manifest_bytes(&view, 0).unwrap().is_none());
    }

    fn write_dir(buf: &mut [u8], rva: u32, entries: &[(u32, u32)]) {
        let base = rva as usize;
        buf[base + 12..base + 14].copy_from_slice(&0u16.to_le_bytes());
        buf[base + 14..base + 16].copy_from_slice(&(entries.len() as u16).to_le_bytes());
        for (i, (id, offset)) in entries.iter().enumerate() {
            let entry = base + 16 + i * 8;
            buf[entry..entry + 4].copy_from_slice(&id.to_le_bytes());
            buf[entry + 4..entry + 8].copy_from_slice(&offset.to_le_bytes());
        }
    }

    #[test]
    fn finds_a_manifest_resource_through_all_three_levels() {
        let mut buf = vec![0u8; 0x2000];
        let root = 0x100u32;
        let type_dir = 0x200u32;
        let name_dir = 0x300u32;
        let lang_dir = 0x400u32;
        let data_entry = 0x500u32;
        let payload_rva = 0x600u32;
        let payload = b"<assembly/>";

        write_dir(&mut buf, root, &[(RT_MANIFEST, HIGH_BIT | (type_dir - root))]);
        write_dir(
            &mut buf,
            type_dir,
            &[(CREATEPROCESS_MANIFEST_RESOURCE_ID, HIGH_BIT | (name_dir - root))],
        );
        write_dir(&mut buf, name_dir, &[(0, lang_dir - root)]);
        // lang_dir is an entry array pointing at the data entry, relative to
        // the resource directory root (no HIGH_BIT: a leaf, not a subdirectory).
        buf[lang_dir as usize + 16..lang_dir as usize + 20]
            .copy_from_slice(&(data_entry - root).to_le_bytes());
        buf[lang_dir as usize + 12..lang_dir as usize + 14].copy_from_slice(&0u16.to_le_bytes());
        buf[lang_dir as usize + 14..lang_dir as usize + 16].copy_from_slice(&1u16.to_le_bytes());

        buf[data_entry as usize..data_entry as usize + 4].copy_from_slice(&payload_rva.to_le_bytes());
        buf[data_entry as usize + 4..data_entry as usize + 8]
            .copy_from_slice(&(payload.len() as u32).to_le_bytes());
        buf[payload_rva as usize..payload_rva as usize + payload.len()].copy_from_slice(payload);

        let view = ImageView::new(&buf, 0);
        let bytes = find_manifest_bytes(&view, root).unwrap().unwrap();
        assert_eq!(bytes, payload);
    }
}
