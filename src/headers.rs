//! Header / data-directory JSON response builder (Module C).
//!
//! Grounded on `pe32plus.c`'s header-dump path: emit `ImageFileHeader` and
//! `ImageOptionalHeader` with every field of the parsed structures, then a
//! `DebugDirectory` array, a `Version` object pulled from the resource tree,
//! the `dllcharex` word, and — only for a non-native, non-DLL, non-native-
//! subsystem image — a base64 manifest. `datadirs` is the separate, smaller
//! 16-slot array endpoint with no surrounding context.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::bounds::ByteReader;
use crate::coff::CoffFileHeader;
use crate::error::EngineError;
use crate::image::{OpenedImage, OptionalHeaderView};
use crate::optional::{DataDirectories, DataDirectory, Optional, OptionalHeader32, OptionalHeader64, Subsystem};
use crate::protocol::json_escape;
use crate::resources;
use crate::rope::ResponseRope;

const DEBUG_DIRECTORY_ENTRY_SIZE: u64 = 28;
/// `IMAGE_DEBUG_TYPE_EX_DLLCHARACTERISTICS`.
const EX_DLLCHARACTERISTICS: u32 = 20;

fn image_file_header_json(coff: &CoffFileHeader) -> String {
    format!(
        "{{\"Machine\":{},\"NumberOfSections\":{},\"TimeDateStamp\":{},\
          \"PointerToSymbolTable\":{},\"NumberOfSymbols\":{},\
          \"SizeOfOptionalHeader\":{},\"Characteristics\":{}}}",
        coff.machine,
        coff.number_of_sections,
        coff.time_date_stamp,
        coff.pointer_to_symbol_table,
        coff.number_of_symbols,
        coff.size_of_optional_header,
        coff.characteristics
    )
}

fn optional_header_json(optional: &OptionalHeaderView) -> String {
    match optional {
        OptionalHeaderView::Bits32(h) => optional_header_32_json(h),
        OptionalHeaderView::Bits64(h) => optional_header_64_json(h),
    }
}

fn optional_header_32_json(h: &OptionalHeader32) -> String {
    format!(
        "{{\"Magic\":{},\"MajorLinkerVersion\":{},\"MinorLinkerVersion\":{},\
          \"SizeOfCode\":{},\"SizeOfInitializedData\":{},\"SizeOfUninitializedData\":{},\
          \"AddressOfEntryPoint\":{},\"BaseOfCode\":{},\"BaseOfData\":{},\"ImageBase\":{},\
          \"SectionAlignment\":{},\"FileAlignment\":{},\
          \"MajorOperatingSystemVersion\":{},\"MinorOperatingSystemVersion\":{},\
          \"MajorImageVersion\":{},\"MinorImageVersion\":{},\
          \"MajorSubsystemVersion\":{},\"MinorSubsystemVersion\":{},\
          \"Win32VersionValue\":{},\"SizeOfImage\":{},\"SizeOfHeaders\":{},\"CheckSum\":{},\
          \"Subsystem\":{},\"DllCharacteristics\":{},\
          \"SizeOfStackReserve\":{},\"SizeOfStackCommit\":{},\
          \"SizeOfHeapReserve\":{},\"SizeOfHeapCommit\":{},\
          \"LoaderFlags\":{},\"NumberOfRvaAndSizes\":{}}}",
        h.magic,
        h.major_linker_version,
        h.minor_linker_version,
        h.size_of_code,
        h.size_of_initialized_data,
        h.size_of_uninitialized_data,
        h.address_of_entry_point,
        h.base_of_code,
        h.base_of_data,
        h.image_base,
        h.section_alignment,
        h.file_alignment,
        h.major_operating_system_version,
        h.minor_operating_system_version,
        h.major_image_version,
        h.minor_image_version,
        h.major_subsystem_version,
        h.minor_subsystem_version,
        h.win32_version_value,
        h.size_of_image,
        h.size_of_headers,
        h.check_sum,
        h.subsystem,
        h.dll_characteristics,
        h.size_of_stack_reserve,
        h.size_of_stack_commit,
        h.size_of_heap_reserve,
        h.size_of_heap_commit,
        h.loader_flags,
        h.number_of_rva_and_sizes
    )
}

fn optional_header_64_json(h: &OptionalHeader64) -> String {
    format!(
        "{{\"Magic\":{},\"MajorLinkerVersion\":{},\"MinorLinkerVersion\":{},\
          \"SizeOfCode\":{},\"SizeOfInitializedData\":{},\"SizeOfUninitializedData\":{},\
          \"AddressOfEntryPoint\":{},\"BaseOfCode\":{},\"ImageBase\":{},\
          \"SectionAlignment\":{},\"FileAlignment\":{},\
          \"MajorOperatingSystemVersion\":{},\"MinorOperatingSystemVersion\":{},\
          \"MajorImageVersion\":{},\"MinorImageVersion\":{},\
          \"MajorSubsystemVersion\":{},\"MinorSubsystemVersion\":{},\
          \"Win32VersionValue\":{},\"SizeOfImage\":{},\"SizeOfHeaders\":{},\"CheckSum\":{},\
          \"Subsystem\":{},\"DllCharacteristics\":{},\
          \"SizeOfStackReserve\":{},\"SizeOfStackCommit\":{},\
          \"SizeOfHeapReserve\":{},\"SizeOfHeapCommit\":{},\
          \"LoaderFlags\":{},\"NumberOfRvaAndSizes\":{}}}",
        h.magic,
        h.major_linker_version,
        h.minor_linker_version,
        h.size_of_code,
        h.size_of_initialized_data,
        h.size_of_uninitialized_data,
        h.address_of_entry_point,
        h.base_of_code,
        h.image_base,
        h.section_alignment,
        h.file_alignment,
        h.major_operating_system_version,
        h.minor_operating_system_version,
        h.major_image_version,
        h.minor_image_version,
        h.major_subsystem_version,
        h.minor_subsystem_version,
        h.win32_version_value,
        h.size_of_image,
        h.size_of_headers,
        h.check_sum,
        h.subsystem,
        h.dll_characteristics,
        h.size_of_stack_reserve,
        h.size_of_stack_commit,
        h.size_of_heap_reserve,
        h.size_of_heap_commit,
        h.loader_flags,
        h.number_of_rva_and_sizes
    )
}

struct DebugEntry {
    characteristics: u32,
    time_date_stamp: u32,
    major_version: u16,
    minor_version: u16,
    entry_type: u32,
    size_of_data: u32,
    address_of_raw_data: u32,
    pointer_to_raw_data: u32,
}

fn read_debug_entry(buffer: &[u8], offset: usize) -> Result<DebugEntry, EngineError> {
    Ok(DebugEntry {
        characteristics: buffer.read_u32(offset)?,
        time_date_stamp: buffer.read_u32(offset + 4)?,
        major_version: buffer.read_u16(offset + 8)?,
        minor_version: buffer.read_u16(offset + 10)?,
        entry_type: buffer.read_u32(offset + 12)?,
        size_of_data: buffer.read_u32(offset + 16)?,
        address_of_raw_data: buffer.read_u32(offset + 20)?,
        pointer_to_raw_data: buffer.read_u32(offset + 24)?,
    })
}

/// Walk the debug data directory, returning each `IMAGE_DEBUG_DIRECTORY`
/// record that fits entirely inside it. A record that doesn't fit ends the
/// walk rather than aborting the whole response.
fn walk_debug_directory(image: &OpenedImage, dir: DataDirectory) -> Vec<DebugEntry> {
    if dir.size == 0 {
        return Vec::new();
    }
    let count = dir.size as u64 / DEBUG_DIRECTORY_ENTRY_SIZE;
    let mut entries = Vec::new();
    for i in 0..count {
        let offset = dir.virtual_address as u64 + i * DEBUG_DIRECTORY_ENTRY_SIZE;
        let Some(offset) = usize::try_from(offset).ok() else { break };
        let Ok(entry) = read_debug_entry(&image.buffer, offset) else { break };
        entries.push(entry);
    }
    entries
}

fn debug_directory_json(entries: &[DebugEntry]) -> String {
    let mut out = String::from("[");
    for (i, e) in entries.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&format!(
            "{{\"Characteristics\":{},\"TimeDateStamp\":{},\"MajorVersion\":{},\
              \"MinorVersion\":{},\"Type\":{},\"SizeOfData\":{},\
              \"AddressOfRawData\":{},\"PointerToRawData\":{}}}",
            e.characteristics,
            e.time_date_stamp,
            e.major_version,
            e.minor_version,
            e.entry_type,
            e.size_of_data,
            e.address_of_raw_data,
            e.pointer_to_raw_data
        ));
    }
    out.push(']');
    out
}

/// The `DWORD` from the first `EX_DLLCHARACTERISTICS` debug record, if any,
/// whose `AddressOfRawData` lies within `[0, SizeOfImage - 4)`.
fn find_dllcharex(image: &OpenedImage, entries: &[DebugEntry]) -> Option<u32> {
    let size_of_image = image.size_of_image();
    if size_of_image < 4 {
        return None;
    }
    entries
        .iter()
        .find(|e| e.entry_type == EX_DLLCHARACTERISTICS)
        .and_then(|e| {
            let addr = e.address_of_raw_data as u64;
            if addr >= size_of_image - 4 {
                return None;
            }
            image.buffer.read_u32(addr as usize).ok()
        })
}

fn version_json(version: Option<resources::FixedFileInfo>) -> String {
    match version {
        None => "null".to_string(),
        Some(v) => format!(
            "{{\"FileVersionMS\":{},\"FileVersionLS\":{},\
              \"ProductVersionMS\":{},\"ProductVersionLS\":{}}}",
            v.file_version_ms, v.file_version_ls, v.product_version_ms, v.product_version_ls
        ),
    }
}

/// `true` when the image qualifies for manifest emission: a non-native
/// executable image that is neither a DLL nor itself native-subsystem.
fn wants_manifest(image: &OpenedImage) -> bool {
    use crate::coff::Characteristics;

    let is_dll = image
        .coff
        .get_characteristics()
        .is_some_and(|c| c.contains(Characteristics::IMAGE_FILE_DLL));
    if is_dll {
        return false;
    }
    let is_executable = image
        .coff
        .get_characteristics()
        .is_some_and(|c| c.contains(Characteristics::IMAGE_FILE_EXECUTABLE_IMAGE));
    if !is_executable {
        return false;
    }
    let subsystem = match &image.optional {
        OptionalHeaderView::Bits32(h) => h.get_subsystem(),
        OptionalHeaderView::Bits64(h) => h.get_subsystem(),
    };
    !matches!(subsystem, Some(Subsystem::Native))
}

fn data_directory_by_index(dirs: &DataDirectories, index: usize) -> Option<DataDirectory> {
    Some(match index {
        0 => dirs.export_table,
        1 => dirs.import_table,
        2 => dirs.resource_table,
        3 => dirs.exception_table,
        4 => dirs.certificate_table,
        5 => dirs.base_relocation_table,
        6 => dirs.debug,
        7 => dirs.architecture,
        8 => dirs.global_ptr,
        9 => dirs.tls_table,
        10 => dirs.load_config_table,
        11 => dirs.bound_import,
        12 => dirs.import_address_table,
        13 => dirs.delay_import_descriptor,
        14 => dirs.clr_runtime_header,
        15 => dirs.reserved,
        _ => return None,
    })
}

/// Build the `headers` command's JSON response body.
pub fn build_headers_json(image: &OpenedImage) -> Result<String, EngineError> {
    let dirs = image.optional.data_directories();
    let debug_entries = walk_debug_directory(image, dirs.debug);
    let version = resources::find_version_info(&image.view(), dirs.resource_table.virtual_address)?;
    let dllcharex = find_dllcharex(image, &debug_entries);

    let mut rope = ResponseRope::new();
    rope.push("{\"ImageFileHeader\":")
        .push_owned(image_file_header_json(&image.coff))
        .push(",\"ImageOptionalHeader\":")
        .push_owned(optional_header_json(&image.optional))
        .push(",\"DebugDirectory\":")
        .push_owned(debug_directory_json(&debug_entries))
        .push(",\"Version\":")
        .push_owned(version_json(version))
        .push(",\"dllcharex\":")
        .push_owned(match dllcharex {
            Some(v) => v.to_string(),
            None => "null".to_string(),
        });

    if wants_manifest(image) {
        if let Some(bytes) = resources::find_manifest_bytes(&image.view(), dirs.resource_table.virtual_address)? {
            rope.push(",\"Manifest\":\"")
                .push_owned(json_escape(&BASE64.encode(bytes)))
                .push("\"");
        }
    }
    rope.push("}");
    Ok(rope.finish())
}

/// Build the `datadirs` command's JSON response body: the 16-slot data
/// directory array, capped defensively at 256 entries, with no surrounding
/// image context. The data directory struct itself carries exactly 16
/// slots, so the 256 cap never binds in practice — it exists purely as a
/// defensive bound against a future wider layout.
pub fn build_datadirs_json(image: &OpenedImage) -> String {
    let dirs = image.optional.data_directories();
    const SLOT_COUNT: usize = 16;
    let count = SLOT_COUNT.min(256);

    let mut out = String::from("[");
    for i in 0..count {
        let Some(dir) = data_directory_by_index(&dirs, i) else { break };
        if i > 0 {
            out.push(',');
        }
        out.push_str(&format!(
            "{{\"vaddress\":{},\"size\":{}}}",
            dir.virtual_address, dir.size
        ));
    }
    out.push(']');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coff::CoffFileHeader;
    use crate::image::{Bitness, OpenedImageFlags};
    use crate::optional::OptionalHeader32;
    use crate::section::section_header;

    fn blank_image() -> OpenedImage {
        OpenedImage {
            buffer: vec![0u8; 0x2000],
            load_base: 0x1_0000,
            bitness: Bitness::Bits32,
            flags: OpenedImageFlags::empty(),
            optional: OptionalHeaderView::Bits32(OptionalHeader32 {
                magic: 0x10b,
                size_of_image: 0x2000,
                ..Default::default()
            }),
            coff: CoffFileHeader {
                characteristics: crate::coff::Characteristics::IMAGE_FILE_EXECUTABLE_IMAGE.bits(),
                ..Default::default()
            },
            sections: Vec::<section_header>::new(),
            filename: "test.exe".to_string(),
            directory: ".".to_string(),
            declared_image_base: 0x40_0000,
            stats: None,
        }
    }

    #[test]
    fn headers_json_contains_both_sub_objects() {
        let image = blank_image();
        let json = build_headers_json(&image).unwrap();
        assert!(json.contains("\"ImageFileHeader\""));
        assert!(json.contains("\"ImageOptionalHeader\""));
        assert!(json.contains("\"DebugDirectory\":[]"));
        assert!(json.contains("\"Version\":null"));
    }

    #[test]
    fn datadirs_json_has_sixteen_slots() {
        let image = blank_image();
        let json = build_datadirs_json(&image);
        assert_eq!(json.matches("vaddress").count(), 16);
    }

    #[test]
    fn manifest_is_omitted_for_a_native_subsystem_image() {
        let mut image = blank_image();
        if let OptionalHeaderView::Bits32(ref mut h) = image.optional {
            h.subsystem = Subsystem::Native as u16;
        }
        assert!(!wants_manifest(&image));
    }

    #[test]
    fn manifest_is_wanted_for_a_gui_executable() {
        let mut image = blank_image();
        if let OptionalHeaderView::Bits32(ref mut h) = image.optional {
            h.subsystem = Subsystem::WindowsGUI as u16;
        }
        assert!(wants_manifest(&image));
    }
}
