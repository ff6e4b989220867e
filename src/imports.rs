//! Import & delay-import walker (Module E).
//!
//! Grounded on `get_imports`/`process_thunks32`/`process_thunks64` in
//! `pe32plus.c`. Standard and delay-load tables are walked independently and
//! each is isolated: a failure in one must not lose results already
//! collected from the other. Since every byte access here goes through
//! [`ImageView`] (Module A), the only way a walk can "fault" is an internal
//! invariant (an arithmetic overflow, a declared count too large) failing to
//! hold — there is no hardware fault to trap, so that isolation is modeled
//! as a `catch_unwind` boundary around each sub-walk instead of a signal handler.

use std::panic::{self, AssertUnwindSafe};

use serde::Serialize;

use crate::bounds::ImageView;
use crate::error::EngineError;

/// Sentinel for "no ordinal"/"no hint", matching `MAXDWORD32` in the source.
pub const NO_VALUE: u32 = 0xFFFF_FFFF;
/// Hard cap on the number of libraries walked per table.
pub const MAX_LIBRARIES: u32 = 4_096;
/// Hard cap on the number of thunks walked per library.
pub const MAX_THUNKS: u32 = 65_536;

const IMAGE_ORDINAL_FLAG32: u32 = 0x8000_0000;
const IMAGE_ORDINAL_FLAG64: u64 = 0x8000_0000_0000_0000;

/// One imported function.
#[derive(Debug, Clone, Serialize)]
pub struct ImportedFunction {
    /// Ordinal, or [`NO_VALUE`] for a name import.
    pub ordinal: u32,
    /// Index into the hint/name table, or [`NO_VALUE`] for an ordinal import.
    pub hint: u32,
    /// Imported name, `""` for ordinal imports, or the synthetic
    /// `"Error resolving function name"` when name resolution fails.
    pub name: String,
    /// Bound address from the IAT, when `TimeDateStamp != 0` made one available.
    pub bound: u64,
}

/// One imported library (standard or delay-load).
#[derive(Debug, Clone, Serialize)]
pub struct ImportedLibrary {
    /// The library's declared file name.
    pub name: String,
    /// `true` for a delay-load descriptor.
    pub delay: bool,
    /// Walked thunk entries for this library.
    pub functions: Vec<ImportedFunction>,
}

/// Combined result of walking both tables, plus the exception bitmask
/// spec.md's §4.E response carries: bit 0 = standard list faulted, bit 1 =
/// delay list faulted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportWalkResult {
    /// Every library walked, standard first then delay-load.
    pub libraries: Vec<ImportedLibrary>,
    /// Bitmask of which sub-walk(s) faulted.
    pub exception: u32,
}

struct ThunkWalkParams<'a> {
    view: &'a ImageView<'a>,
    thunk_table_rva: u64,
    bound_table_rva: Option<u64>,
    rva_based: bool,
    image_base: u64,
    is_64bit: bool,
}

fn walk_thunks(params: &ThunkWalkParams) -> Result<Vec<ImportedFunction>, EngineError> {
    let view = params.view;
    let thunk_size: u64 = if params.is_64bit { 8 } else { 4 };
    let bound_size: u64 = if params.is_64bit { 8 } else { 4 };

    let mut out = Vec::new();
    for i in 0..MAX_THUNKS {
        let thunk_addr = params.thunk_table_rva + i as u64 * thunk_size;
        let raw = if params.is_64bit {
            view.read_u64(thunk_addr)?
        } else {
            view.read_u32(thunk_addr)? as u64
        };
        if raw == 0 {
            break;
        }

        let bound = match params.bound_table_rva {
            Some(base) => {
                let addr = base + i as u64 * bound_size;
                if params.is_64bit {
                    view.read_u64(addr)?
                } else {
                    view.read_u32(addr)? as u64
                }
            }
            None => 0,
        };

        let is_ordinal = if params.is_64bit {
            raw & IMAGE_ORDINAL_FLAG64 != 0
        } else {
            raw & IMAGE_ORDINAL_FLAG32 as u64 != 0
        };

        if is_ordinal {
            out.push(ImportedFunction {
                ordinal: (raw & 0xFFFF) as u32,
                hint: NO_VALUE,
                name: String::new(),
                bound,
            });
            continue;
        }

        let ptr_addr: u64 = if params.rva_based {
            raw
        } else {
            raw.wrapping_sub(params.image_base)
        };

        let resolved = (|| -> Result<(u32, String), EngineError> {
            let hint = view.read_u16(ptr_addr)? as u32;
            let name = view.read_cstr(ptr_addr + 2, 4096)?;
            Ok((hint, name))
        })();

        match resolved {
            Ok((hint, name)) => out.push(ImportedFunction {
                ordinal: NO_VALUE,
                hint,
                name,
                bound,
            }),
            Err(_) => out.push(ImportedFunction {
                ordinal: NO_VALUE,
                hint: NO_VALUE,
                name: "Error resolving function name".to_string(),
                bound,
            }),
        }
    }
    Ok(out)
}

fn walk_standard_imports(
    view: &ImageView,
    dir_base: u32,
    image_size: u64,
    size_of_headers: u64,
    image_base: u64,
    is_64bit: bool,
) -> Result<Vec<ImportedLibrary>, EngineError> {
    let mut libraries = Vec::new();
    for c in 0..MAX_LIBRARIES {
        let descriptor = dir_base as u64 + c as u64 * 20;
        let original_first_thunk = view.read_u32(descriptor)? as u64;
        let time_date_stamp = view.read_u32(descriptor + 4)?;
        let name_rva = view.read_u32(descriptor + 12)?;
        let first_thunk = view.read_u32(descriptor + 16)? as u64;

        if name_rva == 0 && first_thunk == 0 {
            break;
        }

        let name = view.read_cstr(name_rva as u64, 4096)?;

        let thunk_table_rva = if original_first_thunk < size_of_headers || original_first_thunk > image_size {
            first_thunk
        } else {
            original_first_thunk
        };

        let bound_table_rva = if time_date_stamp != 0 { Some(first_thunk) } else { None };

        let functions = walk_thunks(&ThunkWalkParams {
            view,
            thunk_table_rva,
            bound_table_rva,
            rva_based: true,
            image_base,
            is_64bit,
        })?;

        libraries.push(ImportedLibrary { name, delay: false, functions });
    }
    Ok(libraries)
}

fn walk_delay_imports(
    view: &ImageView,
    dir_base: u32,
    image_base: u64,
    is_64bit: bool,
) -> Result<Vec<ImportedLibrary>, EngineError> {
    let mut libraries = Vec::new();
    for c in 0..MAX_LIBRARIES {
        let descriptor = dir_base as u64 + c as u64 * 32;
        let attributes_rva_based = view.read_u32(descriptor)? & 1 != 0;
        let dll_name_rva = view.read_u32(descriptor + 4)? as u64;
        let import_name_table_rva = view.read_u32(descriptor + 16)? as u64;
        let time_date_stamp = view.read_u32(descriptor + 28)?;
        let bound_iat_rva = view.read_u32(descriptor + 20)? as u64;

        if dll_name_rva == 0 {
            break;
        }

        let (name_addr, thunk_table_rva) = if attributes_rva_based {
            (dll_name_rva, import_name_table_rva)
        } else {
            (
                dll_name_rva.wrapping_sub(image_base),
                import_name_table_rva.wrapping_sub(image_base),
            )
        };

        let name = view.read_cstr(name_addr, 4096)?;

        let bound_table_rva = if time_date_stamp != 0 {
            Some(if attributes_rva_based {
                bound_iat_rva
            } else {
                bound_iat_rva.wrapping_sub(image_base)
            })
        } else {
            None
        };

        let functions = walk_thunks(&ThunkWalkParams {
            view,
            thunk_table_rva,
            bound_table_rva,
            rva_based: attributes_rva_based,
            image_base,
            is_64bit,
        })?;

        libraries.push(ImportedLibrary { name, delay: true, functions });
    }
    Ok(libraries)
}

/// Walk both the standard and delay-load import tables. Each is isolated: a
/// panic unwinding out of one walk is caught, recorded in the `exception`
/// bitmask, and does not prevent the other walk's results from being returned.
pub fn walk_imports(
    view: &ImageView,
    standard_dir: Option<(u32, u32)>,
    delay_dir: Option<(u32, u32)>,
    image_size: u64,
    size_of_headers: u64,
    image_base: u64,
    is_64bit: bool,
) -> ImportWalkResult {
    let mut result = ImportWalkResult::default();

    if let Some((dir_base, _size)) = standard_dir.filter(|(base, _)| *base > 0) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            walk_standard_imports(view, dir_base, image_size, size_of_headers, image_base, is_64bit)
        }));
        match outcome {
            Ok(Ok(libs)) => result.libraries.extend(libs),
            _ => result.exception |= 1,
        }
    }

    if let Some((dir_base, _size)) = delay_dir.filter(|(base, _)| *base > 0) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            walk_delay_imports(view, dir_base, image_base, is_64bit)
        }));
        match outcome {
            Ok(Ok(libs)) => result.libraries.extend(libs),
            _ => result.exception |= 2,
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w32(buf: &mut [u8], off: usize, v: u32) {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    #[test]
    fn walks_a_name_import_on_a_32bit_image() {
        let mut buf = vec![0u8; 0x1000];
        let dll_name_rva = 0x500u32;
        buf[dll_name_rva as usize..dll_name_rva as usize + 8].copy_from_slice(b"foo.dll\0");

        let descriptor = 0x100usize;
        w32(&mut buf, descriptor, 0x300); // OriginalFirstThunk
        w32(&mut buf, descriptor + 12, dll_name_rva); // Name
        w32(&mut buf, descriptor + 16, 0x300); // FirstThunk

        let thunk_rva = 0x300usize;
        w32(&mut buf, thunk_rva, 0x600); // points at IMAGE_IMPORT_BY_NAME
        let iibn = 0x600usize;
        buf[iibn] = 7; // Hint low byte
        buf[iibn + 2..iibn + 2 + 6].copy_from_slice(b"Write\0");

        let view = ImageView::new(&buf, 0);
        let libs = walk_standard_imports(&view, 0x100, buf.len() as u64, 0, 0, false).unwrap();
        assert_eq!(libs.len(), 1);
        assert_eq!(libs[0].name, "foo.dll");
        assert_eq!(libs[0].functions.len(), 1);
        assert_eq!(libs[0].functions[0].name, "Write");
        assert_eq!(libs[0].functions[0].hint, 7);
    }

    #[test]
    fn walks_an_ordinal_import_on_a_32bit_image() {
        let mut buf = vec![0u8; 0x1000];
        let dll_name_rva = 0x500u32;
        buf[dll_name_rva as usize..dll_name_rva as usize + 8].copy_from_slice(b"bar.dll\0");

        let descriptor = 0x100usize;
        w32(&mut buf, descriptor, 0); // force fallback to FirstThunk
        w32(&mut buf, descriptor + 12, dll_name_rva);
        w32(&mut buf, descriptor + 16, 0x300);

        let thunk_rva = 0x300usize;
        w32(&mut buf, thunk_rva, IMAGE_ORDINAL_FLAG32 | 42);

        let view = ImageView::new(&buf, 0);
        let libs = walk_standard_imports(&view, 0x100, buf.len() as u64, 0x400, 0, false).unwrap();
        assert_eq!(libs[0].functions[0].ordinal, 42);
        assert_eq!(libs[0].functions[0].hint, NO_VALUE);
    }

    #[test]
    fn combined_walk_reports_no_exception_bits_on_success() {
        let mut buf = vec![0u8; 0x1000];
        let dll_name_rva = 0x500u32;
        buf[dll_name_rva as usize..dll_name_rva as usize + 8].copy_from_slice(b"foo.dll\0");
        let descriptor = 0x100usize;
        w32(&mut buf, descriptor, 0);
        w32(&mut buf, descriptor + 12, dll_name_rva);
        w32(&mut buf, descriptor + 16, 0x300); // FirstThunk, used via fallback
        let thunk_rva = 0x300usize;
        w32(&mut buf, thunk_rva, IMAGE_ORDINAL_FLAG32 | 1);
        let view = ImageView::new(&buf, 0);
        let result = walk_imports(&view, Some((0x100, 0x20)), None, buf.len() as u64, 0x400, 0, false);
        assert_eq!(result.exception, 0);
        assert_eq!(result.libraries.len(), 1);
    }

    #[test]
    fn walks_a_delay_import_and_adopts_the_bound_iat_by_timestamp() {
        // IMAGE_DELAYLOAD_DESCRIPTOR: Attributes@0, DllNameRVA@4,
        // ModuleHandleRVA@8, ImportAddressTableRVA@12, ImportNameTableRVA@16,
        // BoundImportAddressTableRVA@20, UnloadInformationTableRVA@24,
        // TimeDateStamp@28.
        let mut buf = vec![0u8; 0x2000];
        let dll_name_rva = 0x700u32;
        buf[dll_name_rva as usize..dll_name_rva as usize + 8].copy_from_slice(b"baz.dll\0");

        let descriptor = 0x100usize;
        w32(&mut buf, descriptor, 1); // Attributes.RvaBased = 1
        w32(&mut buf, descriptor + 4, dll_name_rva); // DllNameRVA
        w32(&mut buf, descriptor + 16, 0x300); // ImportNameTableRVA
        w32(&mut buf, descriptor + 20, 0x400); // BoundImportAddressTableRVA
        w32(&mut buf, descriptor + 28, 0xCAFEBABEu32); // TimeDateStamp != 0

        let thunk_rva = 0x300usize;
        w32(&mut buf, thunk_rva, 0x600); // points at IMAGE_IMPORT_BY_NAME
        let iibn = 0x600usize;
        buf[iibn] = 9; // Hint low byte
        buf[iibn + 2..iibn + 2 + 4].copy_from_slice(b"Foo\0");

        let bound_rva = 0x400usize;
        w32(&mut buf, bound_rva, 0xDEAD_0000);

        let view = ImageView::new(&buf, 0);
        let libs = walk_delay_imports(&view, 0x100, 0, false).unwrap();
        assert_eq!(libs.len(), 1);
        assert_eq!(libs[0].name, "baz.dll");
        assert_eq!(libs[0].functions.len(), 1);
        assert_eq!(libs[0].functions[0].name, "Foo");
        assert_eq!(libs[0].functions[0].hint, 9);
        assert_eq!(libs[0].functions[0].bound, 0xDEAD_0000);
    }
}
