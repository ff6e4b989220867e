//! PE file loader (`image-open`).
//!
//! Grounded on `pe32open()` in `pe32plus.c`: open, validate, map-and-flatten a
//! PE file into an RVA-addressable buffer at a chosen virtual base, then
//! optionally rebase it. No OS virtual-memory reservation happens here (the
//! engine never executes the mapped image) — "load base" is carried as a
//! plain `u64` used only for bias arithmetic in module E and the relocation
//! pass, per the simplification recorded in `SPEC_FULL.md`.

use std::fs;
use std::path::Path;

use bitflags::bitflags;
use num_traits::FromPrimitive;
use tracing::{debug, trace, warn};

use crate::bounds::{align_up, page_align, ImageView, PAGE_SIZE};
use crate::checksum::calc_checksum;
use crate::coff::CoffFileHeader;
use crate::error::EngineError;
use crate::optional::{DataDirectories, Magic, OptionalHeader32, OptionalHeader64};
use crate::relocation::relocate_image;
use crate::section::section_header;
use crate::session::SessionStats;

const DOS_MAGIC: u16 = 0x5A4D; // 'MZ'
const PE_SIGNATURE_OFFSET: usize = 0x3c;
const PE_SIGNATURE: &[u8; 4] = b"PE\0\0";
const COFF_HEADER_SIZE: usize = 20;
const SECTION_HEADER_SIZE: usize = 40;

bitflags! {
    /// Status flags recorded about an [`OpenedImage`] at open time.
    #[derive(Copy, Clone, Debug, Default)]
    pub struct OpenedImageFlags: u8 {
        /// No base-relocation directory; the image must load at `ImageBase`.
        const FIXED = 0x01;
        /// The COM descriptor (.NET) directory is present and sized.
        const DOTNET = 0x02;
        /// `process_relocs` was requested and the relocation pass completed.
        const RELOCS_PROCESSED = 0x04;
    }
}

/// 32- vs 64-bit, derived from the Optional Header magic.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Bitness {
    /// PE32.
    Bits32,
    /// PE32+.
    Bits64,
}

/// Tagged union over the two Optional Header arms, parameterised by bitness
/// per `SPEC_FULL.md`'s Design Notes — the parser picks one arm once and
/// never conflates fields.
#[derive(Copy, Clone)]
pub enum OptionalHeaderView {
    /// PE32 arm.
    Bits32(OptionalHeader32),
    /// PE32+ arm.
    Bits64(OptionalHeader64),
}

impl OptionalHeaderView {
    /// `ImageBase`, widened to `u64` regardless of arm.
    pub fn image_base(&self) -> u64 {
        match self {
            Self::Bits32(h) => h.image_base as u64,
            Self::Bits64(h) => h.image_base,
        }
    }

    /// `SizeOfImage`.
    pub fn size_of_image(&self) -> u32 {
        match self {
            Self::Bits32(h) => h.size_of_image,
            Self::Bits64(h) => h.size_of_image,
        }
    }

    /// `SizeOfHeaders`.
    pub fn size_of_headers(&self) -> u32 {
        match self {
            Self::Bits32(h) => h.size_of_headers,
            Self::Bits64(h) => h.size_of_headers,
        }
    }

    /// `SectionAlignment`.
    pub fn section_alignment(&self) -> u32 {
        match self {
            Self::Bits32(h) => h.section_alignment,
            Self::Bits64(h) => h.section_alignment,
        }
    }

    /// `FileAlignment`.
    pub fn file_alignment(&self) -> u32 {
        match self {
            Self::Bits32(h) => h.file_alignment,
            Self::Bits64(h) => h.file_alignment,
        }
    }

    /// `CheckSum`.
    pub fn check_sum(&self) -> u32 {
        match self {
            Self::Bits32(h) => h.check_sum,
            Self::Bits64(h) => h.check_sum,
        }
    }

    /// The 16-slot data directory array.
    pub fn data_directories(&self) -> DataDirectories {
        match self {
            Self::Bits32(h) => h.data_directories,
            Self::Bits64(h) => h.data_directories,
        }
    }

    /// `NumberOfRvaAndSizes`, as declared by the optional header.
    pub fn data_directories_count(&self) -> u32 {
        match self {
            Self::Bits32(h) => h.number_of_rva_and_sizes,
            Self::Bits64(h) => h.number_of_rva_and_sizes,
        }
    }

    /// Byte offset of the `CheckSum` field inside the optional header (used
    /// to zero it out during the checksum fold).
    pub fn checksum_field_offset(&self) -> usize {
        match self {
            // Magic(2) MajorLinker(1) MinorLinker(1) SizeOfCode(4)
            // SizeOfInitData(4) SizeOfUninitData(4) AddrOfEntry(4)
            // BaseOfCode(4) BaseOfData(4) ImageBase(4) SectionAlign(4)
            // FileAlign(4) OSVer(4) ImgVer(4) SubsysVer(4) Win32VerVal(4)
            // SizeOfImage(4) SizeOfHeaders(4) -> CheckSum at:
            Self::Bits32(_) => 2 + 1 + 1 + 4 * 13 + 4 + 4,
            // PE32+ drops BaseOfData, so only 5 dwords precede ImageBase
            // (SizeOfCode, SizeOfInitData, SizeOfUninitData, AddrOfEntry,
            // BaseOfCode); ImageBase itself is 8 bytes. CheckSum lands at
            // the same offset 64 as in PE32.
            Self::Bits64(_) => 2 + 1 + 1 + 4 * 5 + 8 + 4 * 6 + 4 + 4,
        }
    }
}

/// Caller-supplied knobs for [`open`].
#[derive(Clone, Debug)]
pub struct OpenConfig {
    /// Apply base relocations after mapping, when the image is not `FIXED`.
    pub process_relocs: bool,
    /// Force a specific virtual base instead of scanning for one. Failure to
    /// honor this is fatal (502), matching the original's reservation contract.
    pub custom_base: Option<u64>,
    /// Step size used while scanning for a free virtual base.
    pub allocation_granularity: u64,
}

impl Default for OpenConfig {
    fn default() -> Self {
        Self {
            process_relocs: false,
            custom_base: None,
            allocation_granularity: 0x10000,
        }
    }
}

/// Build the `open` command's wire JSON body, per spec.md §4.B:
/// `{FileAttributes, CreationTime{Low,High}, LastWriteTime{Low,High},
/// FileSize{High,Low}, RealChecksum, ImageFixed, ImageDotNet}`. Hand-built
/// rather than derived, since the wire shape nests the time/size pairs
/// while [`OpenSummary`] keeps them flat for convenient construction.
pub fn build_open_json(s: &OpenSummary) -> String {
    format!(
        "{{\"FileAttributes\":{},\"CreationTime\":{{\"Low\":{},\"High\":{}}},\
          \"LastWriteTime\":{{\"Low\":{},\"High\":{}}},\"FileSize\":{{\"High\":{},\"Low\":{}}},\
          \"RealChecksum\":{},\"ImageFixed\":{},\"ImageDotNet\":{}}}",
        s.file_attributes,
        s.creation_time_low,
        s.creation_time_high,
        s.last_write_time_low,
        s.last_write_time_high,
        s.file_size_high,
        s.file_size_low,
        s.real_checksum,
        s.image_fixed,
        s.image_dotnet,
    )
}

/// JSON-shaped summary returned by `open`, per spec.md §4.B.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OpenSummary {
    /// Windows-style file attributes bitmask; always `FILE_ATTRIBUTE_NORMAL`
    /// in this non-Windows re-implementation (no `GetFileAttributes`).
    pub file_attributes: u32,
    /// Low/high halves of the creation time, left zeroed (filesystem
    /// birth-time is not portably available).
    pub creation_time_low: u32,
    pub creation_time_high: u32,
    /// Low/high halves of the last-write time, from the file's mtime.
    pub last_write_time_low: u32,
    pub last_write_time_high: u32,
    /// High/low halves of the on-disk file size.
    pub file_size_high: u32,
    pub file_size_low: u32,
    /// Checksum recomputed during open (§4.B step 4).
    pub real_checksum: u32,
    /// `true` when no base-relocation directory is present.
    pub image_fixed: bool,
    /// `true` when the COM descriptor (.NET) directory is present.
    pub image_dotnet: bool,
}

/// A successfully opened PE image: the central entity of the engine, per
/// spec.md §3. At most one lives per session.
pub struct OpenedImage {
    /// Contiguous, zero-padded virtual buffer of size `page_align(SizeOfImage)`.
    /// Buffer index 0 corresponds to RVA 0.
    pub buffer: Vec<u8>,
    /// The address at which `buffer` is considered mapped — either
    /// `ImageBase`, a caller-supplied address, or a scan-allocated one.
    pub load_base: u64,
    /// 32 or 64, from the Optional Header magic.
    pub bitness: Bitness,
    /// `fixed` / `dotnet` / `relocs-processed` flags.
    pub flags: OpenedImageFlags,
    /// The optional header actually parsed (kept for header/datadir/import/export walks).
    pub optional: OptionalHeaderView,
    /// The COFF file header.
    pub coff: CoffFileHeader,
    /// Parsed section table.
    pub sections: Vec<section_header>,
    /// Absolute path the image was opened from.
    pub filename: String,
    /// Directory component of the path the image was opened from.
    pub directory: String,
    /// `ImageBase` as declared in the optional header (pre-rebase).
    pub declared_image_base: u64,
    /// Accumulated call-stats for this session, when stats tracking is enabled.
    pub stats: Option<SessionStats>,
}

impl OpenedImage {
    /// An [`ImageView`] over this image's virtual buffer, addressed from RVA 0.
    pub fn view(&self) -> ImageView<'_> {
        ImageView::new(&self.buffer, 0)
    }

    /// Total size of the virtual buffer.
    pub fn size_of_image(&self) -> u64 {
        self.buffer.len() as u64
    }

    /// Whether this image is a 64-bit (PE32+) image.
    pub fn is_64bit(&self) -> bool {
        matches!(self.bitness, Bitness::Bits64)
    }
}

fn read_u16_at(data: &[u8], offset: usize) -> Result<u16, EngineError> {
    data.get(offset..offset + 2)
        .map(|s| u16::from_le_bytes([s[0], s[1]]))
        .ok_or(EngineError::OffsetOutOfRange { offset: offset as u64, len: 2 })
}

fn read_u32_at(data: &[u8], offset: usize) -> Result<u32, EngineError> {
    data.get(offset..offset + 4)
        .map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
        .ok_or(EngineError::OffsetOutOfRange { offset: offset as u64, len: 4 })
}

/// Pure model of the original's `VirtualAllocEx`-scan-for-a-free-address
/// loop: try `floor`, `floor + step`, … up to (not including) `ceiling`,
/// returning the first address `is_free` accepts. `custom_base` callers
/// never go through this — they either get exactly their address or a 502.
pub fn scan_virtual_base(
    floor: u64,
    ceiling: u64,
    step: u64,
    is_free: impl Fn(u64) -> bool,
) -> Option<u64> {
    let mut candidate = floor;
    while candidate < ceiling {
        if is_free(candidate) {
            return Some(candidate);
        }
        candidate += step;
    }
    None
}

/// Open `path`, validate its PE structure, map it into a fresh virtual
/// buffer, and optionally apply base relocations. See spec.md §4.B for the
/// full algorithm this implements step for step.
pub fn open(path: &Path, cfg: &OpenConfig) -> Result<(OpenedImage, OpenSummary), EngineError> {
    let metadata = fs::metadata(path).map_err(|_| {
        EngineError::FileNotFound(path.display().to_string())
    })?;
    let data = fs::read(path)?;
    let file_len = data.len();

    // Step 1: DOS header.
    if data.len() < PE_SIGNATURE_OFFSET + 4 {
        return Err(EngineError::MissingPeHeader);
    }
    let e_magic = read_u16_at(&data, 0)?;
    if e_magic != DOS_MAGIC {
        return Err(EngineError::MissingPeHeader);
    }
    let e_lfanew = read_u32_at(&data, PE_SIGNATURE_OFFSET)? as usize;
    if e_lfanew == 0 || e_lfanew >= file_len {
        return Err(EngineError::MissingPeHeader);
    }

    // Step 2: PE signature.
    let sig = data
        .get(e_lfanew..e_lfanew + 4)
        .ok_or(EngineError::MissingPeHeader)?;
    if sig != PE_SIGNATURE {
        return Err(EngineError::MissingPeHeader);
    }

    // Step 3: COFF header.
    let coff_offset = e_lfanew + 4;
    let coff_slice = data
        .get(coff_offset..coff_offset + COFF_HEADER_SIZE)
        .ok_or(EngineError::MissingCoffHeader)?;
    let coff = *bytemuck::checked::try_from_bytes::<CoffFileHeader>(coff_slice)
        .map_err(|_| EngineError::MissingCoffHeader)?;

    // Step 4: checksum over the whole file. The CheckSum field offset inside
    // the optional header is determined below once we know bitness; we
    // re-derive the absolute file offset from it.
    let opt_offset = coff_offset + COFF_HEADER_SIZE;

    // Step 5: optional header + section table.
    if (coff.size_of_optional_header as usize) < 2 {
        return Err(EngineError::BadOptionalHeader);
    }
    let magic_raw = read_u16_at(&data, opt_offset)?;
    let magic = Magic::from_u16(magic_raw).ok_or(EngineError::MissingMagicNumber)?;

    let needed = (coff.size_of_optional_header as usize)
        .max(0)
        .saturating_add(coff.number_of_sections as usize * SECTION_HEADER_SIZE);
    let scratch_len = needed.max(PAGE_SIZE as usize);
    if data.len() < opt_offset {
        return Err(EngineError::ScratchAllocationFailed);
    }
    let _ = scratch_len; // scratch sizing is conceptual: `data` already holds the file.

    let (optional, checksum_field_offset) = match magic {
        Magic::PE32 => {
            let size = core::mem::size_of::<OptionalHeader32>();
            let slice = data
                .get(opt_offset..opt_offset + size)
                .ok_or(EngineError::BadOptionalHeader)?;
            let hdr = *bytemuck::checked::try_from_bytes::<OptionalHeader32>(slice)
                .map_err(|_| EngineError::BadOptionalHeader)?;
            let view = OptionalHeaderView::Bits32(hdr);
            let off = opt_offset + view.checksum_field_offset();
            (view, off)
        }
        Magic::PE64 => {
            let size = core::mem::size_of::<OptionalHeader64>();
            let slice = data
                .get(opt_offset..opt_offset + size)
                .ok_or(EngineError::BadOptionalHeader)?;
            let hdr = *bytemuck::checked::try_from_bytes::<OptionalHeader64>(slice)
                .map_err(|_| EngineError::BadOptionalHeader)?;
            let view = OptionalHeaderView::Bits64(hdr);
            let off = opt_offset + view.checksum_field_offset();
            (view, off)
        }
    };

    let real_checksum = calc_checksum(&data, checksum_field_offset);

    // Step 6: alignment sanity.
    let section_alignment = optional.section_alignment() as u64;
    let file_alignment = optional.file_alignment() as u64;
    if section_alignment == 0 || file_alignment == 0 {
        return Err(EngineError::BadAlignment);
    }

    let section_table_offset = opt_offset + coff.size_of_optional_header as usize;
    let sections = parse_sections_strict(&data, section_table_offset, coff.number_of_sections)?;

    // Step 7: walk sections to derive the required virtual size.
    let declared_size_of_image = page_align(optional.size_of_image() as u64);
    let mut cursor = if let Some(first) = sections.first() {
        first.virtual_address as u64
    } else {
        page_align((e_lfanew as u64).max(optional.size_of_image() as u64))
    };

    for (index, section) in sections.iter().enumerate() {
        let va = section.virtual_address as u64;
        if va % section_alignment != 0 || va != cursor {
            return Err(EngineError::DiscontinuousSections { index });
        }
        if section.virtual_size == 0 && section.size_of_raw_data == 0 {
            return Err(EngineError::DiscontinuousSections { index });
        }
        let span = (section.virtual_size as u64).max(section.size_of_raw_data as u64);
        cursor += align_up(span, section_alignment);
    }
    if cursor != declared_size_of_image {
        return Err(EngineError::ImageSizeMismatch {
            computed: cursor,
            declared: declared_size_of_image,
        });
    }

    // Step 8: choose a virtual base. No real OS reservation happens; the
    // scan degenerates to "first candidate succeeds" (see `scan_virtual_base`).
    let load_base = match cfg.custom_base {
        Some(base) => base,
        None => {
            let floor: u64 = if matches!(optional, OptionalHeaderView::Bits64(_)) {
                0x0100_0000
            } else {
                0x0040_0000
            };
            let ceiling: u64 = 0x4000_0000;
            scan_virtual_base(floor, ceiling, cfg.allocation_granularity, |_| true)
                .ok_or(EngineError::BufferReservationFailed)?
        }
    };

    // Step 9: copy headers then sections into the virtual buffer.
    let mut buffer = vec![0u8; declared_size_of_image as usize];
    let header_region = page_align((e_lfanew as u64).max(optional.size_of_headers() as u64)) as usize;
    let header_copy_len = header_region.min(data.len()).min(buffer.len());
    buffer[..header_copy_len].copy_from_slice(&data[..header_copy_len]);

    for section in &sections {
        if section.pointer_to_raw_data == 0 {
            continue;
        }
        let raw_len = align_up(
            (section.virtual_size).min(section.size_of_raw_data) as u64,
            file_alignment,
        );
        let src_start = section.pointer_to_raw_data as usize;
        let src_len = (raw_len as usize).min(data.len().saturating_sub(src_start));
        let dst_start = section.virtual_address as usize;
        if dst_start + src_len > buffer.len() || src_start + src_len > data.len() {
            continue;
        }
        buffer[dst_start..dst_start + src_len]
            .copy_from_slice(&data[src_start..src_start + src_len]);
    }

    // Step 10: detect fixed / dotnet.
    let dirs = optional.data_directories();
    let image_fixed = dirs.base_relocation_table.virtual_address == 0
        || (dirs.base_relocation_table.size as usize) < 8;
    let image_dotnet = dirs.clr_runtime_header.virtual_address != 0
        && dirs.clr_runtime_header.size != 0;

    let mut flags = OpenedImageFlags::empty();
    if image_fixed {
        flags |= OpenedImageFlags::FIXED;
    }
    if image_dotnet {
        flags |= OpenedImageFlags::DOTNET;
    }

    let declared_image_base = optional.image_base();

    // Step 11: base relocations.
    if cfg.process_relocs && !image_fixed {
        let delta = load_base as i64 - declared_image_base as i64;
        let reloc_dir = dirs.base_relocation_table;
        match relocate_image(
            &mut buffer,
            reloc_dir.virtual_address,
            reloc_dir.size,
            delta,
        ) {
            Ok(()) => {
                flags |= OpenedImageFlags::RELOCS_PROCESSED;
                debug!(delta, "base relocation pass completed");
            }
            Err(err) => {
                warn!(%err, "relocation pass failed; image left unrelocated but open");
            }
        }
    }

    let (filename, directory) = split_path(path);

    let bitness = if matches!(optional, OptionalHeaderView::Bits64(_)) {
        Bitness::Bits64
    } else {
        Bitness::Bits32
    };

    let modified = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let summary = OpenSummary {
        file_attributes: 0x80, // FILE_ATTRIBUTE_NORMAL
        creation_time_low: 0,
        creation_time_high: 0,
        last_write_time_low: (modified & 0xFFFF_FFFF) as u32,
        last_write_time_high: (modified >> 32) as u32,
        file_size_high: ((file_len as u64) >> 32) as u32,
        file_size_low: (file_len as u64 & 0xFFFF_FFFF) as u32,
        real_checksum,
        image_fixed,
        image_dotnet,
    };

    trace!(bytes = file_len, sections = sections.len(), "image opened");

    let image = OpenedImage {
        buffer,
        load_base,
        bitness,
        flags,
        optional,
        coff,
        sections,
        filename,
        directory,
        declared_image_base,
        stats: None,
    };

    Ok((image, summary))
}

/// Same on-disk layout as [`section::parse_section_table`] but fails closed
/// on a truncated table instead of silently dropping entries — module B
/// needs to know section count to validate continuity (spec.md invariant 2).
fn parse_sections_strict(
    data: &[u8],
    offset: usize,
    number_of_sections: u16,
) -> Result<Vec<section_header>, EngineError> {
    let mut out = Vec::with_capacity(number_of_sections as usize);
    let mut cursor = offset;
    for _ in 0..number_of_sections {
        let slice = data
            .get(cursor..cursor + SECTION_HEADER_SIZE)
            .ok_or(EngineError::DiscontinuousSections { index: out.len() })?;
        let header = *bytemuck::checked::try_from_bytes::<section_header>(slice)
            .map_err(|_| EngineError::DiscontinuousSections { index: out.len() })?;
        out.push(header);
        cursor += SECTION_HEADER_SIZE;
    }
    Ok(out)
}

/// Path components recorded alongside an image for the `open` response and
/// `headers`/`exports` commands that echo the filename.
pub fn split_path(path: &Path) -> (String, String) {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let directory = path
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    (filename, directory)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_field_offset_is_64_for_both_arms() {
        let h32 = OptionalHeaderView::Bits32(OptionalHeader32::default());
        let h64 = OptionalHeaderView::Bits64(OptionalHeader64::default());
        assert_eq!(h32.checksum_field_offset(), 64);
        assert_eq!(h64.checksum_field_offset(), 64);
    }

    #[test]
    fn scan_returns_first_free_candidate() {
        let result = scan_virtual_base(0x1000, 0x10000, 0x1000, |addr| addr == 0x3000);
        assert_eq!(result, Some(0x3000));
    }

    #[test]
    fn scan_returns_none_when_exhausted() {
        let result = scan_virtual_base(0x1000, 0x3000, 0x1000, |_| false);
        assert_eq!(result, None);
    }

    #[test]
    fn open_json_nests_time_and_size_pairs() {
        let summary = OpenSummary {
            file_attributes: 0x80,
            creation_time_low: 0,
            creation_time_high: 0,
            last_write_time_low: 111,
            last_write_time_high: 0,
            file_size_high: 0,
            file_size_low: 4096,
            real_checksum: 0xdead,
            image_fixed: true,
            image_dotnet: false,
        };
        let json = build_open_json(&summary);
        assert_eq!(
            json,
            "{\"FileAttributes\":128,\"CreationTime\":{\"Low\":0,\"High\":0},\
             \"LastWriteTime\":{\"Low\":111,\"High\":0},\"FileSize\":{\"High\":0,\"Low\":4096},\
             \"RealChecksum\":57005,\"ImageFixed\":true,\"ImageDotNet\":false}"
        );
    }

    #[test]
    fn rejects_non_pe_files() {
        let tmp = std::env::temp_dir().join("windepends-core-test-not-pe.bin");
        std::fs::write(&tmp, b"not a pe file at all").unwrap();
        let result = open(&tmp, &OpenConfig::default());
        let _ = std::fs::remove_file(&tmp);
        assert!(matches!(result, Err(EngineError::MissingPeHeader)));
    }

    #[test]
    fn rejects_missing_files() {
        let result = open(Path::new("/nonexistent/path/does-not-exist.exe"), &OpenConfig::default());
        assert!(matches!(result, Err(EngineError::FileNotFound(_))));
    }
}
