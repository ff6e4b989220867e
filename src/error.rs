use std::string::FromUtf8Error;
use thiserror::Error;

/// Every failure mode the engine can produce, from raw byte parsing up
/// through image-open and ApiSet resolution.
///
/// Variants map onto the wire status taxonomy in [`crate::protocol::status_for_error`];
/// this type itself carries no notion of the wire protocol.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A computed offset plus the requested length fell outside the buffer being read.
    #[error("offset {offset:#x} + {len:#x} is out of range")]
    OffsetOutOfRange {
        /// Offset that was attempted.
        offset: u64,
        /// Length of the requested read.
        len: u64,
    },
    /// The DOS header magic, `e_lfanew`, or the `PE\0\0` signature did not validate.
    #[error("missing or malformed PE signature")]
    MissingPeHeader,
    /// The COFF file header did not fit or failed to parse.
    #[error("missing or malformed COFF header")]
    MissingCoffHeader,
    /// Optional header `Magic` was neither `0x10B` nor `0x20B`.
    #[error("unrecognised optional header magic")]
    MissingMagicNumber,
    /// The optional header did not fit the space the COFF header declared for it.
    #[error("optional header is truncated or malformed")]
    BadOptionalHeader,
    /// A string field contained invalid UTF-8.
    #[error("malformed string: {0}")]
    BadString(#[from] FromUtf8Error),
    /// `SectionAlignment` or `FileAlignment` was zero.
    #[error("section or file alignment is zero")]
    BadAlignment,
    /// Section virtual addresses were not contiguous/ascending/aligned as required.
    #[error("section table is not contiguous at section {index}")]
    DiscontinuousSections {
        /// Index of the first section that broke continuity.
        index: usize,
    },
    /// The final virtual-size cursor did not equal `page_align(SizeOfImage)`.
    #[error("computed image size {computed:#x} does not match declared SizeOfImage {declared:#x}")]
    ImageSizeMismatch {
        /// Size computed by walking the section table.
        computed: u64,
        /// `page_align(SizeOfImage)` from the optional header.
        declared: u64,
    },
    /// A relocation block declared a type outside `{ABSOLUTE, HIGHLOW, DIR64}`.
    #[error("unsupported base relocation type {0:#x}")]
    UnsupportedRelocationType(u16),
    /// A relocation block's size was inconsistent with the directory.
    #[error("malformed base relocation block at rva {0:#x}")]
    MalformedRelocationBlock(u32),
    /// Underlying I/O failure opening or reading the target file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The requested virtual base (or the scan for one) could not be satisfied.
    #[error("unable to reserve an image buffer")]
    BufferReservationFailed,
    /// An ApiSet contract name failed the `API-`/`EXT-` prefix or version-suffix check.
    #[error("malformed apiset contract name")]
    InvalidContractName,
    /// No contract by that name exists in the namespace.
    #[error("apiset contract not present")]
    ApiSetNotPresent,
    /// The contract exists but its value is empty (present but not hosted).
    #[error("apiset contract present but not hosted")]
    ApiSetNotHosted,
    /// The namespace blob declared a `Version` field this engine does not understand.
    #[error("unsupported apiset namespace version {0:#x}")]
    UnsupportedApiSetVersion(u32),
    /// A parser-level invariant failed during a walk that the engine otherwise isolates.
    #[error("internal fault during {0} walk")]
    WalkFault(&'static str),
    /// No image is open for the session but the command requires one.
    #[error("no image open for this session")]
    NoContext,
    /// The target file does not exist or is not accessible at all.
    #[error("file not found: {0}")]
    FileNotFound(String),
    /// A scratch buffer (optional header + section table staging area) could not be sized.
    #[error("could not allocate scratch buffer")]
    ScratchAllocationFailed,
    /// The process-global support context has not been initialized via `init`.
    #[error("support context not allocated")]
    ContextNotAllocated,
    /// Request parameters were missing or malformed.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    /// First token of a request line did not match any known command.
    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;
