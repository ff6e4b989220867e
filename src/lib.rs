//! # windepends-core: a PE analysis engine and `WDEP/1.0` protocol server.
//!
//! Parses Portable Executable headers, import/export/delay-import tables,
//! resource version and manifest data, and resolves Windows ApiSet contract
//! names, exposing all of it behind a small newline-framed wire protocol
//! (see [`protocol`] and [`server`]) so a separate driver process can query a
//! target binary without loading it in-process.
//!
//! ## Examples
//! ```
//! # use std::{fs, io};
//! use windepends_core::pe::parse_portable_executable;
//!
//! # fn main() -> io::Result<()> {
//! # let path_to_pe = "tests/pe/64_pe/64_pe_checksum_non_zero.dat";
//! // Read the binary from a file
//! let binary = fs::read(path_to_pe)?;
//!
//! // Parse it!
//! let pe = parse_portable_executable(binary.as_slice())?;
//! // Print all that technical goodness
//! print!("{}", pe);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

/// Bounds-checked access to a mapped image buffer (the sole gateway to it).
pub mod bounds;
/// PE checksum algorithm.
pub mod checksum;
/// COFF file header definitions and helper functions.
pub mod coff;
/// Engine-wide error type.
pub mod error;
/// Export directory walking.
pub mod exports;
/// Header/data-directory JSON response assembly.
pub mod headers;
/// Opened-image state and the `open` algorithm.
pub mod image;
/// Import and delay-import directory walking.
pub mod imports;
/// KnownDlls data model and fixture source.
pub mod knowndlls;
/// Optional header definitions and helper functions.
pub mod optional;
/// Request parameter tokenizer.
pub mod params;
/// Monolith struct containing all the information
/// you will ever need
pub mod pe;
/// `WDEP/1.0` wire status lines and error-to-status mapping.
pub mod protocol;
/// Base relocation processing.
pub mod relocation;
/// Resource directory walking (version info, manifest).
pub mod resources;
/// Ordered response-chunk assembly.
pub mod rope;
/// Section header definitions and helper functions.
pub mod section;
/// Per-command request handlers.
pub mod server;
/// Process-global support context and per-connection session state.
pub mod session;
/// UTF-16LE line framing.
pub mod wire;

/// Windows ApiSet namespace parsing and contract resolution.
pub mod apiset;
