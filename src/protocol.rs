//! `WDEP/1.0` wire status lines and JSON string escaping.
//!
//! Grounded on the `WDEP_STATUS_*` literals in `pe32plus.h`. Every response
//! begins with exactly one of these lines, CRLF-terminated; everything after
//! it is the response body (empty for bare errors, a JSON object for `200`
//! bodies).

use crate::error::EngineError;

/// One `WDEP/1.0` status line, CRLF-terminated, as sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLine {
    /// `200 OK`
    Ok,
    /// `208 Unknown data format`
    UnknownDataFormat,
    /// `400 Invalid parameters received`
    InvalidParameters,
    /// `403 Can not read file headers`
    CannotReadFileHeaders,
    /// `404 File not found or can not be accessed`
    FileNotFound,
    /// `405 Command unknown or not allowed`
    CommandUnknown,
    /// `415 Invalid file headers or signatures`
    InvalidFileHeaders,
    /// `500 Can not allocate resources`
    CannotAllocateResources,
    /// `501 Context not allocated`
    ContextNotAllocated,
    /// `502 Image buffer not allocated`
    ImageBufferNotAllocated,
    /// `600 Exception`
    Exception,
}

impl StatusLine {
    /// The exact CRLF-terminated text sent on the wire.
    pub fn as_wire_str(self) -> &'static str {
        match self {
            Self::Ok => "WDEP/1.0 200 OK\r\n",
            Self::UnknownDataFormat => "WDEP/1.0 208 Unknown data format\r\n",
            Self::InvalidParameters => "WDEP/1.0 400 Invalid parameters received\r\n",
            Self::CannotReadFileHeaders => "WDEP/1.0 403 Can not read file headers\r\n",
            Self::FileNotFound => "WDEP/1.0 404 File not found or can not be accessed\r\n",
            Self::CommandUnknown => "WDEP/1.0 405 Command unknown or not allowed\r\n",
            Self::InvalidFileHeaders => "WDEP/1.0 415 Invalid file headers or signatures\r\n",
            Self::CannotAllocateResources => "WDEP/1.0 500 Can not allocate resources\r\n",
            Self::ContextNotAllocated => "WDEP/1.0 501 Context not allocated\r\n",
            Self::ImageBufferNotAllocated => "WDEP/1.0 502 Image buffer not allocated\r\n",
            Self::Exception => "WDEP/1.0 600 Exception\r\n",
        }
    }

    /// The numeric status code alone, for logging.
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::UnknownDataFormat => 208,
            Self::InvalidParameters => 400,
            Self::CannotReadFileHeaders => 403,
            Self::FileNotFound => 404,
            Self::CommandUnknown => 405,
            Self::InvalidFileHeaders => 415,
            Self::CannotAllocateResources => 500,
            Self::ContextNotAllocated => 501,
            Self::ImageBufferNotAllocated => 502,
            Self::Exception => 600,
        }
    }
}

/// Map an [`EngineError`] onto the wire status it should produce.
///
/// Both ApiSet `NOT_PRESENT` and `NOT_HOSTED` collapse onto the same `500`
/// status — there is no wire-level distinction between "no such contract"
/// and "contract present but unmapped"; the caller must consult the JSON
/// body (or, for these two cases, a plain error string) to tell them apart.
pub fn status_for_error(err: &EngineError) -> StatusLine {
    match err {
        EngineError::FileNotFound(_) => StatusLine::FileNotFound,
        EngineError::MissingPeHeader
        | EngineError::MissingCoffHeader
        | EngineError::MissingMagicNumber
        | EngineError::BadOptionalHeader
        | EngineError::BadAlignment
        | EngineError::DiscontinuousSections { .. }
        | EngineError::ImageSizeMismatch { .. } => StatusLine::InvalidFileHeaders,
        EngineError::InvalidParameters(_) => StatusLine::InvalidParameters,
        EngineError::UnknownCommand(_) => StatusLine::CommandUnknown,
        // No image open for this session — the original's per-connection
        // `module_ctx == NULL` check in `get_headers`/`get_imports`/
        // `get_exports`/`get_datadirs`/`cmd_callstats`, which replies 501.
        EngineError::NoContext => StatusLine::ContextNotAllocated,
        // The process-global support context (`gsup.Initialized == FALSE`)
        // is what the original's `cmd_query_knowndlls_list`/
        // `cmd_apisetnamespace_info`/`cmd_set_apisetmap_src` guard with a
        // bare 500, not 501 — that status is reserved for the per-session
        // case above.
        EngineError::ContextNotAllocated => StatusLine::CannotAllocateResources,
        // The image buffer itself could not be reserved during `open`
        // (spec.md §4.B: "502 the image buffer could not be reserved").
        EngineError::BufferReservationFailed => StatusLine::ImageBufferNotAllocated,
        // Scratch buffer (optional header + section table staging area)
        // exhaustion — spec.md §4.B: "500 resource exhaustion for the
        // scratch buffer".
        EngineError::ScratchAllocationFailed => StatusLine::CannotAllocateResources,
        EngineError::ApiSetNotPresent | EngineError::ApiSetNotHosted => {
            StatusLine::CannotAllocateResources
        }
        EngineError::InvalidContractName => StatusLine::InvalidParameters,
        EngineError::UnsupportedApiSetVersion(_) => StatusLine::UnknownDataFormat,
        EngineError::OffsetOutOfRange { .. }
        | EngineError::BadString(_)
        | EngineError::UnsupportedRelocationType(_)
        | EngineError::MalformedRelocationBlock(_)
        | EngineError::WalkFault(_) => StatusLine::Exception,
        EngineError::Io(_) => StatusLine::FileNotFound,
    }
}

/// Escape `s` for embedding as a JSON string value, per RFC 8259 — the
/// engine assembles response bodies by hand (§ rope/response assembly), so
/// this is the one place untrusted strings (file names, export/import
/// names, forwarder targets) must be made safe before they hit the wire.
pub fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apiset_not_present_and_not_hosted_collapse_to_the_same_status() {
        assert_eq!(
            status_for_error(&EngineError::ApiSetNotPresent),
            status_for_error(&EngineError::ApiSetNotHosted)
        );
    }

    #[test]
    fn json_escape_handles_quotes_and_backslashes() {
        assert_eq!(json_escape(r#"a"b\c"#), r#"a\"b\\c"#);
    }

    #[test]
    fn json_escape_handles_control_characters() {
        assert_eq!(json_escape("a\nb"), "a\\nb");
        assert_eq!(json_escape("a\u{1}b"), "a\\u0001b");
    }

    #[test]
    fn status_lines_are_crlf_terminated() {
        assert!(StatusLine::Ok.as_wire_str().ends_with("\r\n"));
        assert_eq!(StatusLine::Ok.code(), 200);
    }
}
