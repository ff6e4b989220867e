//! `WDEP/1.0` line framing: the wire carries UTF-16LE text, one request or
//! response per line, terminated with `\r\n`.
//!
//! Grounded on `recvcmd` in `main.c`: the original accumulates raw bytes
//! until it finds a `L'\r' L'\n'` pair in the buffer reinterpreted as
//! `wchar_t`, then truncates at the `\r`. This module provides the pure,
//! socket-free half of that — decoding a raw UTF-16LE buffer into a request
//! line, and encoding a response `String` back into the wire's UTF-16LE
//! bytes — so the actual accept loop (`src/bin/wdep-serverd.rs`) stays thin.

use crate::error::EngineError;

/// Find the first `\r\n` pair in a UTF-16LE byte buffer and decode the text
/// before it, discarding the terminator. Returns `None` if no terminator has
/// been seen yet (the caller should keep reading more bytes).
///
/// Mirrors `recvcmd`'s scan: it only looks once it has received at least two
/// whole UTF-16 code units (4 bytes) and an even byte count, then walks
/// code-unit by code-unit looking for `\n` immediately after `\r`.
pub fn find_line(buf: &[u8]) -> Option<(String, usize)> {
    if buf.len() < 4 || buf.len() % 2 != 0 {
        return None;
    }

    let units: Vec<u16> = buf
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect();

    for i in 1..units.len() {
        if units[i] == u16::from(b'\n') && units[i - 1] == u16::from(b'\r') {
            let line = String::from_utf16_lossy(&units[..i - 1]);
            return Some((line, (i + 1) * 2));
        }
    }

    None
}

/// Encode `text` as CRLF-terminated UTF-16LE bytes ready to write to the
/// socket. `text` is expected to already end in `\r\n` (every
/// [`crate::protocol::StatusLine`] literal does); this only transcodes.
pub fn encode_response(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() * 2);
    for unit in text.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// A small growable accumulator for one connection's inbound byte stream,
/// yielding complete request lines as they arrive and may span several
/// `read()` calls.
#[derive(Default)]
pub struct LineReader {
    buf: Vec<u8>,
}

impl LineReader {
    /// A fresh, empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly-read bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull the next complete line out of the buffer, if one has arrived.
    /// Consumed bytes (including the `\r\n`) are dropped from the internal
    /// buffer; anything after the terminator is kept for the next call.
    pub fn next_line(&mut self) -> Option<String> {
        let (line, consumed) = find_line(&self.buf)?;
        self.buf.drain(..consumed);
        Some(line)
    }

    /// Reject buffers that have grown past `max_len` bytes without ever
    /// producing a line — a malformed or hostile client withholding the
    /// terminator forever. The original has no such guard (it trusts a
    /// fixed-size `rcvbuf`); this is this crate's substitute bound.
    pub fn guard_against_unbounded_growth(&self, max_len: usize) -> Result<(), EngineError> {
        if self.buf.len() > max_len {
            Err(EngineError::InvalidParameters(
                "request line exceeded the maximum accepted length".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16le(s: &str) -> Vec<u8> {
        let mut out = Vec::new();
        for unit in s.encode_utf16() {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out
    }

    #[test]
    fn finds_a_complete_line_and_reports_bytes_consumed() {
        let bytes = utf16le("open file \"a.dll\"\r\n");
        let (line, consumed) = find_line(&bytes).unwrap();
        assert_eq!(line, "open file \"a.dll\"");
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn returns_none_without_a_terminator() {
        let bytes = utf16le("open file \"a.dll\"");
        assert!(find_line(&bytes).is_none());
    }

    #[test]
    fn line_reader_assembles_a_line_split_across_feeds() {
        let bytes = utf16le("headers\r\n");
        let mut reader = LineReader::new();
        reader.feed(&bytes[..3]);
        assert!(reader.next_line().is_none());
        reader.feed(&bytes[3..]);
        assert_eq!(reader.next_line(), Some("headers".to_string()));
    }

    #[test]
    fn line_reader_keeps_trailing_bytes_for_the_next_line() {
        let mut reader = LineReader::new();
        reader.feed(&utf16le("close\r\nheaders\r\n"));
        assert_eq!(reader.next_line(), Some("close".to_string()));
        assert_eq!(reader.next_line(), Some("headers".to_string()));
        assert!(reader.next_line().is_none());
    }

    #[test]
    fn encode_round_trips_through_find_line() {
        let wire = encode_response("WDEP/1.0 200 OK\r\n");
        let (line, _) = find_line(&wire).unwrap();
        assert_eq!(line, "WDEP/1.0 200 OK");
    }
}
