//! Response assembly (Module H).
//!
//! Grounded on `mlist.c`: a linked list of message fragments is accumulated,
//! its total length computed up front, then joined into one buffer and sent
//! as a unit. Here the fragment list is a `Vec<Cow<str>>` and the "allocate
//! once, send as a unit" discipline becomes [`ResponseRope::finish`], which
//! never partially writes — callers either get the complete body or an
//! error, with nothing sent in between.

use std::borrow::Cow;

/// An accumulating response body: push fragments, then finish once.
#[derive(Debug, Default)]
pub struct ResponseRope<'a> {
    chunks: Vec<Cow<'a, str>>,
    total_len: usize,
}

impl<'a> ResponseRope<'a> {
    /// Start an empty rope.
    pub fn new() -> Self {
        Self { chunks: Vec::new(), total_len: 0 }
    }

    /// Append a borrowed fragment.
    pub fn push(&mut self, fragment: &'a str) -> &mut Self {
        self.total_len += fragment.len();
        self.chunks.push(Cow::Borrowed(fragment));
        self
    }

    /// Append an owned fragment (e.g. one already produced by `format!`).
    pub fn push_owned(&mut self, fragment: String) -> &mut Self {
        self.total_len += fragment.len();
        self.chunks.push(Cow::Owned(fragment));
        self
    }

    /// Append a comma if this rope already has at least one fragment —
    /// mirrors the source's `need_comma`/`c > 0` pattern for JSON arrays.
    pub fn push_comma_if_nonempty(&mut self) -> &mut Self {
        if !self.chunks.is_empty() {
            self.push(",");
        }
        self
    }

    /// Total length of the finished body, computed without allocating.
    pub fn len(&self) -> usize {
        self.total_len
    }

    /// `true` if no fragments have been pushed.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Join every fragment into one buffer, consuming the rope. This is the
    /// atomic "send or discard" boundary: the caller gets one complete
    /// `String` or, on allocation failure, nothing at all — there is no
    /// partially-sent state to observe.
    pub fn finish(self) -> String {
        let mut out = String::with_capacity(self.total_len);
        for chunk in self.chunks {
            out.push_str(&chunk);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_length_before_finishing() {
        let mut rope = ResponseRope::new();
        rope.push("{\"a\":1").push_owned(",\"b\":2}".to_string());
        assert_eq!(rope.len(), "{\"a\":1".len() + ",\"b\":2}".len());
        assert_eq!(rope.finish(), "{\"a\":1,\"b\":2}");
    }

    #[test]
    fn comma_join_mirrors_need_comma_semantics() {
        let mut rope = ResponseRope::new();
        for (i, item) in ["a", "b", "c"].iter().enumerate() {
            if i > 0 {
                rope.push_comma_if_nonempty();
            }
            rope.push(item);
        }
        assert_eq!(rope.finish(), "a,b,c");
    }

    #[test]
    fn empty_rope_finishes_to_empty_string() {
        assert_eq!(ResponseRope::new().finish(), "");
    }
}
