//! Accumulating read buffer with a consumed boundary.
//!
//! Bytes before the boundary have already been matched (or discarded) and
//! can never be matched again. Bytes after it form the pending window that
//! `expect` searches.

use regex::bytes::Regex;

/// Consumed bytes are dropped from memory once they exceed this.
const COMPACT_THRESHOLD: usize = 64 * 1024;

/// Largest pending window kept; older unmatched output is discarded.
pub const MAX_PENDING: usize = 1024 * 1024;

/// Location of a pattern match inside the pending window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferMatch {
    /// Index of the matching pattern in the list passed to [`ExpectBuffer::find`].
    pub index: usize,
    /// Start offset, relative to the pending window.
    pub start: usize,
    /// End offset (exclusive), relative to the pending window.
    pub end: usize,
}

#[derive(Debug, Default)]
pub struct ExpectBuffer {
    data: Vec<u8>,
    consumed: usize,
    max_pending: usize,
}

impl ExpectBuffer {
    pub fn new() -> Self {
        Self::with_max_pending(MAX_PENDING)
    }

    pub fn with_max_pending(max_pending: usize) -> Self {
        Self {
            data: Vec::new(),
            consumed: 0,
            max_pending: max_pending.max(1),
        }
    }

    /// Append freshly read bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);

        let pending = self.data.len() - self.consumed;
        if pending > self.max_pending {
            self.consumed += pending - self.max_pending;
        }
        if self.consumed >= COMPACT_THRESHOLD {
            self.compact();
        }
    }

    /// Bytes not yet consumed.
    pub fn pending(&self) -> &[u8] {
        &self.data[self.consumed..]
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    /// Earliest match across `patterns` in the pending window.
    ///
    /// Earliest start wins; equal starts go to the lower pattern index.
    pub fn find(&self, patterns: &[Regex]) -> Option<BufferMatch> {
        let pending = self.pending();
        let mut best: Option<BufferMatch> = None;

        for (index, pattern) in patterns.iter().enumerate() {
            let Some(m) = pattern.find(pending) else {
                continue;
            };
            if best.is_none_or(|b| m.start() < b.start) {
                best = Some(BufferMatch {
                    index,
                    start: m.start(),
                    end: m.end(),
                });
            }
        }
        best
    }

    /// Consume through the end of `m`, returning (text before, matched text).
    pub fn take_match(&mut self, m: &BufferMatch) -> (Vec<u8>, Vec<u8>) {
        let pending = self.pending();
        let before = pending[..m.start].to_vec();
        let matched = pending[m.start..m.end].to_vec();
        self.consumed += m.end;
        (before, matched)
    }

    /// Drop everything pending.
    pub fn discard(&mut self) -> usize {
        let dropped = self.data.len() - self.consumed;
        self.consumed = self.data.len();
        self.compact();
        dropped
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.consumed = 0;
    }

    /// Last `max` pending bytes, lossily decoded, for error messages.
    pub fn tail(&self, max: usize) -> String {
        let pending = self.pending();
        let start = pending.len().saturating_sub(max);
        String::from_utf8_lossy(&pending[start..]).into_owned()
    }

    fn compact(&mut self) {
        self.data.drain(..self.consumed);
        self.consumed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn re(p: &str) -> Regex {
        Regex::new(p).unwrap()
    }

    #[test]
    fn test_earliest_match_in_stream_order_wins() {
        let mut buf = ExpectBuffer::new();
        buf.push(b"Password: ... login: ");
        let m = buf.find(&[re("login:"), re("assword:")]).unwrap();
        assert_eq!(m.index, 1);
    }

    #[test]
    fn test_tie_goes_to_lower_index() {
        let mut buf = ExpectBuffer::new();
        buf.push(b"controller-0:~$ ");
        let m = buf.find(&[re(r"controller-0:~\$ "), re(r"controller-[01]:~\$ ")]).unwrap();
        assert_eq!(m.index, 0);
    }

    #[test]
    fn test_consumed_bytes_never_rematch() {
        let mut buf = ExpectBuffer::new();
        buf.push(b"$ first\n$ ");
        let patterns = [re(r"\$ ")];
        let m = buf.find(&patterns).unwrap();
        buf.take_match(&m);
        let m = buf.find(&patterns).unwrap();
        let (before, _) = buf.take_match(&m);
        assert_eq!(before, b"first\n");
        assert!(buf.find(&patterns).is_none());
    }

    #[test]
    fn test_match_spans_partial_pushes() {
        let mut buf = ExpectBuffer::new();
        buf.push(b"contr");
        assert!(buf.find(&[re("controller-1")]).is_none());
        buf.push(b"oller-1");
        assert!(buf.find(&[re("controller-1")]).is_some());
    }

    #[test]
    fn test_pending_window_is_capped() {
        let mut buf = ExpectBuffer::with_max_pending(8);
        buf.push(b"0123456789abcdef");
        assert_eq!(buf.pending(), b"89abcdef");
    }

    #[test]
    fn test_discard_and_tail() {
        let mut buf = ExpectBuffer::new();
        buf.push(b"stale output");
        assert_eq!(buf.tail(6), "output");
        assert_eq!(buf.discard(), 12);
        assert!(buf.is_empty());
        assert_eq!(buf.tail(6), "");
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_match(
            text in "[a-z ]{0,40}PROMPT[a-z ]{0,40}",
            split in 0usize..90,
        ) {
            let bytes = text.as_bytes();
            let split = split.min(bytes.len());
            let mut whole = ExpectBuffer::new();
            whole.push(bytes);
            let mut chunked = ExpectBuffer::new();
            chunked.push(&bytes[..split]);
            chunked.push(&bytes[split..]);
            let patterns = [re("PROMPT")];
            prop_assert_eq!(whole.find(&patterns), chunked.find(&patterns));
        }

        #[test]
        fn prop_compaction_preserves_pending(chunks in proptest::collection::vec("[a-z]{1,200}", 1..50)) {
            let mut buf = ExpectBuffer::new();
            let mut expected = Vec::new();
            for chunk in &chunks {
                buf.push(chunk.as_bytes());
                expected.extend_from_slice(chunk.as_bytes());
                if expected.len() > 300 {
                    buf.discard();
                    expected.clear();
                }
            }
            prop_assert_eq!(buf.pending(), expected.as_slice());
        }
    }
}
