//! Byte-stream line framing.
//!
//! Serial data arrives in arbitrary chunks; the framer owns the pending-byte
//! accumulator and turns chunks into complete decoded lines. One framer
//! serves one connection epoch — partial trailing data must never leak into
//! the next connection, so the supervisor creates a fresh framer (or calls
//! [`LineFramer::clear`]) on every reconnect.

/// Stateful splitter turning byte chunks into decoded text lines.
///
/// Lines are terminated by `\n`; a single trailing `\r` is stripped.
/// Invalid UTF-8 sequences are replaced with U+FFFD rather than failing —
/// malformed device output never takes the link down.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    /// Create an empty framer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(1024),
        }
    }

    /// Append `bytes` and drain every complete line they finish.
    ///
    /// Bytes after the last line feed remain buffered for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(nl) = self.buf.iter().position(|&b| b == b'\n') {
            let mut raw: Vec<u8> = self.buf.drain(..=nl).collect();
            raw.pop(); // the line feed itself
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            lines.push(String::from_utf8_lossy(&raw).into_owned());
        }
        lines
    }

    /// Discard buffered partial data (used at reconnect boundaries).
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Number of buffered bytes awaiting a line feed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
