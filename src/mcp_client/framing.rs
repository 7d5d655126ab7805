//! Line framing for backend stdout.
//!
//! Backends write one JSON object per line, but reads from a pipe arrive in
//! arbitrary chunks. The framer accumulates bytes until a newline is seen and
//! only then parses. Anything that is not a JSON object is dropped, since
//! some backends print banners or log lines on the same stream.

use serde_json::Value;

/// Incremental newline splitter with a retained partial tail.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no newline.
    scanned: usize,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every complete JSON object it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);

        let mut messages = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.buffer[from..].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            if let Some(value) = parse_line(&self.buffer[start..end]) {
                messages.push(value);
            }
            start = end + 1;
            from = start;
        }

        // One drain per push keeps a chunk of many short lines linear.
        if start > 0 {
            self.buffer.drain(..start);
        }
        self.scanned = self.buffer.len();
        messages
    }

    /// Bytes held back waiting for a newline.
    pub fn pending_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

/// Parse one complete line, returning `None` for blanks, chatter, and junk.
fn parse_line(line: &[u8]) -> Option<Value> {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if !trimmed.starts_with('{') {
        if !trimmed.is_empty() {
            tracing::trace!(line = %trimmed, "skipping non-protocol stdout line");
        }
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) if value.is_object() => Some(value),
        Ok(_) => None,
        Err(e) => {
            tracing::trace!(error = %e, "discarding malformed stdout line");
            None
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
