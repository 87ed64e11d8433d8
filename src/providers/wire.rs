//! Line framing over chunked HTTP bodies.
//!
//! Both streaming dialects the runtime consumes are line-oriented: Ollama
//! streams newline-delimited JSON, OpenAI-compatible backends stream SSE
//! `data:` lines. Chunk boundaries fall anywhere, so decoding buffers
//! partial lines between chunks.

/// Accumulates byte chunks and yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one body chunk; returns every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop(); // the newline itself
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Whatever remains after the body ends (a line without a trailing
    /// newline).
    pub fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.pending).into_owned())
        }
    }
}

/// Strip SSE framing from a line: `data: {...}` → `{...}`. Returns `None`
/// for non-data lines (comments, event names, keep-alives).
pub fn sse_data(line: &str) -> Option<&str> {
    let line = line.trim();
    line.strip_prefix("data:").map(str::trim_start)
}

/// The SSE terminator used by OpenAI-compatible backends.
pub const SSE_DONE: &str = "[DONE]";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_across_chunk_boundaries() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"{\"a\":").is_empty());
        let lines = buf.push(b"1}\n{\"b\":2}\n{\"c\"");
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(buf.finish().as_deref(), Some("{\"c\""));
    }

    #[test]
    fn test_crlf_lines() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"data: x\r\n\r\n");
        assert_eq!(lines, vec!["data: x", ""]);
    }

    #[test]
    fn test_sse_data_extraction() {
        assert_eq!(sse_data("data: {\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(sse_data("data:[DONE]"), Some("[DONE]"));
        assert_eq!(sse_data(": keep-alive"), None);
        assert_eq!(sse_data("event: message"), None);
    }
}
