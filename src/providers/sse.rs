//! Incremental SSE line framing for upstream byte streams.

/// Buffers raw bytes and yields complete lines. SSE frames are separated by
/// `\n`; a trailing `\r` is stripped.
#[derive(Default)]
pub struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.push_str(&String::from_utf8_lossy(bytes));
    }

    /// Pop the next complete line, if any.
    pub fn next_line(&mut self) -> Option<String> {
        let idx = self.buf.find('\n')?;
        let mut line: String = self.buf.drain(..=idx).collect();
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
        Some(line)
    }
}

/// Extract the payload of a `data:` line, or None for comments, blank
/// lines, and other SSE fields.
pub fn data_payload(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    line.strip_prefix("data: ")
        .or_else(|| line.strip_prefix("data:"))
        .map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_splits_on_newline() {
        let mut b = LineBuffer::new();
        b.push(b"data: one\ndata: two\n");
        assert_eq!(b.next_line().as_deref(), Some("data: one"));
        assert_eq!(b.next_line().as_deref(), Some("data: two"));
        assert_eq!(b.next_line(), None);
    }

    #[test]
    fn test_line_buffer_holds_partial_lines() {
        let mut b = LineBuffer::new();
        b.push(b"data: par");
        assert_eq!(b.next_line(), None);
        b.push(b"tial\n");
        assert_eq!(b.next_line().as_deref(), Some("data: partial"));
    }

    #[test]
    fn test_crlf_stripped() {
        let mut b = LineBuffer::new();
        b.push(b"data: x\r\n");
        assert_eq!(b.next_line().as_deref(), Some("data: x"));
    }

    #[test]
    fn test_data_payload() {
        assert_eq!(data_payload("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(data_payload("data:{\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(data_payload(": keep-alive"), None);
        assert_eq!(data_payload(""), None);
        assert_eq!(data_payload("event: message"), None);
    }
}
