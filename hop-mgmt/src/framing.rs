//! Line framing for the management byte stream

use crate::MAX_LINE_LEN;

/// A complete line taken off the stream, without its terminator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// Line content (invalid UTF-8 is replaced)
    pub text: String,
    /// The line exceeded the maximum length and was cut
    pub truncated: bool,
}

/// Splits an incoming byte stream into lines
///
/// Accepts both `\n` and `\r\n` terminators. Bytes are buffered until a
/// terminator arrives; a line longer than the configured maximum is emitted
/// truncated and the rest of it is discarded.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    max_line: usize,
    /// Dropping the tail of an over-long line until the next terminator
    discarding: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    /// Create a framer with the default maximum line length
    pub fn new() -> Self {
        Self::with_max_line(MAX_LINE_LEN)
    }

    /// Create a framer with a custom maximum line length
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line: max_line.max(1),
            discarding: false,
        }
    }

    /// Append bytes read from the stream
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet returned as a line
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete line, if one is buffered
    pub fn next_line(&mut self) -> Option<Line> {
        loop {
            match self.buf.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    let mut raw: Vec<u8> = self.buf.drain(..=pos).collect();
                    raw.pop();
                    if raw.last() == Some(&b'\r') {
                        raw.pop();
                    }

                    if self.discarding {
                        // tail of a line already emitted as truncated
                        self.discarding = false;
                        continue;
                    }

                    let truncated = raw.len() > self.max_line;
                    raw.truncate(self.max_line);
                    return Some(Line {
                        text: String::from_utf8_lossy(&raw).into_owned(),
                        truncated,
                    });
                }
                None => {
                    if self.buf.len() <= self.max_line {
                        return None;
                    }

                    if self.discarding {
                        self.buf.clear();
                        return None;
                    }

                    let head: Vec<u8> = self.buf.drain(..self.max_line).collect();
                    self.buf.clear();
                    self.discarding = true;
                    return Some(Line {
                        text: String::from_utf8_lossy(&head).into_owned(),
                        truncated: true,
                    });
                }
            }
        }
    }

    /// Flush a trailing unterminated line at end of stream
    pub fn finish(&mut self) -> Option<Line> {
        if self.discarding {
            self.discarding = false;
            self.buf.clear();
            return None;
        }

        if self.buf.is_empty() {
            return None;
        }

        let mut raw = std::mem::take(&mut self.buf);
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        Some(Line {
            text: String::from_utf8_lossy(&raw).into_owned(),
            truncated: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(line: Option<Line>) -> Option<String> {
        line.map(|l| l.text)
    }

    #[test]
    fn test_splits_on_lf_and_crlf() {
        let mut framer = LineFramer::new();
        framer.push(b"first\r\nsecond\nthird");

        assert_eq!(text(framer.next_line()), Some("first".into()));
        assert_eq!(text(framer.next_line()), Some("second".into()));
        assert_eq!(framer.next_line(), None);
        assert_eq!(framer.pending(), 5);
    }

    #[test]
    fn test_line_split_across_pushes() {
        let mut framer = LineFramer::new();
        framer.push(b">BYTECOUNT:12");
        assert_eq!(framer.next_line(), None);
        framer.push(b"3,456\r");
        assert_eq!(framer.next_line(), None);
        framer.push(b"\n");
        assert_eq!(text(framer.next_line()), Some(">BYTECOUNT:123,456".into()));
    }

    #[test]
    fn test_empty_lines_are_preserved() {
        let mut framer = LineFramer::new();
        framer.push(b"\n\r\n");
        assert_eq!(text(framer.next_line()), Some(String::new()));
        assert_eq!(text(framer.next_line()), Some(String::new()));
        assert_eq!(framer.next_line(), None);
    }

    #[test]
    fn test_overlong_line_is_truncated_and_tail_dropped() {
        let mut framer = LineFramer::with_max_line(8);
        framer.push(b"0123456789abcdef");

        let line = framer.next_line().unwrap();
        assert_eq!(line.text, "01234567");
        assert!(line.truncated);

        framer.push(b"ghij\nnext\n");
        assert_eq!(text(framer.next_line()), Some("next".into()));
        assert_eq!(framer.next_line(), None);
    }

    #[test]
    fn test_finish_returns_partial_line() {
        let mut framer = LineFramer::new();
        framer.push(b"SUCCESS: done\r");
        assert_eq!(framer.next_line(), None);
        assert_eq!(text(framer.finish()), Some("SUCCESS: done".into()));
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut framer = LineFramer::new();
        framer.push(b">LOG:1,I,caf\xff\n");
        let line = framer.next_line().unwrap();
        assert!(line.text.starts_with(">LOG:1,I,caf"));
        assert!(line.text.contains('\u{FFFD}'));
    }
}
