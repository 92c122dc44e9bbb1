/// Accumulates raw output chunks from one stream and hands back complete lines.
///
/// A line is complete once its `\n` terminator has arrived; the terminator and a trailing `\r`
/// are stripped. Bytes are decoded lossily so a script printing invalid UTF-8 cannot stall the
/// stream. Use one buffer per stream and drop it when the stream closes.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns an iterator over the lines completed so far.
    ///
    /// Lines are drained as the iterator advances; lines left unread stay buffered and are
    /// returned by the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> CompleteLines<'_> {
        self.pending.extend_from_slice(bytes);
        CompleteLines {
            pending: &mut self.pending,
        }
    }

    /// Returns the trailing unterminated line once the stream has closed.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(decode_line(&rest))
    }
}

pub struct CompleteLines<'a> {
    pending: &'a mut Vec<u8>,
}

impl Iterator for CompleteLines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        let pos = self.pending.iter().position(|byte| *byte == b'\n')?;
        let line = self.pending.drain(..=pos).collect::<Vec<u8>>();
        Some(decode_line(&line[..line.len() - 1]))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_only_terminated_lines() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.feed(b"ep=1\nep=").collect::<Vec<_>>(), vec!["ep=1"]);
        assert_eq!(buffer.feed(b"2\r\n").collect::<Vec<_>>(), vec!["ep=2"]);
        assert_eq!(buffer.flush(), None);
    }

    #[test]
    fn flush_returns_trailing_partial_line_once() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.feed(b"done 3/10").count(), 0);
        assert_eq!(buffer.flush(), Some("done 3/10".to_string()));
        assert_eq!(buffer.flush(), None);
    }

    #[test]
    fn unread_lines_survive_until_next_feed() {
        let mut buffer = LineBuffer::new();
        let first = buffer.feed(b"a\nb\nc\n").next();
        assert_eq!(first, Some("a".to_string()));
        assert_eq!(buffer.feed(b"").collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[test]
    fn keeps_empty_lines_and_decodes_lossily() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.feed(b"\n\xffok\n").collect::<Vec<_>>();
        assert_eq!(lines, vec!["".to_string(), "\u{fffd}ok".to_string()]);
    }
}
