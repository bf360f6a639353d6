//! STOMP 1.2 frame encoding and decoding.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use crate::QueueError;

/// Largest frame accepted from a peer, headers and body included.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let command = match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            _ => return None,
        };
        Some(command)
    }

    // CONNECT and CONNECTED headers are sent without escaping.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One STOMP frame. Headers keep wire order, repeated names included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn push_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.push((key.into(), value.into()));
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// First value for a header name; later repeats are ignored.
    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Parse one frame from the start of `src`.
    ///
    /// Returns the frame and the number of bytes it used, or `None` when
    /// more data is needed. Leading end-of-line bytes (heart-beats) are
    /// consumed as part of the frame. Header lines without a `:` are
    /// skipped.
    pub fn parse(src: &[u8]) -> Result<Option<(Frame, usize)>, QueueError> {
        Self::parse_with_limit(src, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Like [`parse`](Self::parse), rejecting a `content-length` above
    /// `max_frame_size`.
    pub fn parse_with_limit(src: &[u8], max_frame_size: usize) -> Result<Option<(Frame, usize)>, QueueError> {
        let mut pos = 0;
        while pos < src.len() && (src[pos] == b'\n' || src[pos] == b'\r') {
            pos += 1;
        }
        if pos == src.len() {
            return Ok(None);
        }
        let start = pos;

        let (command_line, next) = match read_line(src, pos) {
            Some(line) => line,
            None => return Ok(None),
        };
        let command_text = std::str::from_utf8(command_line)
            .map_err(|_| QueueError::Protocol("frame command is not UTF-8".to_string()))?;
        let command = Command::parse(command_text)
            .ok_or_else(|| QueueError::Protocol(format!("unknown frame command `{}`", command_text)))?;
        pos = next;

        let mut headers = Vec::new();
        loop {
            let (line, next) = match read_line(src, pos) {
                Some(line) => line,
                None => return Ok(None),
            };
            pos = next;
            if line.is_empty() {
                break;
            }
            let line = String::from_utf8_lossy(line);
            if let Some((key, value)) = line.split_once(':') {
                if command.escapes_headers() {
                    headers.push((unescape(key), unescape(value)));
                } else {
                    headers.push((key.to_string(), value.to_string()));
                }
            }
        }

        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .and_then(|(_, v)| v.trim().parse::<usize>().ok());

        let body_end = match content_length {
            Some(len) => {
                let end = match pos.checked_add(len) {
                    Some(end) if len <= max_frame_size => end,
                    _ => {
                        return Err(QueueError::Protocol(format!(
                            "content-length {} exceeds the {} byte frame limit",
                            len, max_frame_size
                        )))
                    }
                };
                if src.len() <= end {
                    return Ok(None);
                }
                if src[end] != 0 {
                    return Err(QueueError::Protocol(
                        "frame body is not NUL terminated after content-length bytes".to_string(),
                    ));
                }
                end
            }
            None => match src[pos..].iter().position(|b| *b == 0) {
                Some(offset) => pos + offset,
                None => return Ok(None),
            },
        };

        if body_end - start >= max_frame_size {
            return Err(QueueError::Protocol(format!(
                "frame of {} bytes exceeds the {} byte frame limit",
                body_end + 1 - start,
                max_frame_size
            )));
        }

        let body = Bytes::copy_from_slice(&src[pos..body_end]);
        Ok(Some((
            Frame {
                command,
                headers,
                body,
            },
            body_end + 1,
        )))
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.body.len());
        buf.put_slice(self.command.as_str().as_bytes());
        buf.put_u8(b'\n');
        for (key, value) in &self.headers {
            if self.command.escapes_headers() {
                buf.put_slice(escape(key).as_bytes());
                buf.put_u8(b':');
                buf.put_slice(escape(value).as_bytes());
            } else {
                buf.put_slice(key.as_bytes());
                buf.put_u8(b':');
                buf.put_slice(value.as_bytes());
            }
            buf.put_u8(b'\n');
        }
        buf.put_u8(b'\n');
        buf.put_slice(&self.body);
        buf.put_u8(0);
        buf.freeze()
    }
}

// Returns the line (without EOL) and the offset after it.
fn read_line(src: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let offset = src[start..].iter().position(|b| *b == b'\n')?;
    let mut line = &src[start..start + offset];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    Some((line, start + offset + 1))
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

// Undefined escape sequences are kept verbatim.
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message_with_content_length() {
        let raw = b"MESSAGE\ndestination:/queue/a\nmessage-id:7\ncontent-length:5\n\nhe\0lo\0";
        let (frame, used) = Frame::parse(raw).unwrap().unwrap();
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.get_header("message-id"), Some("7"));
        assert_eq!(&frame.body[..], b"he\0lo");
        assert_eq!(used, raw.len());
    }

    #[test]
    fn test_parse_without_content_length_stops_at_nul() {
        let raw = b"MESSAGE\r\ndestination:/queue/a\r\n\r\nhello\0MESSAGE\n";
        let (frame, used) = Frame::parse(raw).unwrap().unwrap();
        assert_eq!(&frame.body[..], b"hello");
        assert_eq!(&raw[used..], b"MESSAGE\n");
    }

    #[test]
    fn test_incomplete_frame_needs_more_data() {
        assert!(Frame::parse(b"MESSAGE\ndestination:/q").unwrap().is_none());
        assert!(Frame::parse(b"MESSAGE\ncontent-length:10\n\nshort").unwrap().is_none());
        assert!(Frame::parse(b"\n\n").unwrap().is_none());
    }

    #[test]
    fn test_heartbeats_are_skipped() {
        let raw = b"\n\r\nRECEIPT\nreceipt-id:1\n\n\0";
        let (frame, used) = Frame::parse(raw).unwrap().unwrap();
        assert_eq!(frame.command, Command::Receipt);
        assert_eq!(used, raw.len());
    }

    #[test]
    fn test_header_without_colon_is_dropped() {
        let raw = b"MESSAGE\nbroken-header\nx:1\n\n\0";
        let (frame, _) = Frame::parse(raw).unwrap().unwrap();
        assert_eq!(frame.headers, vec![("x".to_string(), "1".to_string())]);
    }

    #[test]
    fn test_escaping() {
        let frame = Frame::new(Command::Send).header("a:b", "line\nbreak\\");
        let encoded = frame.encode();
        assert!(encoded.starts_with(b"SEND\na\\cb:line\\nbreak\\\\\n"));
        let (decoded, _) = Frame::parse(&encoded).unwrap().unwrap();
        assert_eq!(decoded.get_header("a:b"), Some("line\nbreak\\"));
    }

    #[test]
    fn test_connected_headers_are_not_unescaped() {
        let raw = b"CONNECTED\nserver:broker\\c1\n\n\0";
        let (frame, _) = Frame::parse(raw).unwrap().unwrap();
        assert_eq!(frame.get_header("server"), Some("broker\\c1"));
    }

    #[test]
    fn test_unknown_command_is_protocol_error() {
        let err = Frame::parse(b"BOGUS\n\n\0").unwrap_err();
        assert!(matches!(err, QueueError::Protocol(_)));
    }

    #[test]
    fn test_huge_content_length_is_rejected() {
        let err = Frame::parse(b"MESSAGE\ncontent-length:18446744073709551615\n\nx\0").unwrap_err();
        assert!(matches!(err, QueueError::Protocol(ref m) if m.contains("exceeds")));

        let err = Frame::parse_with_limit(b"MESSAGE\ncontent-length:11\n\n", 10).unwrap_err();
        assert!(matches!(err, QueueError::Protocol(_)));
        assert!(Frame::parse_with_limit(b"MESSAGE\ncontent-length:10\n\n", 10).unwrap().is_none());
    }

    #[test]
    fn test_repeated_header_first_wins() {
        let raw = b"MESSAGE\nfoo:1\nfoo:2\n\n\0";
        let (frame, _) = Frame::parse(raw).unwrap().unwrap();
        assert_eq!(frame.get_header("foo"), Some("1"));
        assert_eq!(frame.headers.len(), 2);
    }
}
