//! Protocol frames: a kind line, a header block and an optional body.
//!
//! ```text
//! MSG\r\n
//! JAL-Message: sync\r\n
//! JAL-Nonce: 42\r\n
//! \r\n
//! <body bytes>
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use jalop_core::RecordType;

use crate::error::{Result, WireError};
use crate::headers::{names, Headers};

/// Kind of frame on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// An ordinary protocol message.
    Msg,
    /// A protocol-error reply; the body is a human readable reason.
    Err,
    /// End of stream: no further records follow.
    Nul,
}

impl FrameKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            FrameKind::Msg => "MSG",
            FrameKind::Err => "ERR",
            FrameKind::Nul => "NUL",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "MSG" => Some(FrameKind::Msg),
            "ERR" => Some(FrameKind::Err),
            "NUL" => Some(FrameKind::Nul),
            _ => None,
        }
    }
}

/// Value of the `JAL-Message` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Init,
    InitAck,
    InitNack,
    Subscribe,
    JournalResume,
    Journal,
    Audit,
    Log,
    Sync,
    Digest,
    DigestResponse,
}

impl MessageType {
    const ALL: [MessageType; 11] = [
        MessageType::Init,
        MessageType::InitAck,
        MessageType::InitNack,
        MessageType::Subscribe,
        MessageType::JournalResume,
        MessageType::Journal,
        MessageType::Audit,
        MessageType::Log,
        MessageType::Sync,
        MessageType::Digest,
        MessageType::DigestResponse,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            MessageType::Init => "init",
            MessageType::InitAck => "init-ack",
            MessageType::InitNack => "init-nack",
            MessageType::Subscribe => "subscribe",
            MessageType::JournalResume => "journal-resume",
            MessageType::Journal => "journal",
            MessageType::Audit => "audit",
            MessageType::Log => "log",
            MessageType::Sync => "sync",
            MessageType::Digest => "digest",
            MessageType::DigestResponse => "digest-response",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// The record-transfer message type for a record type.
    pub const fn record(record_type: RecordType) -> Self {
        match record_type {
            RecordType::Journal => MessageType::Journal,
            RecordType::Audit => MessageType::Audit,
            RecordType::Log => MessageType::Log,
        }
    }

    /// The record type a record-transfer message carries, if it is one.
    pub const fn record_type(self) -> Option<RecordType> {
        match self {
            MessageType::Journal => Some(RecordType::Journal),
            MessageType::Audit => Some(RecordType::Audit),
            MessageType::Log => Some(RecordType::Log),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single frame exchanged on a channel.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: FrameKind,
    pub headers: Headers,
    pub body: Bytes,
}

impl Message {
    /// An ordinary message of the given type with no body.
    pub fn new(message_type: MessageType) -> Self {
        let mut headers = Headers::new();
        headers.set_trusted(names::MESSAGE, message_type.as_str());
        Self {
            kind: FrameKind::Msg,
            headers,
            body: Bytes::new(),
        }
    }

    /// A protocol-error reply.
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Err,
            headers: Headers::new(),
            body: Bytes::from(reason.into()),
        }
    }

    /// The end-of-stream marker.
    pub fn nul() -> Self {
        Self {
            kind: FrameKind::Nul,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Parsed `JAL-Message` value, if present and recognized.
    pub fn message_type(&self) -> Option<MessageType> {
        self.headers.get(names::MESSAGE).and_then(MessageType::parse)
    }

    /// The body of an `Err` frame as text.
    pub fn error_reason(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Serialize the header block (kind line, headers, blank line).
    pub fn head_bytes(kind: FrameKind, headers: &Headers) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64 + headers.len() * 48);
        buf.put_slice(kind.as_str().as_bytes());
        buf.put_slice(b"\r\n");
        for (name, value) in headers.iter() {
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
        buf
    }

    /// Serialize the whole frame.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = Self::head_bytes(self.kind, &self.headers);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Parse a frame produced by [`Message::to_bytes`].
    pub fn parse(bytes: Bytes) -> Result<Self> {
        let (kind_line, mut pos) = read_line(&bytes, 0)?;
        let kind = FrameKind::parse(kind_line)
            .ok_or_else(|| WireError::Malformed(format!("unknown frame kind '{kind_line}'")))?;

        let mut headers = Headers::new();
        loop {
            let (line, next) = read_line(&bytes, pos)?;
            pos = next;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| WireError::Malformed(format!("header line without ':' '{line}'")))?;
            headers.insert(name.trim(), value.trim())?;
        }

        Ok(Self {
            kind,
            headers,
            body: bytes.slice(pos..),
        })
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .finish()
    }
}

fn read_line(bytes: &Bytes, start: usize) -> Result<(&str, usize)> {
    let rest = &bytes[start..];
    let end = rest
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or_else(|| WireError::Malformed("header block not terminated".into()))?;
    let line = std::str::from_utf8(&rest[..end])
        .map_err(|_| WireError::Malformed("header block is not UTF-8".into()))?;
    Ok((line, start + end + 2))
}
