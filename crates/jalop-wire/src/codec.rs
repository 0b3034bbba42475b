//! Typed protocol messages and their wire encoding.
//!
//! Each message type knows which headers it owns. Decoding splits a frame's
//! headers into those known headers and `other_headers`, which are passed to
//! applications untouched.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use bytes::{BufMut, Bytes, BytesMut};

use jalop_core::{
    ConnectError, DigestMethod, DigestStatus, DigestValue, Mode, Nonce, RecordInfo, RecordType,
    Role, XmlEncoding,
};

use crate::error::{Result, WireError};
use crate::frame::{FrameKind, Message, MessageType};
use crate::headers::{join_list, names, split_list, Headers};

/// Protocol version this implementation speaks.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Separator written after each record segment. Never digested.
pub const BREAK: &[u8] = b"BREAK";

/// Line separator inside digest and digest-response bodies.
const CRLF: &str = "\r\n";

/// A typed protocol message.
pub trait WireMessage: Sized {
    /// The `JAL-Message` value.
    const TYPE: MessageType;

    /// Header names this message type interprets.
    const KNOWN_HEADERS: &'static [&'static str];

    fn encode(&self) -> Result<Message>;

    fn decode(message: &Message) -> Result<Self>;
}

/// Check the frame kind and `JAL-Message` tag, then split headers.
fn open(message: &Message, expected: MessageType, known: &[&str]) -> Result<(Headers, Headers)> {
    if message.kind != FrameKind::Msg {
        return Err(WireError::Malformed(format!(
            "expected MSG frame for {expected}, got {}",
            message.kind.as_str()
        )));
    }
    let tag = message.headers.require(names::MESSAGE)?;
    if MessageType::parse(tag) != Some(expected) {
        return Err(WireError::unexpected(names::MESSAGE, tag));
    }
    Ok(message.headers.split(known))
}

/// Start an outgoing frame carrying the caller's extension headers.
fn start(message_type: MessageType, other: &Headers) -> Result<Message> {
    let mut msg = Message::new(message_type);
    msg.headers.extend_from(other)?;
    msg.headers.insert(names::MESSAGE, message_type.as_str())?;
    Ok(msg)
}

fn wire_nonce(headers: &Headers) -> Result<Nonce> {
    let raw = headers.require(names::NONCE)?;
    Nonce::new(raw).map_err(|_| WireError::unexpected(names::NONCE, raw))
}

fn wire_u64(headers: &Headers, name: &str) -> Result<u64> {
    let raw = headers.require(name)?;
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| WireError::unexpected(name, raw))?;
    u64::try_from(value).map_err(|_| WireError::unexpected(name, raw))
}

fn mode_value(role: Role, mode: Mode) -> Result<&'static str> {
    Ok(match (role, mode) {
        (Role::Publisher, Mode::Live) => "publish-live",
        (Role::Publisher, Mode::Archive) => "publish-archival",
        (Role::Subscriber, Mode::Live) => "subscribe-live",
        (Role::Subscriber, Mode::Archive) => "subscribe-archival",
        (_, Mode::Unset) => {
            return Err(WireError::InvalidArgument("init mode must be set".into()));
        }
    })
}

fn parse_mode(value: &str) -> Option<(Role, Mode)> {
    let value = value.trim().to_ascii_lowercase();
    let (role, rest) = if let Some(rest) = value.strip_prefix("publish-") {
        (Role::Publisher, rest)
    } else if let Some(rest) = value.strip_prefix("subscribe-") {
        (Role::Subscriber, rest)
    } else {
        return None;
    };
    let mode = match rest {
        "live" => Mode::Live,
        "archival" | "archive" => Mode::Archive,
        _ => return None,
    };
    Some((role, mode))
}

// ─────────────────────────────────────────────────────────────────────────────
// Negotiation
// ─────────────────────────────────────────────────────────────────────────────

/// Channel negotiation request.
///
/// `role` is the initiator's role: `publish-*` modes mean the sender
/// publishes, `subscribe-*` modes mean it subscribes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitMessage {
    pub role: Role,
    pub mode: Mode,
    pub record_type: RecordType,
    pub version: String,
    /// Encodings in the sender's order of preference.
    pub accept_encodings: Vec<String>,
    /// Digest names or URIs in the sender's order of preference.
    pub accept_digests: Vec<String>,
    pub agent: Option<String>,
    pub other_headers: Headers,
}

impl InitMessage {
    /// Build an init, applying the default `["none"]` and `["sha256"]`
    /// lists when the caller passes empty ones.
    pub fn new(
        role: Role,
        mode: Mode,
        record_type: RecordType,
        encodings: Vec<String>,
        digests: Vec<String>,
        agent: Option<String>,
    ) -> Result<Self> {
        mode_value(role, mode)?;
        let encodings = if encodings.is_empty() {
            vec![XmlEncoding::DEFAULT.to_string()]
        } else {
            encodings
        };
        let digests = if digests.is_empty() {
            vec![DigestMethod::Sha256.name().to_string()]
        } else {
            digests
        };
        if encodings.iter().chain(&digests).any(|s| s.trim().is_empty() || s.contains(',')) {
            return Err(WireError::InvalidArgument(
                "encoding and digest names must be non-blank and comma free".into(),
            ));
        }
        Ok(Self {
            role,
            mode,
            record_type,
            version: PROTOCOL_VERSION.to_string(),
            accept_encodings: encodings,
            accept_digests: digests,
            agent: agent.filter(|a| !a.trim().is_empty()),
            other_headers: Headers::new(),
        })
    }
}

impl WireMessage for InitMessage {
    const TYPE: MessageType = MessageType::Init;
    const KNOWN_HEADERS: &'static [&'static str] = &[
        names::MESSAGE,
        names::VERSION,
        names::MODE,
        names::DATA_CLASS,
        names::ACCEPT_ENCODING,
        names::ACCEPT_DIGEST,
        names::AGENT,
    ];

    fn encode(&self) -> Result<Message> {
        let mut msg = start(Self::TYPE, &self.other_headers)?;
        let h = &mut msg.headers;
        h.insert(names::VERSION, self.version.as_str())?;
        h.insert(names::MODE, mode_value(self.role, self.mode)?)?;
        h.insert(names::DATA_CLASS, self.record_type.as_str())?;
        h.insert(names::ACCEPT_ENCODING, join_list(&self.accept_encodings))?;
        h.insert(names::ACCEPT_DIGEST, join_list(&self.accept_digests))?;
        if let Some(agent) = &self.agent {
            h.insert(names::AGENT, agent.as_str())?;
        }
        Ok(msg)
    }

    fn decode(message: &Message) -> Result<Self> {
        let (known, other) = open(message, Self::TYPE, Self::KNOWN_HEADERS)?;
        let mode_raw = known.require(names::MODE)?;
        let class_raw = known.require(names::DATA_CLASS)?;
        let (role, mode) =
            parse_mode(mode_raw).ok_or_else(|| WireError::unexpected(names::MODE, mode_raw))?;
        let record_type = RecordType::parse(class_raw)
            .ok_or_else(|| WireError::unexpected(names::DATA_CLASS, class_raw))?;

        let mut accept_encodings = known.get(names::ACCEPT_ENCODING).map(split_list).unwrap_or_default();
        if accept_encodings.is_empty() {
            accept_encodings.push(XmlEncoding::DEFAULT.to_string());
        }
        let mut accept_digests = known.get(names::ACCEPT_DIGEST).map(split_list).unwrap_or_default();
        if accept_digests.is_empty() {
            accept_digests.push(DigestMethod::Sha256.name().to_string());
        }

        Ok(Self {
            role,
            mode,
            record_type,
            version: known
                .get(names::VERSION)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| PROTOCOL_VERSION.to_string()),
            accept_encodings,
            accept_digests,
            agent: known.get(names::AGENT).map(String::from).filter(|a| !a.is_empty()),
            other_headers: other,
        })
    }
}

/// Successful negotiation reply carrying the settled selections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitAck {
    pub digest: DigestMethod,
    pub encoding: XmlEncoding,
    pub other_headers: Headers,
}

impl InitAck {
    pub fn new(digest: DigestMethod, encoding: XmlEncoding) -> Self {
        Self {
            digest,
            encoding,
            other_headers: Headers::new(),
        }
    }
}

impl WireMessage for InitAck {
    const TYPE: MessageType = MessageType::InitAck;
    const KNOWN_HEADERS: &'static [&'static str] = &[names::MESSAGE, names::DIGEST, names::ENCODING];

    fn encode(&self) -> Result<Message> {
        let mut msg = start(Self::TYPE, &self.other_headers)?;
        msg.headers.insert(names::DIGEST, self.digest.name())?;
        msg.headers.insert(names::ENCODING, self.encoding.as_str())?;
        Ok(msg)
    }

    fn decode(message: &Message) -> Result<Self> {
        let (known, other) = open(message, Self::TYPE, Self::KNOWN_HEADERS)?;
        let digest_raw = known.require(names::DIGEST)?;
        let encoding_raw = known.require(names::ENCODING)?;
        let digest = DigestMethod::from_name_or_uri(digest_raw)
            .map_err(|_| WireError::unexpected(names::DIGEST, digest_raw))?;
        let encoding = XmlEncoding::new(encoding_raw)
            .map_err(|_| WireError::unexpected(names::ENCODING, encoding_raw))?;
        Ok(Self {
            digest,
            encoding,
            other_headers: other,
        })
    }
}

fn nack_header(error: ConnectError) -> Option<&'static str> {
    match error {
        ConnectError::Accept => None,
        ConnectError::UnsupportedVersion => Some(names::UNSUPPORTED_VERSION),
        ConnectError::UnsupportedEncoding => Some(names::UNSUPPORTED_ENCODING),
        ConnectError::UnsupportedDigest => Some(names::UNSUPPORTED_DIGEST),
        ConnectError::UnsupportedMode => Some(names::UNSUPPORTED_MODE),
        ConnectError::UnauthorizedMode => Some(names::UNAUTHORIZED_MODE),
    }
}

/// Negotiation rejection listing every reason at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitNack {
    pub errors: BTreeSet<ConnectError>,
    pub other_headers: Headers,
}

impl InitNack {
    /// Fails if `errors` is empty or contains [`ConnectError::Accept`].
    pub fn new(errors: BTreeSet<ConnectError>) -> Result<Self> {
        if errors.is_empty() {
            return Err(WireError::InvalidArgument("init-nack needs at least one error".into()));
        }
        if errors.contains(&ConnectError::Accept) {
            return Err(WireError::InvalidArgument("init-nack cannot carry Accept".into()));
        }
        Ok(Self {
            errors,
            other_headers: Headers::new(),
        })
    }
}

impl WireMessage for InitNack {
    const TYPE: MessageType = MessageType::InitNack;
    const KNOWN_HEADERS: &'static [&'static str] = &[
        names::MESSAGE,
        names::UNSUPPORTED_VERSION,
        names::UNSUPPORTED_ENCODING,
        names::UNSUPPORTED_DIGEST,
        names::UNSUPPORTED_MODE,
        names::UNAUTHORIZED_MODE,
    ];

    fn encode(&self) -> Result<Message> {
        // Re-validate: the fields are public.
        let checked = InitNack::new(self.errors.clone())?;
        let mut msg = start(Self::TYPE, &self.other_headers)?;
        for name in checked.errors.iter().filter_map(|e| nack_header(*e)) {
            msg.headers.insert(name, "")?;
        }
        Ok(msg)
    }

    fn decode(message: &Message) -> Result<Self> {
        let (known, other) = open(message, Self::TYPE, Self::KNOWN_HEADERS)?;
        let errors: BTreeSet<ConnectError> = ConnectError::REJECTIONS
            .into_iter()
            .filter(|e| nack_header(*e).is_some_and(|name| known.contains(name)))
            .collect();
        if errors.is_empty() {
            return Err(WireError::MissingHeader("init-nack error flag".into()));
        }
        Ok(Self {
            errors,
            other_headers: other,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Record requests
// ─────────────────────────────────────────────────────────────────────────────

/// Request to start streaming records.
///
/// `nonce`, when present, names the last record the subscriber holds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Subscribe {
    pub nonce: Option<Nonce>,
    pub other_headers: Headers,
}

impl WireMessage for Subscribe {
    const TYPE: MessageType = MessageType::Subscribe;
    const KNOWN_HEADERS: &'static [&'static str] = &[names::MESSAGE, names::NONCE];

    fn encode(&self) -> Result<Message> {
        let mut msg = start(Self::TYPE, &self.other_headers)?;
        if let Some(nonce) = &self.nonce {
            msg.headers.insert(names::NONCE, nonce.as_str())?;
        }
        Ok(msg)
    }

    fn decode(message: &Message) -> Result<Self> {
        let (known, other) = open(message, Self::TYPE, Self::KNOWN_HEADERS)?;
        let nonce = match known.get(names::NONCE) {
            Some(_) => Some(wire_nonce(&known)?),
            None => None,
        };
        Ok(Self {
            nonce,
            other_headers: other,
        })
    }
}

/// Request to continue a partially received journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalResume {
    pub nonce: Nonce,
    pub offset: u64,
    pub other_headers: Headers,
}

impl JournalResume {
    pub fn new(nonce: Nonce, offset: u64) -> Self {
        Self {
            nonce,
            offset,
            other_headers: Headers::new(),
        }
    }
}

impl WireMessage for JournalResume {
    const TYPE: MessageType = MessageType::JournalResume;
    const KNOWN_HEADERS: &'static [&'static str] =
        &[names::MESSAGE, names::NONCE, names::JOURNAL_OFFSET];

    fn encode(&self) -> Result<Message> {
        let mut msg = start(Self::TYPE, &self.other_headers)?;
        msg.headers.insert(names::NONCE, self.nonce.as_str())?;
        msg.headers.insert(names::JOURNAL_OFFSET, self.offset.to_string())?;
        Ok(msg)
    }

    fn decode(message: &Message) -> Result<Self> {
        let (known, other) = open(message, Self::TYPE, Self::KNOWN_HEADERS)?;
        Ok(Self {
            nonce: wire_nonce(&known)?,
            offset: wire_u64(&known, names::JOURNAL_OFFSET)?,
            other_headers: other,
        })
    }
}

/// Subscriber's notice that a confirmed record is safely stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMessage {
    pub nonce: Nonce,
    pub other_headers: Headers,
}

impl SyncMessage {
    pub fn new(nonce: Nonce) -> Self {
        Self {
            nonce,
            other_headers: Headers::new(),
        }
    }
}

impl WireMessage for SyncMessage {
    const TYPE: MessageType = MessageType::Sync;
    const KNOWN_HEADERS: &'static [&'static str] = &[names::MESSAGE, names::NONCE];

    fn encode(&self) -> Result<Message> {
        let mut msg = start(Self::TYPE, &self.other_headers)?;
        msg.headers.insert(names::NONCE, self.nonce.as_str())?;
        Ok(msg)
    }

    fn decode(message: &Message) -> Result<Self> {
        let (known, other) = open(message, Self::TYPE, Self::KNOWN_HEADERS)?;
        Ok(Self {
            nonce: wire_nonce(&known)?,
            other_headers: other,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Digest exchange
// ─────────────────────────────────────────────────────────────────────────────

fn line_body<'a>(lines: impl Iterator<Item = (String, &'a str)>) -> (Bytes, usize) {
    let mut buf = BytesMut::new();
    let mut count = 0usize;
    for (left, nonce) in lines {
        if count > 0 {
            buf.put_slice(CRLF.as_bytes());
        }
        buf.put_slice(left.as_bytes());
        buf.put_u8(b'=');
        buf.put_slice(nonce.as_bytes());
        count += 1;
    }
    (buf.freeze(), count)
}

/// Split a `left=nonce` body and check it against `JAL-Count`.
fn parse_lines(message: &Message, known: &Headers) -> Result<Vec<(String, String)>> {
    let text = std::str::from_utf8(&message.body)
        .map_err(|_| WireError::Malformed("digest body is not UTF-8".into()))?;
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for line in text.split(CRLF).filter(|l| !l.is_empty()) {
        let (left, nonce) = line
            .split_once('=')
            .ok_or_else(|| WireError::Malformed(format!("digest line without '=': '{line}'")))?;
        // Nonces are opaque: compared exactly as sent.
        if !seen.insert(nonce) {
            return Err(WireError::unexpected(names::NONCE, format!("{nonce} (listed twice)")));
        }
        out.push((left.trim().to_string(), nonce.to_string()));
    }
    let count = wire_u64(known, names::COUNT)?;
    if count != out.len() as u64 {
        return Err(WireError::unexpected(
            names::COUNT,
            format!("{count} (body has {} lines)", out.len()),
        ));
    }
    Ok(out)
}

/// Batch of subscriber-computed digests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestMessage {
    pub digests: BTreeMap<Nonce, DigestValue>,
    pub other_headers: Headers,
}

impl DigestMessage {
    pub fn new(digests: BTreeMap<Nonce, DigestValue>) -> Self {
        Self {
            digests,
            other_headers: Headers::new(),
        }
    }
}

impl WireMessage for DigestMessage {
    const TYPE: MessageType = MessageType::Digest;
    const KNOWN_HEADERS: &'static [&'static str] = &[names::MESSAGE, names::COUNT];

    fn encode(&self) -> Result<Message> {
        if self.digests.is_empty() {
            return Err(WireError::InvalidArgument("digest message needs at least one entry".into()));
        }
        if let Some((nonce, _)) = self.digests.iter().find(|(_, d)| d.as_bytes().is_empty()) {
            return Err(WireError::InvalidArgument(format!("empty digest for nonce {nonce}")));
        }
        let (body, count) =
            line_body(self.digests.iter().map(|(n, d)| (d.to_hex(), n.as_str())));
        let mut msg = start(Self::TYPE, &self.other_headers)?;
        msg.headers.insert(names::COUNT, count.to_string())?;
        Ok(msg.with_body(body))
    }

    fn decode(message: &Message) -> Result<Self> {
        let (known, other) = open(message, Self::TYPE, Self::KNOWN_HEADERS)?;
        let mut digests = BTreeMap::new();
        for (hex, nonce) in parse_lines(message, &known)? {
            let nonce = Nonce::new(nonce.as_str())
                .map_err(|_| WireError::Malformed(format!("blank nonce for digest {hex}")))?;
            let digest = DigestValue::from_hex(&hex)
                .map_err(|_| WireError::Malformed(format!("bad digest '{hex}' for {nonce}")))?;
            digests.insert(nonce, digest);
        }
        Ok(Self {
            digests,
            other_headers: other,
        })
    }
}

/// Publisher verdicts on a digest batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestResponse {
    pub statuses: BTreeMap<Nonce, DigestStatus>,
    pub other_headers: Headers,
}

impl DigestResponse {
    pub fn new(statuses: BTreeMap<Nonce, DigestStatus>) -> Self {
        Self {
            statuses,
            other_headers: Headers::new(),
        }
    }
}

impl WireMessage for DigestResponse {
    const TYPE: MessageType = MessageType::DigestResponse;
    const KNOWN_HEADERS: &'static [&'static str] = &[names::MESSAGE, names::COUNT];

    fn encode(&self) -> Result<Message> {
        if self.statuses.is_empty() {
            return Err(WireError::InvalidArgument(
                "digest-response needs at least one entry".into(),
            ));
        }
        let (body, count) = line_body(
            self.statuses
                .iter()
                .map(|(n, s)| (s.as_str().to_string(), n.as_str())),
        );
        let mut msg = start(Self::TYPE, &self.other_headers)?;
        msg.headers.insert(names::COUNT, count.to_string())?;
        Ok(msg.with_body(body))
    }

    fn decode(message: &Message) -> Result<Self> {
        let (known, other) = open(message, Self::TYPE, Self::KNOWN_HEADERS)?;
        let mut statuses = BTreeMap::new();
        for (word, nonce) in parse_lines(message, &known)? {
            let status = DigestStatus::parse(&word)
                .ok_or_else(|| WireError::InvalidArgument(format!("unknown digest status '{word}'")))?;
            let nonce = Nonce::new(nonce.as_str())
                .map_err(|_| WireError::Malformed(format!("blank nonce for status {word}")))?;
            statuses.insert(nonce, status);
        }
        Ok(Self {
            statuses,
            other_headers: other,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Record transfer
// ─────────────────────────────────────────────────────────────────────────────

/// The payload-length header for a record type.
pub const fn payload_length_header(record_type: RecordType) -> &'static str {
    match record_type {
        RecordType::Journal => names::JOURNAL_LENGTH,
        RecordType::Audit => names::AUDIT_LENGTH,
        RecordType::Log => names::LOG_LENGTH,
    }
}

const RECORD_HEADERS: &[&str] = &[
    names::MESSAGE,
    names::NONCE,
    names::SYS_METADATA_LENGTH,
    names::APP_METADATA_LENGTH,
    names::JOURNAL_LENGTH,
    names::AUDIT_LENGTH,
    names::LOG_LENGTH,
];

/// Header block of a record-transfer message.
///
/// `info.payload_len` is the number of payload bytes in this message; for a
/// resumed journal that is the suffix after the resume offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub record_type: RecordType,
    pub info: RecordInfo,
    pub other_headers: Headers,
}

impl RecordHeader {
    pub fn new(record_type: RecordType, info: RecordInfo) -> Self {
        Self {
            record_type,
            info,
            other_headers: Headers::new(),
        }
    }

    /// Headers for a streamed body.
    pub fn to_headers(&self) -> Result<Headers> {
        Ok(start(MessageType::record(self.record_type), &self.other_headers)?
            .headers
            .with(names::NONCE, self.info.nonce.as_str())?
            .with(names::SYS_METADATA_LENGTH, self.info.sys_metadata_len.to_string())?
            .with(names::APP_METADATA_LENGTH, self.info.app_metadata_len.to_string())?
            .with(
                payload_length_header(self.record_type),
                self.info.payload_len.to_string(),
            )?)
    }

    /// Exact body length: three segments plus three break markers.
    pub fn body_len(&self) -> u64 {
        self.info.total_len().saturating_add(3 * BREAK.len() as u64)
    }

    /// Read a record header from a frame whose body has not arrived yet.
    pub fn from_frame(kind: FrameKind, headers: &Headers) -> Result<Self> {
        if kind != FrameKind::Msg {
            return Err(WireError::Malformed("record must be a MSG frame".into()));
        }
        let tag = headers.require(names::MESSAGE)?;
        let record_type = MessageType::parse(tag)
            .and_then(MessageType::record_type)
            .ok_or_else(|| WireError::unexpected(names::MESSAGE, tag))?;
        let (known, other_headers) = headers.split(RECORD_HEADERS);
        let info = RecordInfo::new(
            wire_nonce(&known)?,
            wire_u64(&known, names::SYS_METADATA_LENGTH)?,
            wire_u64(&known, names::APP_METADATA_LENGTH)?,
            wire_u64(&known, payload_length_header(record_type))?,
        );
        Ok(Self {
            record_type,
            info,
            other_headers,
        })
    }
}

/// A fully received record-transfer message with its segments split out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMessage {
    pub header: RecordHeader,
    pub sys_metadata: Bytes,
    pub app_metadata: Bytes,
    pub payload: Bytes,
}

impl RecordMessage {
    /// Encode an in-memory record as one frame.
    pub fn encode(&self) -> Result<Message> {
        let mut header = self.header.clone();
        header.info.sys_metadata_len = self.sys_metadata.len() as u64;
        header.info.app_metadata_len = self.app_metadata.len() as u64;
        header.info.payload_len = self.payload.len() as u64;
        let mut body = BytesMut::with_capacity(header.body_len() as usize);
        for segment in [&self.sys_metadata, &self.app_metadata, &self.payload] {
            body.put_slice(segment);
            body.put_slice(BREAK);
        }
        Ok(Message {
            kind: FrameKind::Msg,
            headers: header.to_headers()?,
            body: body.freeze(),
        })
    }

    /// Split a record frame by its declared lengths, checking every break.
    pub fn decode(message: &Message) -> Result<Self> {
        let header = RecordHeader::from_frame(message.kind, &message.headers)?;
        let body = &message.body;
        if body.len() as u64 != header.body_len() {
            return Err(WireError::Malformed(format!(
                "record {} body is {} bytes, headers declare {}",
                header.info.nonce,
                body.len(),
                header.body_len()
            )));
        }
        let mut pos = 0usize;
        let mut take = |len: u64| -> Result<Bytes> {
            let end = pos + len as usize;
            let segment = body.slice(pos..end);
            if &body[end..end + BREAK.len()] != BREAK {
                return Err(WireError::Malformed(format!("missing BREAK at offset {end}")));
            }
            pos = end + BREAK.len();
            Ok(segment)
        };
        let sys_metadata = take(header.info.sys_metadata_len)?;
        let app_metadata = take(header.info.app_metadata_len)?;
        let payload = take(header.info.payload_len)?;
        Ok(Self {
            header,
            sys_metadata,
            app_metadata,
            payload,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Error replies
// ─────────────────────────────────────────────────────────────────────────────

/// `Err` frame telling a subscriber the journal it asked to resume is gone.
pub fn journal_missing(nonce: &Nonce) -> Result<Message> {
    let mut msg = Message::error(format!("journal record {nonce} is not available"));
    msg.headers.insert(names::JOURNAL_MISSING, "")?;
    msg.headers.insert(names::NONCE, nonce.as_str())?;
    Ok(msg)
}

/// If `message` is a journal-missing `Err` frame, the nonce it names.
pub fn decode_journal_missing(message: &Message) -> Option<Nonce> {
    if message.kind != FrameKind::Err || !message.headers.contains(names::JOURNAL_MISSING) {
        return None;
    }
    message.headers.get(names::NONCE).and_then(|n| Nonce::new(n).ok())
}
