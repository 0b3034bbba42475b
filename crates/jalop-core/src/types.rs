//! Strong type definitions for JALoP.
//!
//! Protocol enumerations and identifiers are newtypes or closed enums so a
//! record type can never be confused with a mode or a nonce with a digest.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// The class of records carried by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    /// Large binary or text blobs; the only type that supports resume.
    Journal,
    /// Structured XML audit events.
    Audit,
    /// Small text log entries.
    Log,
}

impl RecordType {
    /// All record types in wire order.
    pub const ALL: [RecordType; 3] = [RecordType::Journal, RecordType::Audit, RecordType::Log];

    /// The wire name (`journal`, `audit`, `log`).
    pub const fn as_str(self) -> &'static str {
        match self {
            RecordType::Journal => "journal",
            RecordType::Audit => "audit",
            RecordType::Log => "log",
        }
    }

    /// Parse a wire name, ignoring ASCII case.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| CoreError::InvalidArgument(format!("record type '{s}'")))
    }
}

/// Which end of a session sends records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Data source: streams records and answers digest messages.
    Publisher,
    /// Data sink: receives records and batches digests.
    Subscriber,
}

impl Role {
    /// The role the peer must hold for a session to make sense.
    pub const fn opposite(self) -> Self {
        match self {
            Role::Publisher => Role::Subscriber,
            Role::Subscriber => Role::Publisher,
        }
    }

    /// Lowercase name, used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Publisher => "publisher",
            Role::Subscriber => "subscriber",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a session ships the historical backlog or only new records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Placeholder used only while a session is being negotiated.
    #[default]
    Unset,
    /// Send the full backlog, then complete.
    Archive,
    /// Send records as they become available.
    Live,
}

impl Mode {
    /// True for `Archive` and `Live`.
    pub const fn is_set(self) -> bool {
        !matches!(self, Mode::Unset)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Unset => "unset",
            Mode::Archive => "archive",
            Mode::Live => "live",
        })
    }
}

/// Outcome of evaluating a connection request.
///
/// Policy evaluation yields a set of these; anything besides an empty set or
/// `{Accept}` rejects the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConnectError {
    Accept,
    UnsupportedVersion,
    UnsupportedEncoding,
    UnsupportedDigest,
    UnsupportedMode,
    UnauthorizedMode,
}

impl ConnectError {
    /// Every rejection kind, in the order they are reported on the wire.
    pub const REJECTIONS: [ConnectError; 5] = [
        ConnectError::UnsupportedVersion,
        ConnectError::UnsupportedEncoding,
        ConnectError::UnsupportedDigest,
        ConnectError::UnsupportedMode,
        ConnectError::UnauthorizedMode,
    ];

    /// True if a result set means the connection is rejected.
    pub fn rejects<'a>(errors: impl IntoIterator<Item = &'a ConnectError>) -> bool {
        errors.into_iter().any(|e| *e != ConnectError::Accept)
    }
}

/// Peer verdict on a digest the subscriber reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DigestStatus {
    /// Publisher computed the same digest.
    Confirmed,
    /// Publisher computed a different digest.
    Invalid,
    /// Publisher has no digest pending for that nonce.
    Unknown,
}

impl DigestStatus {
    /// The wire status word.
    pub const fn as_str(self) -> &'static str {
        match self {
            DigestStatus::Confirmed => "confirmed",
            DigestStatus::Invalid => "invalid",
            DigestStatus::Unknown => "unknown",
        }
    }

    /// Parse a status word, ignoring ASCII case.
    pub fn parse(s: &str) -> Option<Self> {
        [DigestStatus::Confirmed, DigestStatus::Invalid, DigestStatus::Unknown]
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

impl fmt::Display for DigestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A negotiated XML encoding name, such as `none` or `binary`.
///
/// Comparison ignores ASCII case; the original spelling is kept for the wire.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct XmlEncoding(String);

impl XmlEncoding {
    /// The default encoding offered when the caller supplies none.
    pub const DEFAULT: &'static str = "none";

    /// Create from a non-blank name.
    pub fn new(name: impl Into<String>) -> Result<Self, CoreError> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(CoreError::InvalidArgument("encoding must not be blank".into()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// The `none` encoding.
    pub fn none() -> Self {
        Self(Self::DEFAULT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for XmlEncoding {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl std::hash::Hash for XmlEncoding {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_ascii_lowercase().hash(state);
    }
}

impl fmt::Display for XmlEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Publisher-assigned serial identifier of one record.
///
/// Not cryptographic; unique within one publisher and record type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Nonce(String);

impl Nonce {
    /// Create from a non-blank string.
    pub fn new(value: impl Into<String>) -> Result<Self, CoreError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(CoreError::InvalidArgument("nonce must not be blank".into()));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Nonce {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Nonce {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Nonce {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Nonce {
    type Error = CoreError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Nonce> for String {
    fn from(nonce: Nonce) -> Self {
        nonce.0
    }
}
