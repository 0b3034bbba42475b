//! Streaming digest engine.
//!
//! Wraps the SHA-2 family behind a closed [`DigestMethod`] enum. Digests are
//! computed incrementally while record bytes flow to or from the transport,
//! so update calls must see exactly the sys-metadata, app-metadata and
//! payload bytes and never the framing between them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::error::{CoreError, Result};
use crate::types::{DigestStatus, Nonce};

/// Size of the scratch buffer used when pumping segments.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// A supported digest algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestMethod {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl DigestMethod {
    /// Every algorithm this build can compute.
    pub const ALL: [DigestMethod; 3] =
        [DigestMethod::Sha256, DigestMethod::Sha384, DigestMethod::Sha512];

    /// Short name used in `JAL-Accept-Digest` lists.
    pub const fn name(self) -> &'static str {
        match self {
            DigestMethod::Sha256 => "sha256",
            DigestMethod::Sha384 => "sha384",
            DigestMethod::Sha512 => "sha512",
        }
    }

    /// The XML-DSig algorithm URI.
    pub const fn uri(self) -> &'static str {
        match self {
            DigestMethod::Sha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
            DigestMethod::Sha384 => "http://www.w3.org/2001/04/xmldsig-more#sha384",
            DigestMethod::Sha512 => "http://www.w3.org/2001/04/xmlenc#sha512",
        }
    }

    /// Digest length in bytes.
    pub const fn output_len(self) -> usize {
        match self {
            DigestMethod::Sha256 => 32,
            DigestMethod::Sha384 => 48,
            DigestMethod::Sha512 => 64,
        }
    }

    /// Resolve either a short name or a URI, ignoring ASCII case.
    pub fn from_name_or_uri(s: &str) -> Result<Self> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(s) || m.uri().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::UnsupportedDigest(s.to_string()))
    }

    /// True if `s` names this algorithm by short name or URI.
    pub fn matches(self, s: &str) -> bool {
        let s = s.trim();
        self.name().eq_ignore_ascii_case(s) || self.uri().eq_ignore_ascii_case(s)
    }

    /// Start a new incremental digest.
    pub fn digester(self) -> Digester {
        Digester::new(self)
    }

    /// One-shot digest of a byte slice.
    pub fn digest(self, data: &[u8]) -> DigestValue {
        let mut d = self.digester();
        d.update(data);
        d.finish()
    }
}

impl fmt::Display for DigestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone)]
enum Inner {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

/// An in-progress digest.
#[derive(Clone)]
pub struct Digester {
    method: DigestMethod,
    inner: Inner,
    consumed: u64,
}

impl Digester {
    pub fn new(method: DigestMethod) -> Self {
        let inner = match method {
            DigestMethod::Sha256 => Inner::Sha256(Sha256::new()),
            DigestMethod::Sha384 => Inner::Sha384(Sha384::new()),
            DigestMethod::Sha512 => Inner::Sha512(Sha512::new()),
        };
        Self {
            method,
            inner,
            consumed: 0,
        }
    }

    pub fn method(&self) -> DigestMethod {
        self.method
    }

    /// Number of bytes fed so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            Inner::Sha256(h) => h.update(data),
            Inner::Sha384(h) => h.update(data),
            Inner::Sha512(h) => h.update(data),
        }
        self.consumed += data.len() as u64;
    }

    pub fn finish(self) -> DigestValue {
        let bytes = match self.inner {
            Inner::Sha256(h) => h.finalize().to_vec(),
            Inner::Sha384(h) => h.finalize().to_vec(),
            Inner::Sha512(h) => h.finalize().to_vec(),
        };
        DigestValue(bytes)
    }

    /// Read exactly `len` bytes from `reader` into the digest without
    /// forwarding them anywhere.
    ///
    /// Used by journal resume to cover the prefix the peer already holds.
    pub async fn absorb<R>(&mut self, reader: &mut R, len: u64) -> Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(CoreError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended {remaining} bytes short of {len}"),
                )));
            }
            self.update(&buf[..n]);
            remaining -= n as u64;
        }
        Ok(())
    }
}

impl fmt::Debug for Digester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Digester")
            .field("method", &self.method)
            .field("consumed", &self.consumed)
            .finish()
    }
}

/// A finished digest.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DigestValue(pub Vec<u8>);

impl DigestValue {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex form used on the wire.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Parse hex (either case).
    pub fn from_hex(s: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s.trim())?;
        if bytes.is_empty() {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        Ok(Self(bytes))
    }
}

impl fmt::Debug for DigestValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "Digest({})", &hex[..hex.len().min(16)])
    }
}

impl fmt::Display for DigestValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// An [`AsyncRead`] adapter that feeds every byte it yields into a digest.
pub struct DigestReader<'a, R> {
    inner: R,
    digester: &'a mut Digester,
}

impl<'a, R> DigestReader<'a, R> {
    pub fn new(inner: R, digester: &'a mut Digester) -> Self {
        Self { inner, digester }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DigestReader<'_, R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.digester.update(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}

/// Locally computed and peer-reported digests for one record, with the
/// peer's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestPair {
    pub nonce: Nonce,
    /// Digest this node computed, if it still has one for the nonce.
    pub local_digest: Option<DigestValue>,
    /// Digest the peer sent, when the exchange carries one.
    pub peer_digest: Option<DigestValue>,
    pub status: DigestStatus,
}

impl DigestPair {
    /// Compare a locally held digest against the peer's report.
    pub fn reconcile(nonce: Nonce, local: Option<DigestValue>, peer: DigestValue) -> Self {
        let status = match &local {
            None => DigestStatus::Unknown,
            Some(l) if *l == peer => DigestStatus::Confirmed,
            Some(_) => DigestStatus::Invalid,
        };
        Self {
            nonce,
            local_digest: local,
            peer_digest: Some(peer),
            status,
        }
    }
}
