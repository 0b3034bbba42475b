//! Golden vectors for record digests and frame bytes.
//!
//! Digests cover the three segments back to back with no separators, so
//! the same bytes split differently across segments give the same digest.

use jalop_core::{record_digest, DigestMethod, DigestValue, Nonce};
use jalop_wire::{DigestMessage, SyncMessage, WireMessage};

/// A record digest with a known answer.
#[derive(Debug, Clone)]
pub struct DigestVector {
    pub name: &'static str,
    pub method: DigestMethod,
    pub sys_metadata: &'static [u8],
    pub app_metadata: &'static [u8],
    pub payload: &'static [u8],
    /// Expected digest (hex).
    pub expected: &'static str,
}

impl DigestVector {
    pub fn compute(&self) -> DigestValue {
        record_digest(self.method, self.sys_metadata, self.app_metadata, self.payload)
    }
}

const SHA256_ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
const SHA384_ABC: &str = "cb00753f45a35e8bb5a03d699ac65007272c32ab0eded1631a8b605a43ff5bed8086072ba1e7cc2358baeca134c825a7";
const SHA512_ABC: &str = "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f";

/// All digest vectors.
pub fn digest_vectors() -> Vec<DigestVector> {
    vec![
        DigestVector {
            name: "sha256 empty record",
            method: DigestMethod::Sha256,
            sys_metadata: b"",
            app_metadata: b"",
            payload: b"",
            expected: "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        },
        DigestVector {
            name: "sha256 abc in payload",
            method: DigestMethod::Sha256,
            sys_metadata: b"",
            app_metadata: b"",
            payload: b"abc",
            expected: SHA256_ABC,
        },
        DigestVector {
            name: "sha256 abc across segments",
            method: DigestMethod::Sha256,
            sys_metadata: b"a",
            app_metadata: b"b",
            payload: b"c",
            expected: SHA256_ABC,
        },
        DigestVector {
            name: "sha256 two blocks",
            method: DigestMethod::Sha256,
            sys_metadata: b"abcdbcdecdefdefgefghfghighijhijk",
            app_metadata: b"",
            payload: b"ijkljklmklmnlmnomnopnopq",
            expected: "248d6a61d20638b8e5c026930c3e6039a33ce45964ff2167f6ecedd419db06c1",
        },
        DigestVector {
            name: "sha384 abc in metadata",
            method: DigestMethod::Sha384,
            sys_metadata: b"ab",
            app_metadata: b"c",
            payload: b"",
            expected: SHA384_ABC,
        },
        DigestVector {
            name: "sha384 empty record",
            method: DigestMethod::Sha384,
            sys_metadata: b"",
            app_metadata: b"",
            payload: b"",
            expected: "38b060a751ac96384cd9327eb1b1e36a21fdb71114be07434c0cc7bf63f6e1da274edebfe76f65fbd51ad2f14898b95b",
        },
        DigestVector {
            name: "sha512 abc across segments",
            method: DigestMethod::Sha512,
            sys_metadata: b"a",
            app_metadata: b"",
            payload: b"bc",
            expected: SHA512_ABC,
        },
        DigestVector {
            name: "sha512 empty record",
            method: DigestMethod::Sha512,
            sys_metadata: b"",
            app_metadata: b"",
            payload: b"",
            expected: "cf83e1357eefb8bdf1542850d66d8007d620e4050b5715dc83f4a921d36ce9ce47d0d13c5d85f2b0ff8318d2877eec2f63b931bd47417a81a538327af927da3e",
        },
    ]
}

/// Check every digest vector. Returns `(name, matches, computed hex)`.
pub fn verify_digest_vectors() -> Vec<(String, bool, String)> {
    digest_vectors()
        .iter()
        .map(|v| {
            let hex = v.compute().to_hex();
            (v.name.to_string(), hex == v.expected, hex)
        })
        .collect()
}

/// A message with its exact frame bytes.
#[derive(Debug, Clone)]
pub struct FrameVector {
    pub name: &'static str,
    pub bytes: Vec<u8>,
    pub encoded: Vec<u8>,
}

/// Frame vectors for messages with a fixed header order.
pub fn frame_vectors() -> Result<Vec<FrameVector>, Box<dyn std::error::Error>> {
    let nonce = Nonce::new("n1")?;
    let sync = SyncMessage::new(nonce.clone()).encode()?.to_bytes().to_vec();
    let digest = DigestMessage::new([(nonce, DigestMethod::Sha256.digest(b"abc"))].into_iter().collect())
        .encode()?
        .to_bytes()
        .to_vec();
    Ok(vec![
        FrameVector {
            name: "sync",
            bytes: b"MSG\r\nJAL-Message: sync\r\nJAL-Nonce: n1\r\n\r\n".to_vec(),
            encoded: sync,
        },
        FrameVector {
            name: "digest",
            bytes: format!("MSG\r\nJAL-Message: digest\r\nJAL-Count: 1\r\n\r\n{SHA256_ABC}=n1").into_bytes(),
            encoded: digest,
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use jalop_core::digest_source_record;
    use jalop_core::SourceRecord;
    use jalop_wire::Message;

    #[test]
    fn test_digest_vectors_match() {
        for (name, ok, hex) in verify_digest_vectors() {
            assert!(ok, "vector '{name}' computed {hex}");
        }
    }

    #[tokio::test]
    async fn test_streaming_digest_matches_vectors() {
        for v in digest_vectors() {
            let mut record = SourceRecord::from_bytes(
                Nonce::new("v").unwrap(),
                v.sys_metadata,
                v.app_metadata,
                v.payload,
            );
            let digest = digest_source_record(v.method, &mut record).await.unwrap();
            assert_eq!(digest.to_hex(), v.expected, "vector '{}'", v.name);
        }
    }

    #[test]
    fn test_frame_vectors_match() {
        for v in frame_vectors().unwrap() {
            assert_eq!(v.encoded, v.bytes, "frame '{}'", v.name);
            let parsed = Message::parse(v.bytes.clone().into()).unwrap();
            assert_eq!(parsed.to_bytes().to_vec(), v.bytes);
        }
    }
}
