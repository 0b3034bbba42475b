//! Ordered, case-insensitive header blocks.

use std::fmt;

use crate::error::{Result, WireError};

/// Header names used by the protocol.
pub mod names {
    pub const MESSAGE: &str = "JAL-Message";
    pub const VERSION: &str = "JAL-Version";
    pub const MODE: &str = "JAL-Mode";
    pub const DATA_CLASS: &str = "JAL-Data-Class";
    pub const ACCEPT_ENCODING: &str = "JAL-Accept-Encoding";
    pub const ACCEPT_DIGEST: &str = "JAL-Accept-Digest";
    pub const AGENT: &str = "JAL-Agent";
    pub const ENCODING: &str = "JAL-Encoding";
    pub const DIGEST: &str = "JAL-Digest";
    pub const UNSUPPORTED_VERSION: &str = "JAL-Unsupported-Version";
    pub const UNSUPPORTED_MODE: &str = "JAL-Unsupported-Mode";
    pub const UNAUTHORIZED_MODE: &str = "JAL-Unauthorized-Mode";
    pub const UNSUPPORTED_ENCODING: &str = "JAL-Unsupported-Encoding";
    pub const UNSUPPORTED_DIGEST: &str = "JAL-Unsupported-Digest";
    pub const NONCE: &str = "JAL-Nonce";
    pub const JOURNAL_OFFSET: &str = "JAL-Journal-Offset";
    pub const JOURNAL_LENGTH: &str = "JAL-Journal-Length";
    pub const AUDIT_LENGTH: &str = "JAL-Audit-Length";
    pub const LOG_LENGTH: &str = "JAL-Log-Length";
    pub const SYS_METADATA_LENGTH: &str = "JAL-System-Metadata-Length";
    pub const APP_METADATA_LENGTH: &str = "JAL-Application-Metadata-Length";
    pub const COUNT: &str = "JAL-Count";
    pub const JOURNAL_MISSING: &str = "JAL-Journal-Missing";
}

/// A header block. Lookup ignores ASCII case; insertion order is kept.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Set `name` to `value`, replacing any existing value.
    ///
    /// Names must be non-empty tokens; values must not contain CR or LF.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        validate(name, &value)?;
        match self.position(name) {
            Some(i) => self.0[i].1 = value,
            None => self.0.push((name.to_string(), value)),
        }
        Ok(())
    }

    /// Builder form of [`Headers::insert`].
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Result<Self> {
        self.insert(name, value)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|i| self.0[i].1.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.position(name).map(|i| self.0.remove(i).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy every header of `other` into `self`, overwriting on collision.
    pub fn extend_from(&mut self, other: &Headers) -> Result<()> {
        for (n, v) in other.iter() {
            self.insert(n, v)?;
        }
        Ok(())
    }

    /// Partition into headers named in `known` and everything else.
    ///
    /// Unknown headers are handed to applications untouched so peers can add
    /// extension headers without breaking older nodes.
    pub fn split(&self, known: &[&str]) -> (Headers, Headers) {
        let (k, o): (Vec<_>, Vec<_>) = self
            .0
            .iter()
            .cloned()
            .partition(|(n, _)| known.iter().any(|k| k.eq_ignore_ascii_case(n)));
        (Headers(k), Headers(o))
    }

    /// Fetch a header that must be present.
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name)
            .ok_or_else(|| WireError::MissingHeader(name.to_string()))
    }

    /// Set a header whose name and value are protocol constants.
    pub(crate) fn set_trusted(&mut self, name: &'static str, value: &'static str) {
        match self.position(name) {
            Some(i) => self.0[i].1 = value.to_string(),
            None => self.0.push((name.to_string(), value.to_string())),
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

fn validate(name: &str, value: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .bytes()
            .all(|b| b.is_ascii_graphic() && b != b':')
    {
        return Err(WireError::InvalidArgument(format!("bad header name '{name}'")));
    }
    if value.contains(|c: char| c == '\r' || c == '\n') {
        return Err(WireError::InvalidArgument(format!(
            "header {name} value contains a line break"
        )));
    }
    Ok(())
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Join a preference list for an `Accept` header.
pub(crate) fn join_list<S: AsRef<str>>(items: &[S]) -> String {
    items
        .iter()
        .map(|s| s.as_ref().trim())
        .collect::<Vec<_>>()
        .join(",")
}

/// Split a comma-separated preference list, dropping empty entries.
pub(crate) fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_ignores_case() {
        let h = Headers::new().with("JAL-Nonce", "5").unwrap();
        assert_eq!(h.get("jal-nonce"), Some("5"));
        assert!(h.contains("JAL-NONCE"));
    }

    #[test]
    fn test_insert_replaces() {
        let mut h = Headers::new();
        h.insert("A", "1").unwrap();
        h.insert("a", "2").unwrap();
        assert_eq!(h.len(), 1);
        assert_eq!(h.get("A"), Some("2"));
    }

    #[test]
    fn test_rejects_line_breaks() {
        assert!(Headers::new().with("X-Agent", "evil\r\nJAL-Mode: x").is_err());
        assert!(Headers::new().with("Bad Name", "v").is_err());
        assert!(Headers::new().with("", "v").is_err());
    }

    #[test]
    fn test_split_known_and_other() {
        let h = Headers::new()
            .with(names::MESSAGE, "sync")
            .unwrap()
            .with("X-Extension", "1")
            .unwrap()
            .with(names::NONCE, "9")
            .unwrap();
        let (known, other) = h.split(&[names::MESSAGE, names::NONCE]);
        assert_eq!(known.len(), 2);
        assert_eq!(other.len(), 1);
        assert_eq!(other.get("x-extension"), Some("1"));
    }

    #[test]
    fn test_list_helpers() {
        assert_eq!(split_list(" sha512, ,sha256 "), vec!["sha512", "sha256"]);
        assert_eq!(join_list(&["a", "b"]), "a,b");
    }
}
