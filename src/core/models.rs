use std::borrow::Borrow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of an object within one source namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory markers (keys ending in `/`) are not objects.
    pub fn is_directory_marker(key: &str) -> bool {
        key.ends_with('/')
    }

    /// Key under which this object is published, with an optional destination prefix.
    pub fn with_prefix(&self, prefix: Option<&str>) -> ObjectKey {
        match prefix {
            Some(p) if !p.is_empty() => {
                ObjectKey(format!("{}/{}", p.trim_end_matches('/'), self.0))
            }
            _ => self.clone(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for ObjectKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl Borrow<str> for ObjectKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

const LEGACY_MD5_PREFIX: &str = "md5:";

/// Hex-encoded BLAKE3 digest of a staged file.
///
/// Digests imported from a legacy ledger are MD5 and carry an `md5:` tag until the
/// staged copy has been checked and re-hashed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn legacy_md5(hex: &str) -> Self {
        Self(format!("{LEGACY_MD5_PREFIX}{}", hex.to_ascii_lowercase()))
    }

    /// The MD5 hex of an imported digest that has not been upgraded yet.
    pub fn legacy_md5_hex(&self) -> Option<&str> {
        self.0.strip_prefix(LEGACY_MD5_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Size and content hash of a byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    pub size_bytes: u64,
    pub content_hash: ContentHash,
}

/// Lifecycle state of one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Pending,
    Downloaded,
    Uploaded,
    Verified,
    Failed,
}

impl TransferState {
    /// States that carry a content hash and size.
    pub fn is_staged(self) -> bool {
        matches!(self, Self::Downloaded | Self::Uploaded | Self::Verified)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Downloaded => "downloaded",
            Self::Uploaded => "uploaded",
            Self::Verified => "verified",
            Self::Failed => "failed",
        };
        f.pad(label)
    }
}

/// One ledger record.
///
/// `content_hash` and `size_bytes` are present iff the state is staged;
/// `last_error` is present iff the state is `Failed`. The constructors are the only
/// way to build an entry, and [`LedgerEntry::check`] re-validates entries read from disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    state: TransferState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_hash: Option<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    timestamp: DateTime<Utc>,
}

impl LedgerEntry {
    pub(crate) fn staged(
        state: TransferState,
        content_hash: ContentHash,
        size_bytes: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        debug_assert!(state.is_staged());
        Self {
            state,
            content_hash: Some(content_hash),
            size_bytes: Some(size_bytes),
            last_error: None,
            timestamp,
        }
    }

    pub(crate) fn failed(error: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            state: TransferState::Failed,
            content_hash: None,
            size_bytes: None,
            last_error: Some(error.into()),
            timestamp,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn content_hash(&self) -> Option<&ContentHash> {
        self.content_hash.as_ref()
    }

    pub fn size_bytes(&self) -> Option<u64> {
        self.size_bytes
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Hash and size together, for staged states.
    pub fn digest(&self) -> Option<Digest> {
        match (&self.content_hash, self.size_bytes) {
            (Some(hash), Some(size)) => Some(Digest {
                size_bytes: size,
                content_hash: hash.clone(),
            }),
            _ => None,
        }
    }

    /// Validate the field/state invariant.
    pub(crate) fn check(&self) -> Result<(), String> {
        let staged = self.state.is_staged();
        if self.state == TransferState::Pending {
            return Err("pending entries are never stored".to_string());
        }
        if staged != (self.content_hash.is_some() && self.size_bytes.is_some()) {
            return Err(format!(
                "{} entry must {}carry a content hash and size",
                self.state,
                if staged { "" } else { "not " }
            ));
        }
        if (self.state == TransferState::Failed) != self.last_error.is_some() {
            return Err(format!(
                "only failed entries carry an error (state is {})",
                self.state
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_prefix() {
        let key = ObjectKey::from("b/c.txt");
        assert_eq!(key.with_prefix(None).as_str(), "b/c.txt");
        assert_eq!(key.with_prefix(Some("")).as_str(), "b/c.txt");
        assert_eq!(key.with_prefix(Some("aliyun/")).as_str(), "aliyun/b/c.txt");
    }

    #[test]
    fn test_directory_marker() {
        assert!(ObjectKey::is_directory_marker("photos/"));
        assert!(!ObjectKey::is_directory_marker("photos/a.jpg"));
    }

    #[test]
    fn test_legacy_md5_tag() {
        let imported = ContentHash::legacy_md5("5D41402ABC4B2A76B9719D911017C592");
        assert_eq!(imported.as_str(), "md5:5d41402abc4b2a76b9719d911017c592");
        assert_eq!(
            imported.legacy_md5_hex(),
            Some("5d41402abc4b2a76b9719d911017c592")
        );
        assert!(ContentHash::new("ab").legacy_md5_hex().is_none());
    }

    #[test]
    fn test_entry_invariant_checks() {
        let now = Utc::now();
        let staged =
            LedgerEntry::staged(TransferState::Uploaded, ContentHash::new("ab"), 3, now);
        assert!(staged.check().is_ok());
        assert_eq!(staged.digest().unwrap().size_bytes, 3);

        let failed = LedgerEntry::failed("boom", now);
        assert!(failed.check().is_ok());
        assert!(failed.digest().is_none());

        let broken: LedgerEntry = serde_json::from_value(serde_json::json!({
            "state": "verified",
            "timestamp": now,
        }))
        .unwrap();
        assert!(broken.check().is_err());

        let broken: LedgerEntry = serde_json::from_value(serde_json::json!({
            "state": "failed",
            "content_hash": "ab",
            "size_bytes": 1,
            "last_error": "x",
            "timestamp": now,
        }))
        .unwrap();
        assert!(broken.check().is_err());
    }
}
