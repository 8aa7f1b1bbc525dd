//! Import of ledgers written in the older three-map shape:
//! `{ "downloaded": {key: {hash, size, time}}, "uploaded": {key: {hash, time}},
//!    "failed": {key: {error, time}} }`.
//!
//! A key could appear in several maps at once there. The mapping to a single state:
//! - `uploaded` was only written after the remote size check passed ⇒ `Verified`
//!   (needs the size from `downloaded`);
//! - `failed` newer than the download (or with no download) ⇒ `Failed`;
//! - otherwise `downloaded` ⇒ `Downloaded`.
//!
//! Hashes there are MD5 hex and are imported tagged (`md5:<hex>`); the engine checks
//! them against the staged copy once and replaces them with BLAKE3.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::warn;

use crate::core::models::{ContentHash, LedgerEntry, ObjectKey, TransferState};

const LEGACY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Default, Deserialize)]
struct LegacyDocument {
    #[serde(default)]
    downloaded: BTreeMap<String, LegacyDownloaded>,
    #[serde(default)]
    uploaded: BTreeMap<String, LegacyUploaded>,
    #[serde(default)]
    failed: BTreeMap<String, LegacyFailed>,
}

#[derive(Debug, Deserialize)]
struct LegacyDownloaded {
    hash: String,
    size: u64,
    #[serde(default)]
    time: String,
}

#[derive(Debug, Deserialize)]
struct LegacyUploaded {
    hash: String,
    #[serde(default)]
    time: String,
}

#[derive(Debug, Deserialize)]
struct LegacyFailed {
    error: String,
    #[serde(default)]
    time: String,
}

pub(super) fn looks_legacy(value: &serde_json::Value) -> bool {
    ["downloaded", "uploaded", "failed"]
        .iter()
        .any(|field| value.get(field).is_some())
}

pub(super) fn convert(
    value: serde_json::Value,
) -> Result<BTreeMap<ObjectKey, LedgerEntry>, serde_json::Error> {
    let document: LegacyDocument = serde_json::from_value(value)?;

    let keys: BTreeSet<&String> = document
        .downloaded
        .keys()
        .chain(document.uploaded.keys())
        .chain(document.failed.keys())
        .collect();

    let mut entries = BTreeMap::new();
    for key in keys {
        let downloaded = document.downloaded.get(key);
        let uploaded = document.uploaded.get(key);
        let failed = document.failed.get(key);

        let entry = match (downloaded, uploaded, failed) {
            (Some(d), Some(u), _) => {
                // Uploaded hash must match what was staged
                if d.hash != u.hash {
                    warn!(key = %key, "Legacy upload hash differs from download hash, keeping download only");
                    LedgerEntry::staged(
                        TransferState::Downloaded,
                        ContentHash::legacy_md5(&d.hash),
                        d.size,
                        parse_time(&d.time),
                    )
                } else {
                    LedgerEntry::staged(
                        TransferState::Verified,
                        ContentHash::legacy_md5(&u.hash),
                        d.size,
                        parse_time(&u.time),
                    )
                }
            }
            (Some(d), None, Some(f)) if f.time > d.time => {
                LedgerEntry::failed(f.error.clone(), parse_time(&f.time))
            }
            (Some(d), None, _) => LedgerEntry::staged(
                TransferState::Downloaded,
                ContentHash::legacy_md5(&d.hash),
                d.size,
                parse_time(&d.time),
            ),
            (None, _, Some(f)) => LedgerEntry::failed(f.error.clone(), parse_time(&f.time)),
            (None, Some(_), None) => {
                warn!(key = %key, "Legacy upload record has no size, dropping entry");
                continue;
            }
            (None, None, None) => continue,
        };
        entries.insert(ObjectKey::new(key.clone()), entry);
    }

    Ok(entries)
}

/// Legacy times are naive local timestamps. Unparseable times map to now.
fn parse_time(raw: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(raw, LEGACY_TIME_FORMAT)
        .ok()
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_failure_after_download_wins() {
        let entries = convert(json!({
            "downloaded": {"k": {"hash": "h", "size": 3, "time": "2024-01-01 10:00:00"}},
            "failed": {"k": {"error": "upload failed", "time": "2024-01-02 10:00:00"}}
        }))
        .unwrap();
        let entry = &entries[&ObjectKey::from("k")];
        assert_eq!(entry.state(), TransferState::Failed);
        assert_eq!(entry.last_error(), Some("upload failed"));
    }

    #[test]
    fn test_stale_failure_before_download_is_dropped() {
        let entries = convert(json!({
            "downloaded": {"k": {"hash": "h", "size": 3, "time": "2024-01-02 10:00:00"}},
            "failed": {"k": {"error": "timeout", "time": "2024-01-01 10:00:00"}}
        }))
        .unwrap();
        let entry = &entries[&ObjectKey::from("k")];
        assert_eq!(entry.state(), TransferState::Downloaded);
        assert_eq!(
            entry.content_hash().and_then(ContentHash::legacy_md5_hex),
            Some("h")
        );
    }

    #[test]
    fn test_upload_without_size_is_dropped() {
        let entries = convert(json!({
            "uploaded": {"k": {"hash": "h", "time": "2024-01-01 10:00:00"}}
        }))
        .unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_converted_entries_satisfy_invariant() {
        let entries = convert(json!({
            "downloaded": {
                "a": {"hash": "ha", "size": 1, "time": "2024-01-01 10:00:00"},
                "b": {"hash": "hb", "size": 2, "time": "bogus"}
            },
            "uploaded": {"a": {"hash": "ha", "time": "2024-01-01 10:05:00"}},
            "failed": {"c": {"error": "nope", "time": "2024-01-01 10:00:00"}}
        }))
        .unwrap();
        assert_eq!(entries.len(), 3);
        for entry in entries.values() {
            assert!(entry.check().is_ok());
        }
    }
}
