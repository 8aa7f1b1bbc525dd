//! Durable per-source transfer ledger.
//!
//! The ledger maps object keys to [`LedgerEntry`] records and is persisted as one JSON
//! document per source. Every mutation writes the whole document to a temporary file,
//! syncs it and renames it over the ledger file before the in-memory map is allowed to
//! keep the change; a failed write rolls the in-memory map back.

mod legacy;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::models::{ContentHash, LedgerEntry, ObjectKey, TransferState};
use crate::error::LedgerError;

/// Current on-disk document version
const LEDGER_VERSION: u32 = 1;

/// Ledger shared between concurrent workers; the mutex is the single writer.
pub type SharedLedger = Arc<Mutex<TransferLedger>>;

#[derive(Debug, Serialize, Deserialize)]
struct LedgerDocument {
    version: u32,
    source: String,
    #[serde(default)]
    entries: BTreeMap<ObjectKey, LedgerEntry>,
}

/// Immutable copy of every entry, for reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    entries: BTreeMap<ObjectKey, LedgerEntry>,
}

impl LedgerSnapshot {
    pub fn get(&self, key: &ObjectKey) -> Option<&LedgerEntry> {
        self.entries.get(key)
    }

    pub fn state(&self, key: &ObjectKey) -> TransferState {
        self.entries
            .get(key)
            .map_or(TransferState::Pending, LedgerEntry::state)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectKey, &LedgerEntry)> {
        self.entries.iter()
    }

    /// Keys currently in `state`, in key order.
    pub fn keys_in(&self, state: TransferState) -> Vec<ObjectKey> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.state() == state)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of [`TransferLedger::record_failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureRecord {
    Recorded,
    /// The key is verified; verification is sticky and the failure was not applied.
    KeptVerified,
}

pub struct TransferLedger {
    source: String,
    path: PathBuf,
    entries: BTreeMap<ObjectKey, LedgerEntry>,
}

impl TransferLedger {
    /// Load the ledger at `path`, or start an empty one if the file does not exist.
    ///
    /// Documents in the legacy three-map shape are converted in memory and rewritten
    /// in the current shape on the next mutation.
    pub fn open(source: &str, path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => parse_document(&path, &content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(source, path = %path.display(), "No ledger yet, starting empty");
                BTreeMap::new()
            }
            Err(source_err) => {
                return Err(LedgerError::Io {
                    path,
                    source: source_err,
                });
            }
        };

        info!(
            source,
            path = %path.display(),
            entries = entries.len(),
            "Ledger loaded"
        );

        Ok(Self {
            source: source.to_string(),
            path,
            entries,
        })
    }

    /// Conventional ledger location for a source: `<dir>/<source>_status.json`.
    pub fn path_in(dir: &Path, source: &str) -> PathBuf {
        dir.join(format!("{}_status.json", source))
    }

    pub fn into_shared(self) -> SharedLedger {
        Arc::new(Mutex::new(self))
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entry for a key; `None` means never attempted (implicitly pending).
    pub fn get(&self, key: &ObjectKey) -> Option<&LedgerEntry> {
        self.entries.get(key)
    }

    pub fn state(&self, key: &ObjectKey) -> TransferState {
        self.entries
            .get(key)
            .map_or(TransferState::Pending, LedgerEntry::state)
    }

    /// Record a freshly staged copy. Clears any prior failure.
    ///
    /// Refuses to regress an uploaded or verified key.
    pub fn record_downloaded(
        &mut self,
        key: &ObjectKey,
        content_hash: ContentHash,
        size_bytes: u64,
    ) -> Result<(), LedgerError> {
        let from = self.state(key);
        if matches!(from, TransferState::Uploaded | TransferState::Verified) {
            return Err(LedgerError::InvalidTransition {
                key: key.clone(),
                from,
                action: "record download",
            });
        }

        let entry = LedgerEntry::staged(
            TransferState::Downloaded,
            content_hash,
            size_bytes,
            Utc::now(),
        );
        self.commit(key, entry)?;
        debug!(source = %self.source, key = %key, from = %from, "Recorded downloaded");
        Ok(())
    }

    /// Record a successful upload of the staged copy whose hash is `content_hash`.
    pub fn record_uploaded(
        &mut self,
        key: &ObjectKey,
        content_hash: &ContentHash,
    ) -> Result<(), LedgerError> {
        let invalid = |from| LedgerError::InvalidTransition {
            key: key.clone(),
            from,
            action: "record upload",
        };

        let Some(current) = self.entries.get(key) else {
            return Err(invalid(TransferState::Pending));
        };
        let from = current.state();
        let Some(digest) = current.digest() else {
            return Err(invalid(from));
        };
        if digest.content_hash != *content_hash {
            return Err(invalid(from));
        }
        if from != TransferState::Downloaded {
            // Already uploaded or verified; nothing to regress
            return Ok(());
        }

        let entry = LedgerEntry::staged(
            TransferState::Uploaded,
            digest.content_hash,
            digest.size_bytes,
            Utc::now(),
        );
        self.commit(key, entry)?;
        debug!(source = %self.source, key = %key, "Recorded uploaded");
        Ok(())
    }

    /// Mark an uploaded key verified. Verifying a verified key is a no-op.
    pub fn record_verified(&mut self, key: &ObjectKey) -> Result<(), LedgerError> {
        let from = self.state(key);
        match from {
            TransferState::Verified => return Ok(()),
            TransferState::Uploaded => {}
            _ => {
                return Err(LedgerError::InvalidTransition {
                    key: key.clone(),
                    from,
                    action: "record verification",
                });
            }
        }

        let digest = self
            .entries
            .get(key)
            .and_then(LedgerEntry::digest)
            .ok_or_else(|| LedgerError::InvalidTransition {
                key: key.clone(),
                from,
                action: "record verification",
            })?;

        let entry = LedgerEntry::staged(
            TransferState::Verified,
            digest.content_hash,
            digest.size_bytes,
            Utc::now(),
        );
        self.commit(key, entry)?;
        debug!(source = %self.source, key = %key, "Recorded verified");
        Ok(())
    }

    /// Record a failure. A verified key keeps its state.
    pub fn record_failed(
        &mut self,
        key: &ObjectKey,
        error: &str,
    ) -> Result<FailureRecord, LedgerError> {
        let from = self.state(key);
        if from == TransferState::Verified {
            warn!(
                source = %self.source,
                key = %key,
                error,
                "Ignoring failure for verified object"
            );
            return Ok(FailureRecord::KeptVerified);
        }

        self.commit(key, LedgerEntry::failed(error, Utc::now()))?;
        debug!(source = %self.source, key = %key, from = %from, "Recorded failed");
        Ok(FailureRecord::Recorded)
    }

    /// Replace the hash of a staged entry, keeping its state, size and timestamp.
    ///
    /// Imported MD5 digests go through here once the staged copy has been checked.
    pub fn upgrade_hash(
        &mut self,
        key: &ObjectKey,
        content_hash: ContentHash,
    ) -> Result<(), LedgerError> {
        let (from, digest, timestamp) = match self.entries.get(key) {
            Some(current) => (current.state(), current.digest(), current.timestamp()),
            None => (TransferState::Pending, None, Utc::now()),
        };
        let Some(digest) = digest else {
            return Err(LedgerError::InvalidTransition {
                key: key.clone(),
                from,
                action: "replace hash",
            });
        };

        let entry = LedgerEntry::staged(from, content_hash, digest.size_bytes, timestamp);
        self.commit(key, entry)?;
        debug!(source = %self.source, key = %key, state = %from, "Upgraded content hash");
        Ok(())
    }

    /// Operator retry: forget a key so the next run starts it from pending.
    pub fn reset(&mut self, key: &ObjectKey) -> Result<Option<LedgerEntry>, LedgerError> {
        let Some(previous) = self.entries.remove(key) else {
            return Ok(None);
        };
        if let Err(e) = self.persist() {
            self.entries.insert(key.clone(), previous);
            return Err(e);
        }
        info!(source = %self.source, key = %key, from = %previous.state(), "Ledger entry reset");
        Ok(Some(previous))
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            entries: self.entries.clone(),
        }
    }

    fn commit(&mut self, key: &ObjectKey, entry: LedgerEntry) -> Result<(), LedgerError> {
        let previous = self.entries.insert(key.clone(), entry);
        if let Err(e) = self.persist() {
            match previous {
                Some(previous) => self.entries.insert(key.clone(), previous),
                None => self.entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Write the whole document to `<ledger>.tmp`, fsync, then rename over the ledger.
    fn persist(&self) -> Result<(), LedgerError> {
        let document = LedgerDocument {
            version: LEDGER_VERSION,
            source: self.source.clone(),
            entries: self.entries.clone(),
        };
        let json = serde_json::to_vec_pretty(&document)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        let mut temp_name = self.path.file_name().unwrap_or_default().to_os_string();
        temp_name.push(".tmp");
        let temp_path = self.path.with_file_name(temp_name);

        let mut file = std::fs::File::create(&temp_path).map_err(io_err(&temp_path))?;
        file.write_all(&json).map_err(io_err(&temp_path))?;
        file.sync_all().map_err(io_err(&temp_path))?;
        drop(file);

        std::fs::rename(&temp_path, &self.path).map_err(io_err(&self.path))?;
        sync_parent_dir(&self.path);
        Ok(())
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> LedgerError + use<> {
    let path = path.to_path_buf();
    move |source| LedgerError::Io { path, source }
}

/// Persist the rename itself. Best effort: not every platform can open directories.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}

fn parse_document(
    path: &Path,
    content: &str,
) -> Result<BTreeMap<ObjectKey, LedgerEntry>, LedgerError> {
    let corrupt = |reason: String| LedgerError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let value: serde_json::Value =
        serde_json::from_str(content).map_err(|e| corrupt(e.to_string()))?;

    if value.get("entries").is_some() || value.get("version").is_some() {
        let document: LedgerDocument =
            serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))?;
        if document.version > LEDGER_VERSION {
            return Err(corrupt(format!(
                "unsupported ledger version {}",
                document.version
            )));
        }
        for (key, entry) in &document.entries {
            entry
                .check()
                .map_err(|reason| corrupt(format!("entry '{}': {}", key, reason)))?;
        }
        return Ok(document.entries);
    }

    if legacy::looks_legacy(&value) {
        let entries = legacy::convert(value).map_err(|e| corrupt(e.to_string()))?;
        info!(
            path = %path.display(),
            entries = entries.len(),
            "Converted legacy ledger"
        );
        return Ok(entries);
    }

    Err(corrupt("unrecognised ledger document".to_string()))
}
