//! Per-object migration state machine.
//!
//! ```text
//! Pending    --download--> Downloaded | Failed
//! Downloaded --upload-->   Uploaded   | Failed
//! Uploaded   --verify-->   Verified   | Failed
//! Failed     --re-run-->   starts again from download
//! ```
//!
//! Per-object failures never escape: they are logged, recorded as `Failed` in the
//! ledger and returned as [`ObjectOutcome::Failed`]. Only a ledger that cannot be
//! written (or a listing that cannot be read) stops a batch.

use std::collections::HashSet;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::hasher::{hash_file, md5_file};
use super::ledger::{FailureRecord, LedgerSnapshot, SharedLedger};
use super::models::{ContentHash, Digest, ObjectKey, TransferState};
use super::report::{ObjectOutcome, SkipReason, Stage, TransferReport};
use super::staging::{StagedFile, StagingArea};
use crate::backends::{DestinationBackend, SourceBackend};
use crate::error::{
    EngineError, LedgerError, ListError, TransferError, TransferErrorKind, VerificationError,
};
use crate::logging::BatchProgress;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Which step a batch runs for each key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStep {
    Download,
    Upload,
    Verify,
    /// Download, upload and verify, resuming from the recorded state.
    Migrate,
}

/// A staged file and the ledger's view of it; `None` means untracked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedStatus {
    pub file: StagedFile,
    pub state: Option<TransferState>,
}

/// What a staged file looks like next to its ledger digest.
enum StagedCopy {
    /// Holds the recorded bytes; carries the (possibly upgraded) recorded hash.
    Intact(ContentHash),
    Changed,
    Unreadable(std::io::Error),
}

/// Moves one source's objects to the destination.
pub struct MigrationEngine {
    source: Arc<dyn SourceBackend>,
    destination: Arc<dyn DestinationBackend>,
    ledger: SharedLedger,
    staging: StagingArea,
    destination_prefix: Option<String>,
    concurrency: usize,
    cancel: CancellationToken,
}

impl MigrationEngine {
    pub fn new(
        source: Arc<dyn SourceBackend>,
        destination: Arc<dyn DestinationBackend>,
        ledger: SharedLedger,
        staging: StagingArea,
    ) -> Self {
        Self {
            source,
            destination,
            ledger,
            staging,
            destination_prefix: None,
            concurrency: 1,
            cancel: CancellationToken::new(),
        }
    }

    /// Number of objects processed at once. Values below 1 are treated as 1.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_destination_prefix(mut self, prefix: Option<String>) -> Self {
        self.destination_prefix = prefix.filter(|p| !p.is_empty());
        self
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    pub async fn snapshot(&self) -> LedgerSnapshot {
        self.ledger.lock().await.snapshot()
    }

    /// Every key the source currently lists.
    pub async fn inventory(&self) -> Result<Vec<ObjectKey>, ListError> {
        let keys: Vec<ObjectKey> = self.source.list_objects().try_collect().await?;
        info!(source = %self.source_name(), objects = keys.len(), "Listed source");
        Ok(keys)
    }

    /// Every listed key with its ledger state.
    pub async fn inventory_with_state(
        &self,
    ) -> Result<Vec<(ObjectKey, TransferState)>, ListError> {
        let keys = self.inventory().await?;
        let snapshot = self.snapshot().await;
        Ok(keys
            .into_iter()
            .map(|key| {
                let state = snapshot.state(&key);
                (key, state)
            })
            .collect())
    }

    /// Files in the staging directory with their ledger state. Untracked files are
    /// reported, never adopted.
    pub async fn staged_files(&self) -> std::io::Result<Vec<StagedStatus>> {
        let files = self.staging.scan().await?;
        let snapshot = self.snapshot().await;
        Ok(files
            .into_iter()
            .map(|file| {
                let state = snapshot.get(&file.key).map(|entry| entry.state());
                StagedStatus { file, state }
            })
            .collect())
    }

    /// Operator retry: forget the key so the next run starts over.
    pub async fn retry(&self, key: &ObjectKey) -> Result<Option<TransferState>, LedgerError> {
        let previous = self.ledger.lock().await.reset(key)?;
        Ok(previous.map(|entry| entry.state()))
    }

    fn remote_key(&self, key: &ObjectKey) -> ObjectKey {
        key.with_prefix(self.destination_prefix.as_deref())
    }

    /// Stage one object, reusing a staged copy whose hash still matches the ledger.
    pub async fn download(&self, key: &ObjectKey) -> Result<ObjectOutcome, EngineError> {
        let source = self.source_name();
        let entry = self.ledger.lock().await.get(key).cloned();

        let path = match self.staging.prepare(key).await {
            Ok(path) => path,
            Err(e) => {
                return self
                    .fail(key, Stage::Download, TransferError::local(key, &e))
                    .await;
            }
        };

        if let Some(recorded) = entry.as_ref().and_then(|e| e.digest()) {
            match self.check_staged(key, &path, &recorded).await? {
                StagedCopy::Intact(_) => {
                    debug!(source, key = %key, "Staged copy matches ledger, skipping download");
                    return Ok(ObjectOutcome::Downloaded {
                        size_bytes: recorded.size_bytes,
                        reused: true,
                    });
                }
                StagedCopy::Changed => warn!(source, key = %key, "Staged copy changed since download"),
                StagedCopy::Unreadable(e) => {
                    debug!(source, key = %key, error = %e, "Staged copy unreadable")
                }
            }
        }

        if let Some(entry) = &entry {
            if matches!(entry.state(), TransferState::Uploaded | TransferState::Verified) {
                info!(
                    source,
                    key = %key,
                    state = %entry.state(),
                    "Already published, not downloading again"
                );
                return Ok(ObjectOutcome::Skipped {
                    reason: SkipReason::AlreadyPublished,
                });
            }
        }

        let digest = match self.source.fetch(key, &path).await {
            Ok(digest) => digest,
            Err(e) => return self.fail(key, Stage::Download, e).await,
        };

        self.ledger.lock().await.record_downloaded(
            key,
            digest.content_hash.clone(),
            digest.size_bytes,
        )?;
        info!(source, key = %key, size_bytes = digest.size_bytes, "Downloaded");

        Ok(ObjectOutcome::Downloaded {
            size_bytes: digest.size_bytes,
            reused: false,
        })
    }

    /// Publish the staged copy of a downloaded object.
    pub async fn upload(&self, key: &ObjectKey) -> Result<ObjectOutcome, EngineError> {
        let source = self.source_name();
        let entry = self.ledger.lock().await.get(key).cloned();

        let recorded = match entry.as_ref().map(|e| (e.state(), e.digest())) {
            Some((TransferState::Downloaded, Some(digest))) => digest,
            Some((TransferState::Uploaded | TransferState::Verified, _)) => {
                debug!(source, key = %key, "Already uploaded");
                return Ok(ObjectOutcome::Skipped {
                    reason: SkipReason::AlreadyPublished,
                });
            }
            _ => {
                return Ok(ObjectOutcome::Skipped {
                    reason: SkipReason::NotStaged,
                });
            }
        };

        let path = match self.staging.path_for(key) {
            Ok(path) => path,
            Err(e) => {
                let error = TransferError::new(TransferErrorKind::LocalIo, key, e.to_string());
                return self.fail(key, Stage::Upload, error).await;
            }
        };

        // Only the exact bytes that were recorded may be published
        let content_hash = match self.check_staged(key, &path, &recorded).await? {
            StagedCopy::Intact(hash) => hash,
            StagedCopy::Changed => {
                let error = TransferError::new(
                    TransferErrorKind::LocalIo,
                    key,
                    "staged copy no longer matches the recorded hash",
                );
                return self.fail(key, Stage::Upload, error).await;
            }
            StagedCopy::Unreadable(e) => {
                return self
                    .fail(key, Stage::Upload, TransferError::local(key, &e))
                    .await;
            }
        };

        let remote_key = self.remote_key(key);
        if let Err(e) = self.destination.put(&remote_key, &path).await {
            return self.fail(key, Stage::Upload, e).await;
        }

        self.ledger
            .lock()
            .await
            .record_uploaded(key, &content_hash)?;
        info!(source, key = %key, remote_key = %remote_key, "Uploaded");

        Ok(ObjectOutcome::Uploaded)
    }

    /// Compare the destination's size with the recorded one.
    ///
    /// Size is the only property every destination reports cheaply; equal size with
    /// different bytes passes this check.
    pub async fn verify(&self, key: &ObjectKey) -> Result<ObjectOutcome, EngineError> {
        let source = self.source_name();
        let entry = self.ledger.lock().await.get(key).cloned();

        let expected = match entry.as_ref().map(|e| (e.state(), e.size_bytes())) {
            Some((TransferState::Uploaded, Some(size))) => size,
            Some((TransferState::Verified, _)) => {
                return Ok(ObjectOutcome::Skipped {
                    reason: SkipReason::AlreadyVerified,
                });
            }
            _ => {
                return Ok(ObjectOutcome::Skipped {
                    reason: SkipReason::NotUploaded,
                });
            }
        };

        let remote_key = self.remote_key(key);
        let actual = match self.destination.stat_remote(&remote_key).await {
            Ok(actual) => actual,
            Err(e) => {
                return self
                    .fail(key, Stage::Verify, VerificationError::Stat(e))
                    .await;
            }
        };

        if actual != expected {
            return self
                .fail(
                    key,
                    Stage::Verify,
                    VerificationError::SizeMismatch { expected, actual },
                )
                .await;
        }

        self.ledger.lock().await.record_verified(key)?;
        info!(source, key = %key, size_bytes = actual, "Verified");

        Ok(ObjectOutcome::Verified)
    }

    /// Drive one object as far as it can go, starting from its recorded state.
    pub async fn migrate_object(&self, key: &ObjectKey) -> Result<ObjectOutcome, EngineError> {
        let state = self.ledger.lock().await.state(key);
        match state {
            TransferState::Verified => {
                return Ok(ObjectOutcome::Skipped {
                    reason: SkipReason::AlreadyVerified,
                });
            }
            TransferState::Uploaded => return self.verify(key).await,
            TransferState::Pending | TransferState::Downloaded | TransferState::Failed => {}
        }

        let downloaded = self.download(key).await?;
        if !matches!(downloaded, ObjectOutcome::Downloaded { .. }) {
            return Ok(downloaded);
        }

        let uploaded = self.upload(key).await?;
        if uploaded != ObjectOutcome::Uploaded {
            return Ok(uploaded);
        }

        self.verify(key).await
    }

    async fn run_step(&self, step: BatchStep, key: &ObjectKey) -> Result<ObjectOutcome, EngineError> {
        match step {
            BatchStep::Download => self.download(key).await,
            BatchStep::Upload => self.upload(key).await,
            BatchStep::Verify => self.verify(key).await,
            BatchStep::Migrate => self.migrate_object(key).await,
        }
    }

    /// Run `step` over `keys` with at most `concurrency` objects in flight.
    ///
    /// Duplicate keys run once. Cancellation stops new objects from starting; the
    /// ones already in flight finish.
    pub async fn run_batch(
        &self,
        keys: Vec<ObjectKey>,
        step: BatchStep,
    ) -> Result<TransferReport, EngineError> {
        let source = self.source_name();
        let mut seen = HashSet::new();
        let keys: Vec<ObjectKey> = keys.into_iter().filter(|k| seen.insert(k.clone())).collect();
        let total = keys.len();

        info!(source, ?step, total, concurrency = self.concurrency, "Starting batch");

        let cancel = self.cancel.clone();
        let mut results = futures::stream::iter(keys)
            .take_while(move |_| futures::future::ready(!cancel.is_cancelled()))
            .map(|key| async move {
                let outcome = self.run_step(step, &key).await;
                (key, outcome)
            })
            .buffer_unordered(self.concurrency);

        let mut progress = BatchProgress::new(source, total, PROGRESS_INTERVAL);
        let mut report = TransferReport::default();
        while let Some((key, outcome)) = results.next().await {
            report.outcomes.insert(key, outcome?);
            progress.advance(report.len());
        }

        report.cancelled = report.len() < total;
        if report.cancelled {
            warn!(source, done = report.len(), total, "Batch cancelled");
        }

        info!(
            source,
            ?step,
            processed = report.len(),
            failed = report.failed_count(),
            skipped = report.skipped_count(),
            "Batch finished"
        );
        Ok(report)
    }

    /// List the source and migrate every object.
    pub async fn migrate_all(&self) -> Result<TransferReport, EngineError> {
        let keys = self.inventory().await?;
        self.run_batch(keys, BatchStep::Migrate).await
    }

    pub async fn download_all(&self) -> Result<TransferReport, EngineError> {
        let keys = self.inventory().await?;
        self.run_batch(keys, BatchStep::Download).await
    }

    /// Upload every key the ledger records as downloaded.
    pub async fn upload_staged(&self) -> Result<TransferReport, EngineError> {
        let keys = self.snapshot().await.keys_in(TransferState::Downloaded);
        self.run_batch(keys, BatchStep::Upload).await
    }

    /// Verify every key the ledger records as uploaded.
    pub async fn verify_uploaded(&self) -> Result<TransferReport, EngineError> {
        let keys = self.snapshot().await.keys_in(TransferState::Uploaded);
        self.run_batch(keys, BatchStep::Verify).await
    }

    /// Compare a staged file with its recorded digest.
    ///
    /// An imported MD5 digest that still matches is replaced by the file's BLAKE3
    /// digest, so the check only costs an extra pass once per object.
    async fn check_staged(
        &self,
        key: &ObjectKey,
        path: &std::path::Path,
        recorded: &Digest,
    ) -> Result<StagedCopy, EngineError> {
        let current = match hash_file(path).await {
            Ok(current) => current,
            Err(e) => return Ok(StagedCopy::Unreadable(e)),
        };
        if current.content_hash == recorded.content_hash {
            return Ok(StagedCopy::Intact(current.content_hash));
        }

        let Some(expected) = recorded.content_hash.legacy_md5_hex() else {
            return Ok(StagedCopy::Changed);
        };
        if current.size_bytes != recorded.size_bytes {
            return Ok(StagedCopy::Changed);
        }
        match md5_file(path).await {
            Ok(actual) if actual == expected => {
                self.ledger
                    .lock()
                    .await
                    .upgrade_hash(key, current.content_hash.clone())?;
                info!(source = %self.source_name(), key = %key, "Imported MD5 digest confirmed, recorded BLAKE3");
                Ok(StagedCopy::Intact(current.content_hash))
            }
            Ok(_) => Ok(StagedCopy::Changed),
            Err(e) => Ok(StagedCopy::Unreadable(e)),
        }
    }

    /// Record a per-object failure and turn it into an outcome.
    async fn fail(
        &self,
        key: &ObjectKey,
        stage: Stage,
        error: impl Display,
    ) -> Result<ObjectOutcome, EngineError> {
        let message = error.to_string();
        warn!(source = %self.source_name(), key = %key, %stage, error = %message, "Object failed");

        if self.ledger.lock().await.record_failed(key, &message)? == FailureRecord::KeptVerified {
            debug!(source = %self.source_name(), key = %key, "Failure not recorded, object stays verified");
        }

        Ok(ObjectOutcome::Failed {
            stage,
            error: message,
        })
    }
}
