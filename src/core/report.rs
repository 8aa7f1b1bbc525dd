//! Per-batch transfer reports and ledger summaries.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use super::ledger::LedgerSnapshot;
use super::models::{ObjectKey, TransferState};

/// Step of the per-object lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Upload,
    Verify,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Download => "download",
            Self::Upload => "upload",
            Self::Verify => "verify",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyVerified,
    /// Uploaded or verified; the staged copy is not needed again.
    AlreadyPublished,
    /// Nothing staged to upload.
    NotStaged,
    NotUploaded,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::AlreadyVerified => "already verified",
            Self::AlreadyPublished => "already published",
            Self::NotStaged => "not staged",
            Self::NotUploaded => "not uploaded",
        };
        f.write_str(reason)
    }
}

/// What happened to one object in one engine call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ObjectOutcome {
    Downloaded {
        size_bytes: u64,
        /// The staged copy still matched its recorded hash and was not fetched again
        reused: bool,
    },
    Uploaded,
    Verified,
    Skipped {
        reason: SkipReason,
    },
    Failed {
        stage: Stage,
        error: String,
    },
}

impl ObjectOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl fmt::Display for ObjectOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Downloaded {
                size_bytes,
                reused: false,
            } => write!(f, "downloaded ({size_bytes} bytes)"),
            Self::Downloaded {
                size_bytes,
                reused: true,
            } => write!(f, "reused staged copy ({size_bytes} bytes)"),
            Self::Uploaded => f.write_str("uploaded"),
            Self::Verified => f.write_str("verified"),
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
            Self::Failed { stage, error } => write!(f, "{stage} failed: {error}"),
        }
    }
}

/// Outcomes of one batch, keyed by object rather than completion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    pub outcomes: BTreeMap<ObjectKey, ObjectOutcome>,
    /// Cancellation stopped the batch before every object was started.
    pub cancelled: bool,
}

impl TransferReport {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&ObjectOutcome> {
        self.outcomes.get(key)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&ObjectKey, &ObjectOutcome)> {
        self.outcomes.iter().filter(|(_, o)| o.is_failure())
    }

    pub fn failed_count(&self) -> usize {
        self.failures().count()
    }

    pub fn skipped_count(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, ObjectOutcome::Skipped { .. }))
            .count()
    }
}

/// Human-facing counts for one source.
///
/// Counts are cumulative: a verified object has also been downloaded and uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationSummary {
    pub source: String,
    pub downloaded: usize,
    pub uploaded: usize,
    pub verified: usize,
    pub failed: Vec<(ObjectKey, String)>,
}

/// Aggregate a ledger snapshot. Pure read.
pub fn summarize(source: &str, snapshot: &LedgerSnapshot) -> MigrationSummary {
    let mut summary = MigrationSummary {
        source: source.to_string(),
        downloaded: 0,
        uploaded: 0,
        verified: 0,
        failed: Vec::new(),
    };

    for (key, entry) in snapshot.iter() {
        match entry.state() {
            TransferState::Pending => {}
            TransferState::Downloaded => summary.downloaded += 1,
            TransferState::Uploaded => {
                summary.downloaded += 1;
                summary.uploaded += 1;
            }
            TransferState::Verified => {
                summary.downloaded += 1;
                summary.uploaded += 1;
                summary.verified += 1;
            }
            TransferState::Failed => summary.failed.push((
                key.clone(),
                entry.last_error().unwrap_or_default().to_string(),
            )),
        }
    }

    summary
}

impl fmt::Display for MigrationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.source)?;
        writeln!(f, "  downloaded: {}", self.downloaded)?;
        writeln!(f, "  uploaded:   {}", self.uploaded)?;
        writeln!(f, "  verified:   {}", self.verified)?;
        write!(f, "  failed:     {}", self.failed.len())?;
        for (key, error) in &self.failed {
            write!(f, "\n    {key}: {error}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ledger::TransferLedger;
    use crate::core::models::ContentHash;
    use tempfile::tempdir;

    #[test]
    fn test_summary_counts_are_cumulative() {
        let temp = tempdir().unwrap();
        let mut ledger =
            TransferLedger::open("aliyun", TransferLedger::path_in(temp.path(), "aliyun")).unwrap();

        let hash = ContentHash::new("h");
        for key in ["a", "b", "c"] {
            ledger
                .record_downloaded(&ObjectKey::from(key), hash.clone(), 1)
                .unwrap();
        }
        ledger.record_uploaded(&ObjectKey::from("b"), &hash).unwrap();
        ledger.record_uploaded(&ObjectKey::from("c"), &hash).unwrap();
        ledger.record_verified(&ObjectKey::from("c")).unwrap();
        ledger
            .record_failed(&ObjectKey::from("d"), "network error")
            .unwrap();

        let summary = summarize("aliyun", &ledger.snapshot());
        assert_eq!(summary.downloaded, 3);
        assert_eq!(summary.uploaded, 2);
        assert_eq!(summary.verified, 1);
        assert_eq!(
            summary.failed,
            vec![(ObjectKey::from("d"), "network error".to_string())]
        );

        let rendered = summary.to_string();
        assert!(rendered.contains("d: network error"));
    }

    #[test]
    fn test_empty_snapshot() {
        let summary = summarize("tencent", &LedgerSnapshot::default());
        assert_eq!(
            (summary.downloaded, summary.uploaded, summary.verified),
            (0, 0, 0)
        );
        assert!(summary.failed.is_empty());
    }
}
