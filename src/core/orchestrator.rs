use anyhow::{Context, Result};
use tracing::{error, info};

use crate::context::AppContext;
use crate::core::engine::{BatchStep, MigrationEngine, StagedStatus};
use crate::core::models::{ObjectKey, TransferState};
use crate::core::report::{MigrationSummary, TransferReport, summarize};
use crate::core::self_test::{SelfTestReport, run_self_test};
use crate::error::EngineError;

/// One object, or every eligible one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    One(ObjectKey),
    All,
}

/// Result of one source's batch inside a multi-source run.
#[derive(Debug)]
pub struct SourceRun {
    pub source: String,
    pub result: Result<TransferReport, EngineError>,
}

/// Entry point for every command: resolves sources and runs engines over them.
pub struct Orchestrator {
    ctx: AppContext,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    pub fn source_names(&self) -> Vec<String> {
        self.ctx.sources.keys().cloned().collect()
    }

    fn engine(&self, source: &str) -> Result<MigrationEngine> {
        Ok(self.ctx.engine(source)?)
    }

    /// Named source, or every configured one.
    fn targets(&self, source: Option<&str>) -> Result<Vec<String>> {
        match source {
            Some(name) => {
                self.ctx.source(name)?;
                Ok(vec![name.to_string()])
            }
            None => Ok(self.source_names()),
        }
    }

    pub async fn list(&self, source: &str) -> Result<Vec<(ObjectKey, TransferState)>> {
        let engine = self.engine(source)?;
        let listing = engine.inventory_with_state().await?;
        Ok(listing)
    }

    pub async fn download(&self, source: &str, selection: Selection) -> Result<TransferReport> {
        let engine = self.engine(source)?;
        let report = match selection {
            Selection::One(key) => engine.run_batch(vec![key], BatchStep::Download).await,
            Selection::All => engine.download_all().await,
        };
        report.with_context(|| format!("download from '{source}' aborted"))
    }

    pub async fn upload(&self, source: &str, selection: Selection) -> Result<TransferReport> {
        let engine = self.engine(source)?;
        let report = match selection {
            Selection::One(key) => engine.run_batch(vec![key], BatchStep::Upload).await,
            Selection::All => engine.upload_staged().await,
        };
        report.with_context(|| format!("upload from '{source}' aborted"))
    }

    pub async fn verify(&self, source: &str, selection: Selection) -> Result<TransferReport> {
        let engine = self.engine(source)?;
        let report = match selection {
            Selection::One(key) => engine.run_batch(vec![key], BatchStep::Verify).await,
            Selection::All => engine.verify_uploaded().await,
        };
        report.with_context(|| format!("verification of '{source}' aborted"))
    }

    /// Full migration of one source or all of them. A source whose batch aborts does
    /// not stop the others.
    pub async fn migrate(&self, source: Option<&str>) -> Result<Vec<SourceRun>> {
        let mut runs = Vec::new();
        for name in self.targets(source)? {
            if self.ctx.cancel.is_cancelled() {
                info!(source = %name, "Cancelled, not starting source");
                break;
            }

            let engine = self.engine(&name)?;
            let result = engine.migrate_all().await;
            if let Err(e) = &result {
                error!(source = %name, error = %e, "Migration aborted");
            }
            runs.push(SourceRun {
                source: name,
                result,
            });
        }
        Ok(runs)
    }

    /// Staged files per source, with their ledger state.
    pub async fn status(&self, source: Option<&str>) -> Result<Vec<(String, Vec<StagedStatus>)>> {
        let mut statuses = Vec::new();
        for name in self.targets(source)? {
            let engine = self.engine(&name)?;
            let files = engine
                .staged_files()
                .await
                .with_context(|| format!("failed to scan staging directory for '{name}'"))?;
            statuses.push((name, files));
        }
        Ok(statuses)
    }

    pub async fn summaries(&self, source: Option<&str>) -> Result<Vec<MigrationSummary>> {
        let mut summaries = Vec::new();
        for name in self.targets(source)? {
            let snapshot = self.ctx.source(&name)?.ledger.lock().await.snapshot();
            summaries.push(summarize(&name, &snapshot));
        }
        Ok(summaries)
    }

    /// Reset a key so the next run migrates it from scratch. Returns the state it had.
    pub async fn retry(&self, source: &str, key: &ObjectKey) -> Result<Option<TransferState>> {
        let engine = self.engine(source)?;
        let previous = engine
            .retry(key)
            .await
            .with_context(|| format!("failed to reset '{key}' in '{source}'"))?;
        Ok(previous)
    }

    pub async fn self_test(&self) -> Result<SelfTestReport> {
        let report = run_self_test(self.ctx.destination.as_ref(), &self.ctx.config.staging_root)
            .await
            .context("destination self-test failed")?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{DestinationBackend, SimulatedBucket, SourceBackend};
    use crate::config::{AppConfig, BackendSettings, Provider, SourceSettings};
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn source_settings(prefix: Option<&str>) -> SourceSettings {
        SourceSettings {
            backend: BackendSettings {
                provider: Provider::Local,
                root: Some("/unused".into()),
                ..Default::default()
            },
            destination_prefix: prefix.map(str::to_string),
        }
    }

    fn orchestrator(
        dir: &Path,
        sources: Vec<(&str, Arc<SimulatedBucket>, Option<&str>)>,
        destination: Arc<SimulatedBucket>,
    ) -> Orchestrator {
        let mut config = AppConfig {
            staging_root: dir.join("downloads"),
            ledger_dir: dir.to_path_buf(),
            ..Default::default()
        };
        let mut backends: BTreeMap<String, Arc<dyn SourceBackend>> = BTreeMap::new();
        for (name, bucket, prefix) in sources {
            config
                .sources
                .insert(name.to_string(), source_settings(prefix));
            backends.insert(name.to_string(), bucket);
        }
        let destination: Arc<dyn DestinationBackend> = destination;
        Orchestrator::new(AppContext::with_backends(config, destination, backends).unwrap())
    }

    #[tokio::test]
    async fn test_listing_failure_does_not_stop_other_sources() {
        let temp = tempdir().unwrap();
        let aliyun = Arc::new(SimulatedBucket::new("aliyun"));
        aliyun.insert("a.txt", "from aliyun");
        aliyun.fail_listing();
        let tencent = Arc::new(SimulatedBucket::new("tencent"));
        tencent.insert("t.txt", "from tencent");
        let destination = Arc::new(SimulatedBucket::new("destination"));

        let orchestrator = orchestrator(
            temp.path(),
            vec![("aliyun", aliyun, None), ("tencent", tencent, None)],
            destination.clone(),
        );

        let runs = orchestrator.migrate(None).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(matches!(runs[0].result, Err(EngineError::List(_))));
        let report = runs[1].result.as_ref().unwrap();
        assert_eq!(report.failed_count(), 0);
        assert_eq!(destination.object("t.txt").unwrap(), b"from tencent");
    }

    #[tokio::test]
    async fn test_destination_prefix_separates_sources() {
        let temp = tempdir().unwrap();
        let aliyun = Arc::new(SimulatedBucket::new("aliyun"));
        aliyun.insert("same.txt", "aliyun copy");
        let tencent = Arc::new(SimulatedBucket::new("tencent"));
        tencent.insert("same.txt", "tencent copy!");
        let destination = Arc::new(SimulatedBucket::new("destination"));

        let orchestrator = orchestrator(
            temp.path(),
            vec![
                ("aliyun", aliyun, Some("aliyun")),
                ("tencent", tencent, Some("tencent")),
            ],
            destination.clone(),
        );
        orchestrator.migrate(None).await.unwrap();

        assert_eq!(destination.object("aliyun/same.txt").unwrap(), b"aliyun copy");
        assert_eq!(destination.object("tencent/same.txt").unwrap(), b"tencent copy!");

        let summaries = orchestrator.summaries(None).await.unwrap();
        assert!(summaries.iter().all(|s| s.verified == 1 && s.failed.is_empty()));
    }

    #[tokio::test]
    async fn test_status_reports_untracked_files() {
        let temp = tempdir().unwrap();
        let aliyun = Arc::new(SimulatedBucket::new("aliyun"));
        aliyun.insert("a.txt", "0123456789");
        let destination = Arc::new(SimulatedBucket::new("destination"));
        let orchestrator = orchestrator(temp.path(), vec![("aliyun", aliyun, None)], destination);

        orchestrator
            .download("aliyun", Selection::One(ObjectKey::from("a.txt")))
            .await
            .unwrap();
        std::fs::write(temp.path().join("downloads/aliyun/stray.bin"), b"?").unwrap();

        let status = orchestrator.status(Some("aliyun")).await.unwrap();
        let files = &status[0].1;
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].file.key, ObjectKey::from("a.txt"));
        assert_eq!(files[0].state, Some(TransferState::Downloaded));
        assert_eq!(files[1].file.key, ObjectKey::from("stray.bin"));
        assert_eq!(files[1].state, None);
    }

    #[tokio::test]
    async fn test_unknown_source_is_an_error() {
        let temp = tempdir().unwrap();
        let destination = Arc::new(SimulatedBucket::new("destination"));
        let orchestrator = orchestrator(temp.path(), Vec::new(), destination);
        assert!(orchestrator.list("nowhere").await.is_err());
        assert!(orchestrator.migrate(Some("nowhere")).await.is_err());
    }
}
