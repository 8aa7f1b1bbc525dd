use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backends::{self, DestinationBackend, SourceBackend};
use crate::config::{AppConfig, SourceSettings};
use crate::core::engine::MigrationEngine;
use crate::core::ledger::{SharedLedger, TransferLedger};
use crate::core::staging::StagingArea;
use crate::error::{ConfigError, InitError};

/// Everything one configured source needs at runtime.
#[derive(Clone)]
pub struct SourceContext {
    pub settings: SourceSettings,
    pub backend: Arc<dyn SourceBackend>,
    pub ledger: SharedLedger,
}

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub destination: Arc<dyn DestinationBackend>,
    pub sources: BTreeMap<String, SourceContext>,
    pub cancel: CancellationToken,
}

impl AppContext {
    /// Validate the configuration, build every backend and open every ledger.
    pub fn init(config: AppConfig) -> Result<Self, InitError> {
        config.validate()?;

        let destination = backends::create_destination(&config.destination)?;
        let mut sources = BTreeMap::new();
        for (name, settings) in &config.sources {
            sources.insert(
                name.clone(),
                backends::create_source(name, &settings.backend)?,
            );
        }

        Self::with_backends(config, destination, sources)
    }

    /// Assemble a context around already constructed backends.
    ///
    /// Every backend in `sources` must have a matching entry in `config.sources`.
    pub fn with_backends(
        config: AppConfig,
        destination: Arc<dyn DestinationBackend>,
        sources: BTreeMap<String, Arc<dyn SourceBackend>>,
    ) -> Result<Self, InitError> {
        let mut contexts = BTreeMap::new();
        for (name, backend) in sources {
            let settings = config.source(&name)?.clone();
            let ledger = TransferLedger::open(&name, TransferLedger::path_in(&config.ledger_dir, &name))?;
            contexts.insert(
                name,
                SourceContext {
                    settings,
                    backend,
                    ledger: ledger.into_shared(),
                },
            );
        }

        info!(
            sources = contexts.len(),
            destination = %destination.provider(),
            "Context initialised"
        );

        Ok(Self {
            config: Arc::new(config),
            destination,
            sources: contexts,
            cancel: CancellationToken::new(),
        })
    }

    pub fn source(&self, name: &str) -> Result<&SourceContext, ConfigError> {
        self.sources
            .get(name)
            .ok_or_else(|| ConfigError::UnknownSource(name.to_string()))
    }

    /// Engine for one source, wired to the shared destination and cancellation token.
    pub fn engine(&self, name: &str) -> Result<MigrationEngine, ConfigError> {
        let source = self.source(name)?;
        Ok(MigrationEngine::new(
            source.backend.clone(),
            self.destination.clone(),
            source.ledger.clone(),
            StagingArea::new(&self.config.staging_root, name),
        )
        .with_concurrency(self.config.concurrency)
        .with_destination_prefix(source.settings.destination_prefix.clone())
        .with_cancellation(self.cancel.clone()))
    }
}
