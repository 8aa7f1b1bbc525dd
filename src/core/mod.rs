pub mod engine;
pub mod hasher;
pub mod ledger;
pub mod models;
pub mod orchestrator;
pub mod report;
pub mod staging;

pub use engine::{BatchStep, MigrationEngine, StagedStatus};
pub use ledger::{LedgerSnapshot, SharedLedger, TransferLedger};
pub use models::{ContentHash, Digest, LedgerEntry, ObjectKey, TransferState};
pub use orchestrator::{Orchestrator, Selection, SourceRun};
pub use report::{MigrationSummary, ObjectOutcome, TransferReport, summarize};
pub use self_test::{SelfTestReport, run_self_test};
