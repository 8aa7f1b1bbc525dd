use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use objmig::core::{ObjectKey, Orchestrator, Selection, TransferReport};
use objmig::logging::{self, LogConfig};
use objmig::{config, context};
use serde::Serialize;
use tracing::warn;

#[derive(Parser)]
#[command(name = "objmig")]
#[command(about = "Resumable object-storage migration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ./objmig.toml, optional)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

/// Settings that can be overridden per invocation.
#[derive(Args, Serialize)]
struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    staging_root: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    ledger_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, short = 'j', global = true)]
    concurrency: Option<usize>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, short, global = true)]
    verbose: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List a source's objects with their ledger state
    List { source: String },
    /// Stage objects locally
    Download(StepArgs),
    /// Publish staged objects to the destination
    Upload(StepArgs),
    /// Check uploaded objects against the destination
    Verify(StepArgs),
    /// Download, upload and verify everything not yet verified
    Migrate { source: Option<String> },
    /// Show staged files and their ledger state
    Status { source: Option<String> },
    /// Show ledger counts and failures
    Summary { source: Option<String> },
    /// Forget a key's ledger entry so the next run starts it over
    Retry { source: String, key: String },
    /// Round-trip a probe object through the destination
    SelfTest,
    /// Print the effective configuration with secrets redacted
    Config,
}

#[derive(Args)]
struct StepArgs {
    source: String,

    #[command(flatten)]
    target: Target,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct Target {
    /// Object key
    key: Option<String>,

    /// Every eligible object
    #[arg(long)]
    all: bool,
}

impl Target {
    fn selection(&self) -> Selection {
        match &self.key {
            Some(key) if !self.all => Selection::One(ObjectKey::new(key.clone())),
            _ => Selection::All,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = config::AppConfig::new(cli.config.as_deref(), Some(&cli.overrides))?;

    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    // Printing the configuration must work even when it does not validate
    if let Commands::Config = cli.command {
        print_config(&config)?;
        return Ok(ExitCode::SUCCESS);
    }

    let ctx = context::AppContext::init(config).context("Failed to initialise")?;
    watch_ctrl_c(ctx.cancel.clone());
    let orchestrator = Orchestrator::new(ctx);

    let success = match cli.command {
        Commands::List { source } => {
            for (key, state) in orchestrator.list(&source).await? {
                println!("{state:<10} {key}");
            }
            true
        }
        Commands::Download(args) => {
            let report = orchestrator
                .download(&args.source, args.target.selection())
                .await?;
            print_report(&args.source, &report)
        }
        Commands::Upload(args) => {
            let report = orchestrator
                .upload(&args.source, args.target.selection())
                .await?;
            print_report(&args.source, &report)
        }
        Commands::Verify(args) => {
            let report = orchestrator
                .verify(&args.source, args.target.selection())
                .await?;
            print_report(&args.source, &report)
        }
        Commands::Migrate { source } => {
            let mut success = true;
            for run in orchestrator.migrate(source.as_deref()).await? {
                match run.result {
                    Ok(report) => success &= print_report(&run.source, &report),
                    Err(e) => {
                        println!("{}: aborted: {e}", run.source);
                        success = false;
                    }
                }
            }
            success
        }
        Commands::Status { source } => {
            for (name, files) in orchestrator.status(source.as_deref()).await? {
                println!("{name}:");
                if files.is_empty() {
                    println!("  (nothing staged)");
                }
                for status in files {
                    let state = status
                        .state
                        .map_or_else(|| "untracked".to_string(), |s| s.to_string());
                    println!(
                        "  {state:<10} {:>12} {}",
                        status.file.size_bytes, status.file.key
                    );
                }
            }
            true
        }
        Commands::Summary { source } => {
            let summaries = orchestrator.summaries(source.as_deref()).await?;
            for summary in &summaries {
                println!("{summary}");
            }
            summaries.iter().all(|s| s.failed.is_empty())
        }
        Commands::Retry { source, key } => {
            let key = ObjectKey::new(key);
            match orchestrator.retry(&source, &key).await? {
                Some(previous) => println!("{key}: reset from {previous}, will be migrated again"),
                None => println!("{key}: no ledger entry"),
            }
            true
        }
        Commands::SelfTest => {
            let report = orchestrator.self_test().await?;
            println!(
                "self-test passed: {} ({} bytes)",
                report.key, report.size_bytes
            );
            true
        }
        Commands::Config => {
            print_config(&orchestrator.context().config)?;
            true
        }
    };

    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_config(config: &config::AppConfig) -> Result<()> {
    let rendered =
        toml::to_string_pretty(&config.redacted()).context("Failed to render configuration")?;
    print!("{rendered}");
    Ok(())
}

/// Stop starting new objects on Ctrl-C; in-flight ones finish.
fn watch_ctrl_c(cancel: tokio_util::sync::CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight objects");
            cancel.cancel();
        }
    });
}

/// Print one line per object, then totals. Returns false if anything failed.
fn print_report(source: &str, report: &TransferReport) -> bool {
    for (key, outcome) in &report.outcomes {
        println!("{source}/{key}: {outcome}");
    }

    let failed = report.failed_count();
    println!(
        "{source}: {} processed, {} skipped, {failed} failed{}",
        report.len(),
        report.skipped_count(),
        if report.cancelled { " (cancelled)" } else { "" }
    );
    for (key, outcome) in report.failures() {
        println!("  {key}: {outcome}");
    }

    failed == 0 && !report.cancelled
}
