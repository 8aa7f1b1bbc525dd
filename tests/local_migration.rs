//! Full pipeline over local-directory buckets: configuration, context, orchestrator.

use std::path::Path;

use objmig::config::{AppConfig, BackendSettings, Provider, SourceSettings};
use objmig::context::AppContext;
use objmig::core::{ObjectKey, Orchestrator, Selection, TransferState};
use objmig::error::InitError;
use tempfile::tempdir;

fn create_file(path: &Path, content: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

fn local(root: &Path) -> BackendSettings {
    BackendSettings {
        provider: Provider::Local,
        root: Some(root.to_path_buf()),
        ..Default::default()
    }
}

fn config(dir: &Path) -> AppConfig {
    let mut config = AppConfig {
        staging_root: dir.join("downloads"),
        ledger_dir: dir.join("ledgers"),
        concurrency: 2,
        destination: local(&dir.join("archive")),
        ..Default::default()
    };
    config.sources.insert(
        "aliyun".to_string(),
        SourceSettings {
            backend: local(&dir.join("aliyun-bucket")),
            destination_prefix: None,
        },
    );
    config
}

#[tokio::test]
async fn local_buckets_migrate_end_to_end() {
    let temp = tempdir().unwrap();
    create_file(&temp.path().join("aliyun-bucket/a.txt"), b"0123456789");
    create_file(
        &temp.path().join("aliyun-bucket/b/c.txt"),
        b"01234567890123456789",
    );

    let orchestrator = Orchestrator::new(AppContext::init(config(temp.path())).unwrap());

    let listing = orchestrator.list("aliyun").await.unwrap();
    assert_eq!(
        listing,
        vec![
            (ObjectKey::from("a.txt"), TransferState::Pending),
            (ObjectKey::from("b/c.txt"), TransferState::Pending),
        ]
    );

    let runs = orchestrator.migrate(None).await.unwrap();
    let report = runs[0].result.as_ref().unwrap();
    assert_eq!(report.len(), 2);
    assert_eq!(report.failed_count(), 0);

    assert_eq!(
        std::fs::read(temp.path().join("archive/b/c.txt")).unwrap(),
        b"01234567890123456789"
    );
    assert!(temp.path().join("ledgers/aliyun_status.json").exists());
    assert!(temp.path().join("downloads/aliyun/a.txt").exists());

    let summary = &orchestrator.summaries(None).await.unwrap()[0];
    assert_eq!((summary.downloaded, summary.uploaded, summary.verified), (2, 2, 2));
    assert!(summary.failed.is_empty());
}

#[tokio::test]
async fn dotfiles_and_temporary_names_are_migrated() {
    let temp = tempdir().unwrap();
    create_file(&temp.path().join("aliyun-bucket/.env"), b"KEY=value");
    create_file(&temp.path().join("aliyun-bucket/report.tmp"), b"draft");

    let orchestrator = Orchestrator::new(AppContext::init(config(temp.path())).unwrap());
    let runs = orchestrator.migrate(None).await.unwrap();
    let report = runs[0].result.as_ref().unwrap();
    assert_eq!(report.len(), 2);
    assert_eq!(report.failed_count(), 0);

    assert_eq!(std::fs::read(temp.path().join("archive/.env")).unwrap(), b"KEY=value");
    assert_eq!(std::fs::read(temp.path().join("archive/report.tmp")).unwrap(), b"draft");

    let status = orchestrator.status(Some("aliyun")).await.unwrap();
    let staged: Vec<_> = status[0].1.iter().map(|s| s.file.key.as_str()).collect();
    assert_eq!(staged, vec![".env", "report.tmp"]);
}

#[tokio::test]
async fn step_commands_follow_the_lifecycle() {
    let temp = tempdir().unwrap();
    create_file(&temp.path().join("aliyun-bucket/a.txt"), b"0123456789");
    let orchestrator = Orchestrator::new(AppContext::init(config(temp.path())).unwrap());
    let a = ObjectKey::from("a.txt");

    orchestrator
        .download("aliyun", Selection::One(a.clone()))
        .await
        .unwrap();
    orchestrator.upload("aliyun", Selection::All).await.unwrap();
    let report = orchestrator.verify("aliyun", Selection::All).await.unwrap();
    assert_eq!(report.len(), 1);
    assert_eq!(report.failed_count(), 0);

    let listing = orchestrator.list("aliyun").await.unwrap();
    assert_eq!(listing, vec![(a.clone(), TransferState::Verified)]);

    assert_eq!(
        orchestrator.retry("aliyun", &a).await.unwrap(),
        Some(TransferState::Verified)
    );
    assert_eq!(orchestrator.retry("aliyun", &a).await.unwrap(), None);
}

#[tokio::test]
async fn ledger_survives_a_new_context() {
    let temp = tempdir().unwrap();
    create_file(&temp.path().join("aliyun-bucket/a.txt"), b"0123456789");

    {
        let orchestrator = Orchestrator::new(AppContext::init(config(temp.path())).unwrap());
        orchestrator.download("aliyun", Selection::All).await.unwrap();
    }

    let orchestrator = Orchestrator::new(AppContext::init(config(temp.path())).unwrap());
    let status = orchestrator.status(Some("aliyun")).await.unwrap();
    assert_eq!(status[0].1.len(), 1);
    assert_eq!(status[0].1[0].state, Some(TransferState::Downloaded));
}

#[tokio::test]
async fn self_test_round_trips_through_the_destination() {
    let temp = tempdir().unwrap();
    let orchestrator = Orchestrator::new(AppContext::init(config(temp.path())).unwrap());

    let report = orchestrator.self_test().await.unwrap();
    assert!(report.size_bytes > 0);
    assert!(!temp.path().join("archive").join(report.key.as_str()).exists());
}

#[test]
fn invalid_configuration_fails_initialisation() {
    let temp = tempdir().unwrap();
    let mut config = config(temp.path());
    config.destination = BackendSettings::default();

    assert!(matches!(AppContext::init(config), Err(InitError::Config(_))));
}

#[test]
fn corrupt_ledger_fails_initialisation() {
    let temp = tempdir().unwrap();
    create_file(&temp.path().join("ledgers/aliyun_status.json"), b"{ not json");

    assert!(matches!(
        AppContext::init(config(temp.path())),
        Err(InitError::Ledger(_))
    ));
}
