//! End-to-end runs of the pipeline over a filesystem mirror and a
//! temporary SQLite database.

use std::fs;
use std::path::Path;

use axum::{http::StatusCode, routing::post, Router};
use tempfile::TempDir;

use level0_core::backoff::RetryPolicy;
use level0_core::error::ErrorKind;
use level0_core::event::synthetic_s3_event;
use level0_core::format::blocks::BlockKind;
use level0_core::format::synth;
use level0_core::machine::ExecutionState;
use level0_core::models::{ExecutionId, FileType};
use level0_core::ports::ExecutionStore;
use odin_level0::config::{Config, SubscriberConfig};
use odin_level0::orchestrator::DriveOutcome;
use odin_level0::pipeline::Pipeline;
use odin_level0::storage::content_etag;

const SPECTRUM_KEY: &str = "L0/2024-01-01/0ce86a42.ac1";

fn subscriber(id: &str, file_types: &[&str]) -> SubscriberConfig {
    SubscriberConfig {
        id: id.to_string(),
        file_types: file_types.iter().map(|t| t.to_string()).collect(),
        key_globs: Vec::new(),
        delivery: "outbox".to_string(),
        url: None,
    }
}

fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::minimal(tmp.path().join("level0.sqlite"), tmp.path().join("mirror"));
    config.subscribers = vec![
        subscriber("level1", &["ac1", "ac2"]),
        subscriber("pointing", &["att"]),
    ];
    config
}

fn put(root: &Path, key: &str, bytes: &[u8]) {
    let path = root.join(key);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, bytes).unwrap();
}

async fn setup(config: Config) -> Pipeline {
    Pipeline::open(&config).await.unwrap()
}

fn mirror(tmp: &TempDir) -> std::path::PathBuf {
    tmp.path().join("mirror")
}

#[tokio::test]
async fn test_spectrum_file_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let bytes = synth::ac_file(BlockKind::Ac1, 0x0ce86a42, 128);
    put(&mirror(&tmp), SPECTRUM_KEY, &bytes);
    let pipeline = setup(test_config(&tmp)).await;

    let event = synthetic_s3_event(
        "odin-pdc-l0",
        SPECTRUM_KEY,
        Some(&content_etag(&bytes)),
        bytes.len() as u64,
    );
    pipeline.buffer.enqueue(&event.to_string()).await.unwrap();

    let report = pipeline.worker().run(true).await.unwrap();
    assert_eq!(report.messages, 1);
    assert_eq!(report.started, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.errors, 0);

    assert_eq!(pipeline.sink.row_count(FileType::Ac1).await.unwrap(), 128);
    let events = pipeline.outbox().events(None).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].subscriber_id, "level1");
    assert_eq!(events[0].row_count, 128);
    assert_eq!(events[0].trigger_object_key, SPECTRUM_KEY);

    let version = format!("etag:{}", content_etag(&bytes));
    let id = ExecutionId::derive(SPECTRUM_KEY, &version);
    let execution = pipeline.executions.load(&id).await.unwrap().unwrap();
    assert_eq!(execution.state, ExecutionState::Succeeded);
    assert_eq!(execution.import_attempts, 1);
    assert!(execution.last_error.is_none());
    assert_eq!(pipeline.buffer.depth().await.unwrap(), 0);

    // Redelivery of the same arrival changes nothing.
    pipeline.buffer.enqueue(&event.to_string()).await.unwrap();
    let report = pipeline.worker().run(true).await.unwrap();
    assert_eq!(report.messages, 1);
    assert_eq!(report.started, 0);
    assert_eq!(pipeline.sink.row_count(FileType::Ac1).await.unwrap(), 128);
    assert_eq!(pipeline.outbox().events(None).await.unwrap().len(), 1);
    assert_eq!(pipeline.sink.import_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_import_one_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    put(
        &mirror(&tmp),
        SPECTRUM_KEY,
        &synth::ac_file(BlockKind::Ac1, 0x0ce86a42, 16),
    );
    let pipeline = setup(test_config(&tmp)).await;

    for _ in 0..2 {
        match pipeline.import_one(SPECTRUM_KEY, "null").await.unwrap() {
            DriveOutcome::Finished(e) => assert_eq!(e.state, ExecutionState::Succeeded),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
    assert_eq!(pipeline.sink.row_count(FileType::Ac1).await.unwrap(), 16);
    assert_eq!(pipeline.sink.import_count().await.unwrap(), 1);
    assert_eq!(pipeline.outbox().events(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_each_file_type_reaches_its_table() {
    let tmp = TempDir::new().unwrap();
    let root = mirror(&tmp);
    put(&root, "ac2/0ce/0ce80000.ac2", &synth::ac_file(BlockKind::Ac2, 0x0ce80000, 4));
    put(&root, "fba/0ce/0ce80000.fba", &synth::fba_file(0x0ce80000, 8));
    put(&root, "shk/0ce/0ce80000.shk", &synth::shk_file(0x0ce80000, 4));
    put(
        &root,
        "att/0ce/0ce80000.att",
        synth::attitude_file(0x0ce80000, 5).as_bytes(),
    );
    let pipeline = setup(test_config(&tmp)).await;

    for key in [
        "ac2/0ce/0ce80000.ac2",
        "fba/0ce/0ce80000.fba",
        "shk/0ce/0ce80000.shk",
        "att/0ce/0ce80000.att",
    ] {
        match pipeline.import_one(key, "null").await.unwrap() {
            DriveOutcome::Finished(e) => {
                assert_eq!(e.state, ExecutionState::Succeeded, "{}: {:?}", key, e.last_error)
            }
            other => panic!("unexpected outcome for {}: {:?}", key, other),
        }
    }

    assert_eq!(pipeline.sink.row_count(FileType::Ac2).await.unwrap(), 4);
    assert_eq!(pipeline.sink.row_count(FileType::Ac1).await.unwrap(), 0);
    assert_eq!(pipeline.sink.row_count(FileType::Fba).await.unwrap(), 8);
    assert!(pipeline.sink.row_count(FileType::Shk).await.unwrap() > 0);
    assert_eq!(pipeline.sink.row_count(FileType::Att).await.unwrap(), 5);

    // Only the spectrum and attitude subscribers hear about their types.
    let events = pipeline.outbox().events(None).await.unwrap();
    let mut subscribers: Vec<_> = events
        .iter()
        .map(|e| (e.subscriber_id.as_str(), e.file_type))
        .collect();
    subscribers.sort_by_key(|(id, _)| *id);
    assert_eq!(
        subscribers,
        vec![("level1", FileType::Ac2), ("pointing", FileType::Att)]
    );
}

#[tokio::test]
async fn test_unroutable_and_missing_files_fail_permanently() {
    let tmp = TempDir::new().unwrap();
    put(&mirror(&tmp), "L0/2024-01-01/readme.txt", b"not telemetry");
    let pipeline = setup(test_config(&tmp)).await;

    let cases = [
        ("L0/2024-01-01/readme.txt", ErrorKind::UnroutableFileType),
        ("L0/2024-01-01/0ce86a42.fba", ErrorKind::ObjectNotFound),
    ];
    for (key, kind) in cases {
        let DriveOutcome::Finished(execution) = pipeline.import_one(key, "null").await.unwrap() else {
            panic!("{} did not finish", key);
        };
        assert_eq!(execution.state, ExecutionState::Failed);
        let error = execution.last_error.unwrap();
        assert_eq!(error.kind, kind);
        assert!(!error.retryable);
        assert!(execution.import_attempts <= 1);
    }
    assert!(pipeline.outbox().events(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unreachable_subscriber_is_partial_success() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/hook", post(|| async { StatusCode::SERVICE_UNAVAILABLE }));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let tmp = TempDir::new().unwrap();
    put(
        &mirror(&tmp),
        SPECTRUM_KEY,
        &synth::ac_file(BlockKind::Ac1, 0x0ce86a42, 8),
    );
    let mut config = test_config(&tmp);
    config.subscribers = vec![SubscriberConfig {
        id: "level1".to_string(),
        file_types: vec!["ac1".to_string()],
        key_globs: Vec::new(),
        delivery: "webhook".to_string(),
        url: Some(format!("http://{}/hook", addr)),
    }];
    config.orchestration.notify_retry = RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 10,
        multiplier: 2.0,
        max_delay_ms: 40,
    };
    let pipeline = setup(config).await;

    let DriveOutcome::Finished(execution) = pipeline.import_one(SPECTRUM_KEY, "null").await.unwrap()
    else {
        panic!("execution did not finish");
    };
    assert_eq!(execution.state, ExecutionState::Failed);
    assert!(execution.is_partial_success());
    assert_eq!(execution.notify_attempts, 3);
    assert_eq!(
        execution.last_error.as_ref().map(|e| e.kind),
        Some(ErrorKind::NotificationFailed)
    );
    assert_eq!(execution.summary.as_ref().map(|s| s.row_count), Some(8));
    assert_eq!(pipeline.sink.row_count(FileType::Ac1).await.unwrap(), 8);
}

#[tokio::test]
async fn test_undecodable_message_is_discarded() {
    let tmp = TempDir::new().unwrap();
    let pipeline = setup(test_config(&tmp)).await;

    pipeline.buffer.enqueue("{\"Records\": 12}").await.unwrap();
    let report = pipeline.worker().run(true).await.unwrap();
    assert_eq!(report.messages, 1);
    assert_eq!(report.started, 0);
    assert_eq!(pipeline.buffer.depth().await.unwrap(), 0);
    assert!(pipeline
        .executions
        .list(None, 10)
        .await
        .unwrap()
        .is_empty());
}
