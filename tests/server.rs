use chrono::Utc;
use serde_json::Value;
use tempfile::TempDir;

use level0_core::format::blocks::BlockKind;
use level0_core::format::synth;
use level0_core::models::{ExecutionId, FileDescriptor};
use level0_core::ports::ExecutionStore;
use odin_level0::config::Config;
use odin_level0::pipeline::Pipeline;
use odin_level0::server::serve_with_listener;

const KEY: &str = "L0/2024-01-01/0ce86a42.ac1";

async fn start_server() -> (TempDir, Pipeline, String) {
    let tmp = TempDir::new().unwrap();
    let mirror = tmp.path().join("mirror");
    let file = mirror.join(KEY);
    std::fs::create_dir_all(file.parent().unwrap()).unwrap();
    std::fs::write(&file, synth::ac_file(BlockKind::Ac1, 0x0ce86a42, 4)).unwrap();

    let config = Config::minimal(tmp.path().join("level0.sqlite"), mirror);
    let pipeline = Pipeline::open(&config).await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let served = pipeline.clone();
    tokio::spawn(async move {
        serve_with_listener(served, listener).await.unwrap();
    });
    (tmp, pipeline, base)
}

#[tokio::test]
async fn test_health() {
    let (_tmp, _pipeline, base) = start_server().await;
    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["queued"], 0);
}

#[tokio::test]
async fn test_list_and_get_executions() {
    let (_tmp, pipeline, base) = start_server().await;
    pipeline.import_one(KEY, "v1").await.unwrap();
    let id = ExecutionId::derive(KEY, "v1");

    let body: Value = reqwest::get(format!("{}/executions?state=succeeded", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let listed = body["executions"].as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["id"], id.as_str());
    assert_eq!(listed[0]["attempt_count"], 1);

    let body: Value = reqwest::get(format!("{}/executions?state=failed", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(body["executions"].as_array().unwrap().is_empty());

    let resp = reqwest::get(format!("{}/executions/{}", base, id)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["state"], "succeeded");
    assert_eq!(body["summary"]["row_count"], 4);
    assert_eq!(body["partial_success"], false);
}

#[tokio::test]
async fn test_error_responses() {
    let (_tmp, _pipeline, base) = start_server().await;

    let resp = reqwest::get(format!("{}/executions/bogus", base)).await.unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let missing = ExecutionId::derive("L0/none.ac1", "v1");
    let resp = reqwest::get(format!("{}/executions/{}", base, missing)).await.unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let resp = reqwest::get(format!("{}/executions?state=sleeping", base)).await.unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_cancel_pending_execution() {
    let (_tmp, pipeline, base) = start_server().await;
    let descriptor = FileDescriptor::new(KEY, "v2", Utc::now());
    let id = descriptor.execution_id();
    pipeline.executions.start(&id, &descriptor).await.unwrap();

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/executions/{}/cancel?reason=reprocessing", base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["state"], "failed");
    assert_eq!(body["last_error"]["kind"], "Cancelled");
    assert_eq!(body["last_error"]["message"], "reprocessing");

    let resp = client
        .post(format!("{}/executions/{}/cancel", base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "conflict");
}
