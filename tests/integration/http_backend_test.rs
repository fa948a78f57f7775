// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::helpers::text_task;
use genqueue::domain::models::progress::StageEvent;
use genqueue::domain::models::task::{FailureCode, Task};
use genqueue::engines::http_engine::HttpGenerationBackend;
use genqueue::engines::traits::{BackendError, GenerationBackend, ProgressReporter};
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn backend(server: &MockServer) -> HttpGenerationBackend {
    let base_url = Url::parse(&format!("{}/", server.uri())).unwrap();
    HttpGenerationBackend::new(base_url, Duration::from_secs(2)).unwrap()
}

fn task() -> Task {
    Task::new(Uuid::new_v4(), 0, text_task("a quiet harbour"))
}

#[tokio::test]
async fn test_json_response_yields_artifact() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generate/text-to-image"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "url": "https://cdn.example.com/out.png",
            "metadata": { "seed": 42 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let task = task();
    let artifact = backend(&server)
        .run(&task, ProgressReporter::disabled())
        .await
        .unwrap();
    assert_eq!(artifact.uri, "https://cdn.example.com/out.png");
    assert_eq!(artifact.metadata["seed"], 42);

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["task_id"], task.id.to_string());
    assert_eq!(body["payload"]["kind"], "text_to_image");
    assert_eq!(body["payload"]["prompt"], "a quiet harbour");
}

#[tokio::test]
async fn test_event_stream_reports_progress_and_artifact() {
    let server = MockServer::start().await;
    let events = [
        json!({ "type": "executing", "data": { "node": "27" } }),
        json!({ "type": "progress", "data": { "node": "27", "value": 3, "max": 10 } }),
        json!({ "type": "executing", "data": { "node": "30" } }),
        json!({ "type": "executed", "data": { "node": "30", "output": { "gifs": [ { "fullpath": "/out/clip.mp4" } ] } } }),
        json!({ "type": "execution_success", "data": {} }),
    ];
    let body: String = events
        .iter()
        .map(|event| format!("data: {}\n\n", event))
        .collect();
    Mock::given(method("POST"))
        .and(path("/generate/text-to-image"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let (reporter, mut receiver) = ProgressReporter::channel();
    let artifact = backend(&server).run(&task(), reporter).await.unwrap();
    assert_eq!(artifact.uri, "/out/clip.mp4");

    let mut received = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        received.push(event);
    }
    assert!(received.contains(&StageEvent::Started {
        stage: "27".to_string()
    }));
    assert!(received.contains(&StageEvent::Step {
        stage: "27".to_string(),
        step: 3,
        total: 10
    }));
}

#[tokio::test]
async fn test_execution_error_event_fails_task() {
    let server = MockServer::start().await;
    let body = format!(
        "data: {}\n\ndata: {}\n\n",
        json!({ "type": "executing", "data": { "node": "13" } }),
        json!({ "type": "execution_error", "data": { "node_id": "13", "exception_message": "CUDA out of memory" } }),
    );
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let err = backend(&server)
        .run(&task(), ProgressReporter::disabled())
        .await
        .unwrap_err();
    match &err {
        BackendError::Execution(message) => assert!(message.contains("out of memory")),
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(!err.is_retryable());
    assert_eq!(err.failure_code(), FailureCode::Execution);
}

#[tokio::test]
async fn test_server_error_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let err = backend(&server)
        .run(&task(), ProgressReporter::disabled())
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Status { status: 503, .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_response_without_artifact_is_invalid() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "metadata": {} })))
        .mount(&server)
        .await;

    let err = backend(&server)
        .run(&task(), ProgressReporter::disabled())
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::InvalidResponse(_)));
}
