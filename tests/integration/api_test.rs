// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::helpers::Harness;
use axum::http::StatusCode;
use axum_test::TestServer;
use genqueue::presentation::routes;
use serde_json::{json, Value};

fn server(harness: &Harness) -> TestServer {
    TestServer::new(routes::routes(harness.manager.clone())).unwrap()
}

fn create_body(count: usize) -> Value {
    let tasks: Vec<Value> = (0..count)
        .map(|i| json!({ "kind": "text_to_image", "prompt": format!("castle {}", i) }))
        .collect();
    json!({ "tasks": tasks, "concurrency": 2 })
}

#[tokio::test]
async fn test_queue_lifecycle_over_http() {
    let harness = Harness::new();
    let server = server(&harness);

    let response = server
        .post("/v1/queues")
        .add_header("X-Owner-Id", "alice")
        .json(&create_body(2))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
    let queue_id = response.json::<Value>()["queue_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = server
        .get(&format!("/v1/queues/{}", queue_id))
        .add_header("X-Owner-Id", "alice")
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let view = response.json::<Value>();
    assert_eq!(view["status"], "waiting");
    assert_eq!(view["total_tasks"], 2);
    assert_eq!(view["pending_tasks"], 2);
    assert_eq!(view["tasks"].as_array().unwrap().len(), 2);
    assert_eq!(view["tasks"][0]["kind"], "text_to_image");
    assert_eq!(view["tasks"][0]["status"], "pending");

    let response = server
        .get(&format!("/v1/queues/{}", queue_id))
        .add_header("X-Owner-Id", "mallory")
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);

    let response = server.get("/v1/queues").add_header("X-Owner-Id", "alice").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>()["queues"].as_array().unwrap().len(), 1);

    let response = server
        .post(&format!("/v1/queues/{}/cancel", queue_id))
        .add_header("X-Owner-Id", "mallory")
        .await;
    assert_eq!(response.json::<Value>()["success"], false);

    let response = server
        .post(&format!("/v1/queues/{}/cancel", queue_id))
        .add_header("X-Owner-Id", "alice")
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>()["success"], true);

    let response = server
        .get(&format!("/v1/queues/{}", queue_id))
        .add_header("X-Owner-Id", "alice")
        .await;
    let view = response.json::<Value>();
    assert_eq!(view["status"], "cancelled");
    assert_eq!(view["cancelled_tasks"], 2);

    let response = server.get("/v1/queues").add_header("X-Owner-Id", "alice").await;
    assert!(response.json::<Value>()["queues"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_sixth_active_queue_is_rejected() {
    let harness = Harness::new();
    let server = server(&harness);

    for _ in 0..5 {
        let response = server
            .post("/v1/queues")
            .add_header("X-Owner-Id", "alice")
            .json(&create_body(1))
            .await;
        assert_eq!(response.status_code(), StatusCode::CREATED);
    }

    let response = server
        .post("/v1/queues")
        .add_header("X-Owner-Id", "alice")
        .json(&create_body(1))
        .await;
    assert_eq!(response.status_code(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.json::<Value>()["error"].as_str().unwrap().contains("5"));
    assert_eq!(harness.manager.list_active_queues("alice").await.unwrap().len(), 5);

    // 其他所有者不受影响
    let response = server
        .post("/v1/queues")
        .add_header("X-Owner-Id", "bob")
        .json(&create_body(1))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_rejects_bad_requests() {
    let harness = Harness::new();
    let server = server(&harness);

    let response = server.post("/v1/queues").json(&create_body(1)).await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert!(response.json::<Value>()["error"]
        .as_str()
        .unwrap()
        .contains("X-Owner-Id"));

    let response = server
        .post("/v1/queues")
        .add_header("X-Owner-Id", "alice")
        .json(&json!({ "tasks": [] }))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    let response = server
        .post("/v1/queues")
        .add_header("X-Owner-Id", "alice")
        .json(&json!({
            "tasks": [{ "kind": "image_to_video", "source_image": "in.png", "prompt": "waves", "steps": 500 }]
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    let response = server
        .get(&format!("/v1/queues/{}", uuid::Uuid::new_v4()))
        .add_header("X-Owner-Id", "alice")
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_and_version() {
    let harness = Harness::new();
    let server = server(&harness);

    let response = server.get("/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), "OK");

    let response = server.get("/v1/version").await;
    assert_eq!(response.text(), env!("CARGO_PKG_VERSION"));
}
