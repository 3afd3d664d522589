// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use chrono::Utc;
use renderfarm_core::application::executor::{TaskExecutor, TaskOutcome, TaskStrategy};
use renderfarm_core::application::task_handle::TaskHandle;
use renderfarm_core::domain::blob::{BlobId, ResultKind};
use renderfarm_core::domain::task::TaskKind;
use renderfarm_core::infrastructure::blob_cache::BlobCache;
use renderfarm_core::infrastructure::log_buffer::LogBuffer;
use renderfarm_core::infrastructure::repositories::InMemoryTaskRepository;
use renderfarm_core::infrastructure::system_probe::SystemProbe;
use renderfarm_core::presentation::api::{app, AppState};
use renderfarm_core::presentation::auth::BasicAuth;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const PROJECT: &[u8] = b"scene data";
const RENDER: &[u8] = b"rendered pixels";

/// Finishes every task at once with a fixed render
struct InstantRender {
    blobs: Arc<BlobCache>,
}

#[async_trait]
impl TaskStrategy for InstantRender {
    fn kind(&self) -> TaskKind {
        TaskKind::Agent
    }

    async fn execute(&self, task: Arc<TaskHandle>, _cancel: CancellationToken) -> TaskOutcome {
        let meta = match self.blobs.store_bytes(Bytes::from_static(RENDER)).await {
            Ok(meta) => meta,
            Err(e) => return TaskOutcome::Failed(e.to_string()),
        };
        task.modify(|t| {
            t.status.samples_done = t.config().samples;
            t.status.result.set(ResultKind::Render, Some(meta.id));
        });
        TaskOutcome::Completed
    }
}

struct Node {
    router: Router,
    auth: BasicAuth,
    blobs: Arc<BlobCache>,
    shutdown: CancellationToken,
    _dir: TempDir,
}

impl Node {
    fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let blobs = Arc::new(BlobCache::open(dir.path().join("cache"), None).unwrap());
        let strategy = Arc::new(InstantRender {
            blobs: blobs.clone(),
        });
        let executor = Arc::new(
            TaskExecutor::new(strategy, Arc::new(InMemoryTaskRepository::new()), blobs.clone())
                .with_tick(Duration::from_millis(10)),
        );
        let shutdown = CancellationToken::new();
        executor.spawn(shutdown.clone());

        let auth = BasicAuth::new("farm", "secret");
        let logs = LogBuffer::new(16);
        logs.push("node started");
        let state = AppState::new(
            executor,
            auth.clone(),
            SystemProbe::info("agent-1", "agent", Utc::now()),
        )
        .unwrap()
        .with_logs(logs);

        Self {
            router: app(Arc::new(state)),
            auth,
            blobs,
            shutdown,
            _dir: dir,
        }
    }

    fn request(&self, method: Method, path: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(path)
            .header(header::AUTHORIZATION, self.auth.header_value())
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Bytes) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body)
    }

    async fn json(&self, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        let body = match body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        };
        let request = self
            .request(method, path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .unwrap();
        let (status, bytes) = self.send(request).await;
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn upload(&self, path: &str, data: &'static [u8], checksum: &str) -> (StatusCode, Value) {
        let request = self
            .request(Method::PUT, path)
            .header(header::CONTENT_LENGTH, data.len())
            .header("X-Checksum-Sha1", checksum)
            .body(Body::from(data))
            .unwrap();
        let (status, bytes) = self.send(request).await;
        (status, serde_json::from_slice(&bytes).unwrap())
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[tokio::test]
async fn test_requests_without_credentials_are_rejected() {
    let node = Node::start();
    let request = Request::builder()
        .uri("/api/v1/info")
        .body(Body::empty())
        .unwrap();
    let response = node.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["success"], false);
    let endpoints = body["endpoints"].as_array().unwrap();
    assert!(endpoints.iter().any(|e| e == "PUT task/*/file/**"));

    let wrong = BasicAuth::new("farm", "guess");
    let request = Request::builder()
        .uri("/api/v1/info")
        .header(header::AUTHORIZATION, wrong.header_value())
        .body(Body::empty())
        .unwrap();
    let (status, _) = node.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unknown_endpoints_list_the_api() {
    let node = Node::start();

    let (status, body) = node.json(Method::GET, "/api/v1/nothing/here", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(!body["endpoints"].as_array().unwrap().is_empty());

    let (status, _) = node.json(Method::GET, "/elsewhere", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Agent management only exists on a manager
    let (status, body) = node.json(Method::GET, "/api/v1/agent", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_node_metadata_endpoints() {
    let node = Node::start();

    let (status, body) = node.json(Method::GET, "/api/v1/info", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["name"], "agent-1");
    assert_eq!(body["data"]["role"], "agent");

    let (status, body) = node.json(Method::GET, "/api/v1/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["terminating"], false);
    assert!(body["data"]["running"].as_array().unwrap().is_empty());

    let (_, body) = node.json(Method::GET, "/api/v1/log", None).await;
    assert_eq!(body["data"], json!(["node started"]));
}

#[tokio::test]
async fn test_task_lifecycle_over_rest() {
    let node = Node::start();
    let project_id = BlobId::digest(PROJECT);

    let (status, body) = node
        .json(
            Method::PUT,
            "/api/v1/task/shot-1",
            Some(json!({
                "config": { "project": "scene.blend", "samples": 16 },
                "files": { "scene.blend": project_id },
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!(["scene.blend"]));

    // Missing dependency: the task cannot be queued yet
    let (status, _) = node.json(Method::PUT, "/api/v1/task/shot-1/run", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // The failed integrity check put the task into ERROR; recreate it
    let (status, _) = node.json(Method::DELETE, "/api/v1/task/shot-1", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = node
        .json(
            Method::PUT,
            "/api/v1/task/shot-1",
            Some(json!({
                "config": { "project": "scene.blend", "samples": 16 },
                "files": { "scene.blend": project_id },
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = node
        .upload(
            "/api/v1/task/shot-1/file/scene.blend",
            PROJECT,
            project_id.as_str(),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["size"], PROJECT.len());

    let (status, body) = node.json(Method::GET, "/api/v1/task/shot-1/config", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["samples"], 16);

    let (status, _) = node.json(Method::PUT, "/api/v1/task/shot-1/run", None).await;
    assert_eq!(status, StatusCode::OK);

    let mut state = Value::Null;
    for _ in 0..200 {
        // Path parameters are percent-decoded
        let (_, body) = node.json(Method::GET, "/api/v1/task/shot%2D1/status", None).await;
        state = body["data"]["state"].clone();
        if state == "COMPLETED" {
            assert_eq!(body["data"]["samples_done"], 16);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, "COMPLETED");

    let (_, body) = node.json(Method::GET, "/api/v1/task", None).await;
    assert_eq!(body["data"]["shot-1"]["state"], "COMPLETED");

    let request = node
        .request(Method::GET, "/api/v1/task/shot-1/status/result/render")
        .body(Body::empty())
        .unwrap();
    let response = node.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["x-checksum-sha1"],
        BlobId::digest(RENDER).as_str()
    );
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], RENDER);

    // No preview was produced
    let (status, _) = node
        .json(Method::GET, "/api/v1/task/shot-1/status/result/preview", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // A finished task is no longer editable
    let (status, _) = node
        .json(
            Method::PUT,
            "/api/v1/task/shot-1/config",
            Some(json!({ "samples": 32 })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_upload_with_wrong_checksum_is_rejected() {
    let node = Node::start();
    let declared = BlobId::digest(b"something else");

    let (status, _) = node
        .json(
            Method::PUT,
            "/api/v1/task/shot",
            Some(json!({
                "config": { "project": "scene.blend" },
                "files": { "scene.blend": declared },
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = node
        .upload("/api/v1/task/shot/file/scene.blend", PROJECT, declared.as_str())
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(!node.blobs.contains(&declared));
    assert!(!node.blobs.contains(&BlobId::digest(PROJECT)));

    // Checksum header is mandatory
    let request = node
        .request(Method::PUT, "/api/v1/task/shot/file/scene.blend")
        .header(header::CONTENT_LENGTH, PROJECT.len())
        .body(Body::from(PROJECT))
        .unwrap();
    let (status, _) = node.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Uploads for unknown tasks are refused before any data is stored
    let (status, _) = node
        .upload(
            "/api/v1/task/ghost/file/scene.blend",
            PROJECT,
            BlobId::digest(PROJECT).as_str(),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(!node.blobs.contains(&BlobId::digest(PROJECT)));
}
