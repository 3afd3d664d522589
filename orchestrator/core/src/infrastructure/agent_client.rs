// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Agent REST client
//!
//! [`AgentApi`] over the agents' HTTPS surface. The farm CA is the only
//! trust root; agent certificates are not checked against the address
//! since cloud agents come up on addresses nobody knew at bootstrap.
//!
//! Every JSON response is wrapped as `{success, message?, data?}`; raw
//! result downloads carry their digest in `X-Checksum-Sha1`.

use crate::domain::agent::{AgentApi, AgentApiError, NodeStatus, ResultDownload};
use crate::domain::blob::{BlobError, BlobId, ResultKind};
use crate::domain::task::TaskStatusView;
use crate::domain::workload::Workload;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::debug;

pub const API_PREFIX: &str = "api/v1";
pub const CHECKSUM_HEADER: &str = "X-Checksum-Sha1";

#[derive(Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<T>,
}

#[derive(Clone)]
pub struct HttpAgentClient {
    client: Client,
    user: String,
    password: String,
}

impl HttpAgentClient {
    pub fn new(
        user: impl Into<String>,
        password: impl Into<String>,
        ca_pem: &[u8],
        timeout: Duration,
    ) -> Result<Self, AgentApiError> {
        let ca = reqwest::Certificate::from_pem(ca_pem)
            .map_err(|e| AgentApiError::Protocol(format!("invalid CA certificate: {}", e)))?;
        let client = Client::builder()
            .tls_certs_only([ca])
            .danger_accept_invalid_hostnames(true)
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| AgentApiError::Protocol(e.to_string()))?;
        Ok(Self {
            client,
            user: user.into(),
            password: password.into(),
        })
    }

    fn url(&self, address: &str, segments: &[&str]) -> Result<Url, AgentApiError> {
        let mut url = Url::parse(&format!("https://{}/", address))
            .map_err(|e| AgentApiError::Protocol(format!("invalid agent address {}: {}", address, e)))?;
        url.path_segments_mut()
            .map_err(|_| AgentApiError::Protocol(format!("invalid agent address {}", address)))?
            .pop_if_empty()
            .extend(API_PREFIX.split('/'))
            .extend(segments.iter().flat_map(|s| s.split('/')));
        Ok(url)
    }

    fn request(&self, method: Method, address: &str, segments: &[&str]) -> Result<RequestBuilder, AgentApiError> {
        let url = self.url(address, segments)?;
        Ok(self
            .client
            .request(method, url)
            .basic_auth(&self.user, Some(&self.password)))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, AgentApiError> {
        let response = request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                AgentApiError::Unreachable(e.to_string())
            } else {
                AgentApiError::Protocol(e.to_string())
            }
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = match response.json::<Envelope<serde_json::Value>>().await {
            Ok(envelope) => envelope.message.unwrap_or_default(),
            Err(_) => String::new(),
        };
        Err(match status {
            StatusCode::NOT_FOUND => AgentApiError::NotFound(message),
            status => AgentApiError::Rejected {
                status: status.as_u16(),
                message,
            },
        })
    }

    /// Send and unwrap `data` from the envelope
    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, AgentApiError> {
        let envelope: Envelope<T> = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| AgentApiError::Protocol(e.to_string()))?;
        if !envelope.success {
            return Err(AgentApiError::Protocol(
                envelope.message.unwrap_or_else(|| "request failed".to_string()),
            ));
        }
        envelope
            .data
            .ok_or_else(|| AgentApiError::Protocol("response without data".to_string()))
    }

    /// Send, caring only about success
    async fn command(&self, request: RequestBuilder) -> Result<(), AgentApiError> {
        self.send(request).await.map(|_| ())
    }
}

#[async_trait]
impl AgentApi for HttpAgentClient {
    async fn status(&self, address: &str) -> Result<NodeStatus, AgentApiError> {
        self.call(self.request(Method::GET, address, &["status"])?).await
    }

    async fn task_create(&self, address: &str, workload: &Workload) -> Result<Vec<String>, AgentApiError> {
        let body = json!({
            "config": workload.config,
            "files": workload.files,
        });
        let request = self
            .request(Method::PUT, address, &["task", &workload.name])?
            .json(&body);
        self.call(request).await
    }

    async fn upload_file(
        &self,
        address: &str,
        task: &str,
        path: &str,
        id: &BlobId,
        source: &Path,
        size: u64,
    ) -> Result<(), AgentApiError> {
        let file = tokio::fs::File::open(source).await?;
        debug!(address, task, path, blob = %id, size, "Uploading file to agent");
        let request = self
            .request(Method::PUT, address, &["task", task, "file", path])?
            .header(CONTENT_LENGTH, size)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CHECKSUM_HEADER, id.as_str())
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)));
        self.command(request).await
    }

    async fn task_run(&self, address: &str, task: &str) -> Result<(), AgentApiError> {
        self.command(self.request(Method::PUT, address, &["task", task, "run"])?)
            .await
    }

    async fn task_stop(&self, address: &str, task: &str) -> Result<(), AgentApiError> {
        self.command(self.request(Method::PUT, address, &["task", task, "stop"])?)
            .await
    }

    async fn task_remove(&self, address: &str, task: &str) -> Result<(), AgentApiError> {
        self.command(self.request(Method::DELETE, address, &["task", task])?)
            .await
    }

    async fn task_status(&self, address: &str, task: &str) -> Result<TaskStatusView, AgentApiError> {
        self.call(self.request(Method::GET, address, &["task", task, "status"])?)
            .await
    }

    async fn task_details(&self, address: &str, task: &str) -> Result<serde_json::Value, AgentApiError> {
        self.call(self.request(Method::GET, address, &["task", task, "details"])?)
            .await
    }

    async fn task_messages(&self, address: &str, task: &str) -> Result<serde_json::Value, AgentApiError> {
        self.call(self.request(Method::GET, address, &["task", task, "messages"])?)
            .await
    }

    async fn download_result(
        &self,
        address: &str,
        task: &str,
        kind: ResultKind,
    ) -> Result<ResultDownload, AgentApiError> {
        let request = self.request(
            Method::GET,
            address,
            &["task", task, "status", "result", kind.as_str()],
        )?;
        let response = self.send(request).await?;
        let id = response
            .headers()
            .get(CHECKSUM_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AgentApiError::Protocol(format!("missing {} header", CHECKSUM_HEADER)))
            .and_then(|v| BlobId::parse(v).map_err(|e| AgentApiError::Protocol(e.to_string())))?;
        let size = response
            .content_length()
            .ok_or_else(|| AgentApiError::Protocol("missing Content-Length".to_string()))?;
        let stream = response
            .bytes_stream()
            .map_err(|e| BlobError::Stream(e.to_string()))
            .boxed();
        Ok(ResultDownload { id, size, stream })
    }
}
