// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::domain::models::progress::StageEvent;
use crate::domain::models::task::{Artifact, Task, TaskKind};
use crate::engines::sse::{self, BackendEvent, LineBuffer};
use crate::engines::traits::{BackendError, GenerationBackend, ProgressReporter};

/// JSON 响应体
#[derive(Debug, Deserialize)]
struct GenerationResponse {
    uri: Option<String>,
    url: Option<String>,
    #[serde(default)]
    metadata: serde_json::Value,
}

/// 基于 HTTP 的生成后端
///
/// 向 `{base_url}generate/{kind}` 提交任务，响应可以是一次性 JSON，
/// 也可以是逐行推送进度的 SSE 流。整体超时由调度器控制。
pub struct HttpGenerationBackend {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpGenerationBackend {
    /// 创建 HTTP 生成后端
    ///
    /// # 参数
    ///
    /// * `base_url` - 后端服务根地址
    /// * `connect_timeout` - 建立连接的超时时间
    pub fn new(base_url: Url, connect_timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("genqueue/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, kind: TaskKind) -> Result<Url, BackendError> {
        self.base_url
            .join(kind.endpoint_path())
            .map_err(|e| BackendError::Unavailable(format!("invalid backend endpoint: {}", e)))
    }

    async fn read_stream(
        &self,
        task: &Task,
        response: reqwest::Response,
        progress: &ProgressReporter,
    ) -> Result<Artifact, BackendError> {
        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::default();
        let mut artifact = None;
        let mut succeeded = false;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            let dropped = lines.dropped();
            let complete = lines.push(&chunk);
            if lines.dropped() > dropped {
                warn!(
                    task_id = %task.id,
                    limit = sse::MAX_LINE_BYTES,
                    "Dropping oversized backend event line"
                );
            }
            for line in complete {
                if let Some(found) = self.handle_line(task, &line, progress, &mut succeeded)? {
                    artifact = Some(found);
                }
            }
        }
        if let Some(line) = lines.finish() {
            if let Some(found) = self.handle_line(task, &line, progress, &mut succeeded)? {
                artifact = Some(found);
            }
        }

        match artifact {
            Some(artifact) => Ok(artifact),
            None if succeeded => Err(BackendError::InvalidResponse(
                "execution succeeded without producing an artifact".to_string(),
            )),
            None => Err(BackendError::InvalidResponse(
                "event stream ended before completion".to_string(),
            )),
        }
    }

    fn handle_line(
        &self,
        task: &Task,
        line: &str,
        progress: &ProgressReporter,
        succeeded: &mut bool,
    ) -> Result<Option<Artifact>, BackendError> {
        let event = match sse::parse_line(line) {
            None => return Ok(None),
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                warn!(task_id = %task.id, "Skipping malformed backend event: {}", e);
                return Ok(None);
            }
        };

        if let Some(stage_event) = event.stage_event() {
            progress.report(stage_event);
        }

        match event {
            BackendEvent::Executed { node, artifact } => {
                debug!(task_id = %task.id, node = ?node, "Backend node executed");
                Ok(artifact)
            }
            BackendEvent::Success => {
                *succeeded = true;
                Ok(None)
            }
            BackendEvent::Error { node, message } => {
                warn!(task_id = %task.id, node = ?node, "Backend reported execution error: {}", message);
                Err(BackendError::Execution(message))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl GenerationBackend for HttpGenerationBackend {
    async fn run(&self, task: &Task, progress: ProgressReporter) -> Result<Artifact, BackendError> {
        let endpoint = self.endpoint(task.kind())?;
        debug!(task_id = %task.id, endpoint = %endpoint, "Submitting generation request");

        let response = self
            .client
            .post(endpoint)
            .json(&json!({
                "task_id": task.id,
                "queue_id": task.queue_id,
                "payload": task.payload,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"));
        if is_stream {
            return self.read_stream(task, response, &progress).await;
        }

        let body: GenerationResponse = response.json().await?;
        let uri = body.uri.or(body.url).ok_or_else(|| {
            BackendError::InvalidResponse("response carries neither uri nor url".to_string())
        })?;
        progress.report(StageEvent::Finished);
        Ok(Artifact {
            uri,
            metadata: body.metadata,
        })
    }

    fn supports(&self, _kind: TaskKind) -> u8 {
        100
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
