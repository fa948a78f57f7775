// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use async_trait::async_trait;
use genqueue::domain::models::progress::StageEvent;
use genqueue::domain::models::task::{Artifact, Task, TaskKind, TaskPayload};
use genqueue::engines::traits::{BackendError, GenerationBackend, ProgressReporter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// 按提示词决定结果的脚本化后端
///
/// 提示词包含 `fail` 的任务返回执行错误，其余任务成功。
/// 同时记录调用次数和同时执行的峰值。
pub struct ScriptedBackend {
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    current: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            gate: None,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// 每个任务完成前需要从 `gate` 取得一个许可
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(Duration::ZERO)
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn run(&self, task: &Task, progress: ProgressReporter) -> Result<Artifact, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        progress.report(StageEvent::Started {
            stage: "inference".to_string(),
        });
        progress.report(StageEvent::Step {
            stage: "inference".to_string(),
            step: 1,
            total: 2,
        });
        tokio::time::sleep(self.delay).await;
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.current.fetch_sub(1, Ordering::SeqCst);

        if prompt_of(task).contains("fail") {
            return Err(BackendError::Execution("scripted failure".to_string()));
        }
        Ok(Artifact::new(format!("memory://artifacts/{}.png", task.id)))
    }

    fn supports(&self, _kind: TaskKind) -> u8 {
        100
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

fn prompt_of(task: &Task) -> &str {
    match &task.payload {
        TaskPayload::TextToImage(params) => &params.prompt,
        TaskPayload::ImageToImage(params) => params.prompt.as_deref().unwrap_or_default(),
        TaskPayload::ImageToVideo(params) => &params.prompt,
    }
}
