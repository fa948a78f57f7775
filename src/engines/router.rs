// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::models::task::{Artifact, Task, TaskKind};
use crate::engines::circuit_breaker::CircuitBreaker;
use crate::engines::traits::{BackendError, GenerationBackend, ProgressReporter};

/// 后端路由器
///
/// 按任务类型的支持分数选择后端，跳过熔断中的后端。
/// 只有连接失败（请求未到达后端）时才尝试下一个候选，避免重复执行。
pub struct BackendRouter {
    /// 后端列表
    backends: Vec<Arc<dyn GenerationBackend>>,
    /// 熔断器
    circuit_breaker: Arc<CircuitBreaker>,
}

impl BackendRouter {
    /// 创建新的后端路由器
    ///
    /// # 参数
    ///
    /// * `backends` - 后端列表
    /// * `circuit_breaker` - 熔断器
    pub fn new(
        backends: Vec<Arc<dyn GenerationBackend>>,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            backends,
            circuit_breaker,
        }
    }

    /// 按支持分数降序排列的候选后端
    fn candidates(&self, kind: TaskKind) -> Vec<(u8, Arc<dyn GenerationBackend>)> {
        let mut candidates: Vec<_> = self
            .backends
            .iter()
            .map(|backend| (backend.supports(kind), backend.clone()))
            .filter(|(score, _)| *score > 0)
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        candidates
    }
}

#[async_trait]
impl GenerationBackend for BackendRouter {
    async fn run(&self, task: &Task, progress: ProgressReporter) -> Result<Artifact, BackendError> {
        let kind = task.kind();
        let candidates = self.candidates(kind);
        if candidates.is_empty() {
            return Err(BackendError::Unavailable(format!(
                "no backend supports {}",
                kind
            )));
        }

        let mut last_error = None;
        for (score, backend) in candidates {
            let name = backend.name();
            if self.circuit_breaker.is_open(name) {
                debug!(backend = %name, "Skipping backend with open circuit");
                continue;
            }

            debug!(task_id = %task.id, backend = %name, score, "Routing task to backend");
            match backend.run(task, progress.clone()).await {
                Ok(artifact) => {
                    self.circuit_breaker.record_success(name);
                    return Ok(artifact);
                }
                Err(e) => {
                    if e.is_retryable() {
                        self.circuit_breaker.record_failure(name);
                    }
                    let unreached = matches!(&e, BackendError::Request(inner) if inner.is_connect());
                    if !unreached {
                        return Err(e);
                    }
                    warn!(backend = %name, "Backend unreachable, trying next: {}", e);
                    last_error = Some(e);
                }
            }
        }

        info!(task_id = %task.id, kind = %kind, "No backend available for task");
        Err(last_error.unwrap_or_else(|| {
            BackendError::Unavailable(format!("all backends for {} are circuit-open", kind))
        }))
    }

    fn supports(&self, kind: TaskKind) -> u8 {
        self.backends
            .iter()
            .map(|backend| backend.supports(kind))
            .max()
            .unwrap_or(0)
    }

    fn name(&self) -> &'static str {
        "router"
    }
}
