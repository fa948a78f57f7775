// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::models::worker::{WorkerRecord, WorkerState};
use crate::domain::repositories::queue_repository::QueueRepository;
use crate::domain::repositories::worker_registry::WorkerRegistry;
use crate::queue::dispatcher::{DispatchSummary, TaskDispatcher};
use crate::utils::errors::WorkerError;

/// 工作单元配置
#[derive(Debug, Clone)]
pub struct WorkerUnitConfig {
    /// 心跳间隔
    pub heartbeat_interval: Duration,
    /// 队列调度所有权的有效期
    pub claim_ttl: Duration,
}

impl Default for WorkerUnitConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            claim_ttl: Duration::from_secs(30),
        }
    }
}

/// 工作单元与监管器共享的状态
#[derive(Debug)]
pub struct UnitShared {
    id: String,
    last_heartbeat: Mutex<Instant>,
    active_queues: Mutex<HashSet<Uuid>>,
    state: Mutex<WorkerState>,
}

impl UnitShared {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            last_heartbeat: Mutex::new(Instant::now()),
            active_queues: Mutex::new(HashSet::new()),
            state: Mutex::new(WorkerState::Starting),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn beat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock()
    }

    /// 当前正在调度的队列
    pub fn active_queues(&self) -> Vec<Uuid> {
        self.active_queues.lock().iter().copied().collect()
    }

    pub fn is_running_queue(&self, queue_id: Uuid) -> bool {
        self.active_queues.lock().contains(&queue_id)
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    fn set_state(&self, next: WorkerState) {
        let mut state = self.state.lock();
        let current = *state;
        if current.can_transition_to(next) {
            *state = next;
        } else {
            warn!(worker_id = %self.id, from = %current, to = %next, "Ignoring invalid worker state transition");
        }
    }

    /// 监管器判定崩溃后调用
    pub(crate) fn mark_crashed(&self) {
        self.set_state(WorkerState::Crashed);
        self.set_state(WorkerState::Terminated);
    }
}

/// 工作单元
///
/// 一个工作单元可以同时调度多个队列，每个队列一个调度循环。
/// 接收监管器分配的队列，先获取队列的调度所有权再开始执行，
/// 心跳时刷新注册表记录并续期所有权。
pub struct WorkerUnit {
    shared: Arc<UnitShared>,
    dispatcher: TaskDispatcher,
    repository: Arc<dyn QueueRepository>,
    registry: Arc<dyn WorkerRegistry>,
    assignments: mpsc::Receiver<Uuid>,
    config: WorkerUnitConfig,
    started_at: DateTime<Utc>,
}

impl WorkerUnit {
    /// 创建新的工作单元
    ///
    /// # 参数
    ///
    /// * `shared` - 与监管器共享的状态
    /// * `dispatcher` - 任务调度器
    /// * `repository` - 队列仓库
    /// * `registry` - 工作单元注册表
    /// * `assignments` - 队列分配通道
    /// * `config` - 工作单元配置
    pub fn new(
        shared: Arc<UnitShared>,
        dispatcher: TaskDispatcher,
        repository: Arc<dyn QueueRepository>,
        registry: Arc<dyn WorkerRegistry>,
        assignments: mpsc::Receiver<Uuid>,
        config: WorkerUnitConfig,
    ) -> Self {
        Self {
            shared,
            dispatcher,
            repository,
            registry,
            assignments,
            config,
            started_at: Utc::now(),
        }
    }

    fn record(&self) -> WorkerRecord {
        WorkerRecord {
            id: self.shared.id.clone(),
            pid: std::process::id(),
            state: self.shared.state(),
            assigned_queue_ids: self.shared.active_queues(),
            started_at: self.started_at,
            last_heartbeat: Utc::now(),
        }
    }

    /// 运行工作单元直到收到关闭信号
    ///
    /// # 返回值
    ///
    /// * `Ok(())` - 正常关闭
    /// * `Err(WorkerError)` - 启动失败或调度循环崩溃
    #[instrument(skip_all, fields(worker_id = %self.shared.id))]
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        self.registry
            .heartbeat(&self.record())
            .await
            .map_err(|e| WorkerError::Bootstrap(format!("worker registration failed: {}", e)))?;
        self.shared.set_state(WorkerState::Running);
        self.shared.beat();
        info!("Worker unit started");

        let mut dispatchers: JoinSet<(Uuid, Result<DispatchSummary, WorkerError>)> =
            JoinSet::new();
        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(queue_id) = self.assignments.recv() => {
                    self.accept(queue_id, &mut dispatchers, &shutdown).await;
                }
                Some(joined) = dispatchers.join_next() => {
                    self.on_dispatch_exit(joined).await?;
                }
                _ = heartbeat.tick() => self.heartbeat().await,
            }
        }

        self.shared.set_state(WorkerState::Stopping);
        info!(queues = dispatchers.len(), "Worker unit stopping");
        while let Some(joined) = dispatchers.join_next().await {
            self.on_dispatch_exit(joined).await?;
        }

        if let Err(e) = self.registry.deregister(&self.shared.id).await {
            warn!("Failed to deregister worker: {}", e);
        }
        self.shared.set_state(WorkerState::Terminated);
        info!("Worker unit stopped");
        Ok(())
    }

    /// 接受一个队列分配
    async fn accept(
        &self,
        queue_id: Uuid,
        dispatchers: &mut JoinSet<(Uuid, Result<DispatchSummary, WorkerError>)>,
        shutdown: &CancellationToken,
    ) {
        if self.shared.is_running_queue(queue_id) {
            return;
        }

        match self
            .repository
            .try_claim_queue(queue_id, &self.shared.id, self.config.claim_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(queue_id = %queue_id, "Queue already claimed by another worker");
                return;
            }
            Err(e) => {
                warn!(queue_id = %queue_id, "Failed to claim queue: {}", e);
                return;
            }
        }

        self.shared.active_queues.lock().insert(queue_id);
        let dispatcher = self.dispatcher.clone();
        let worker_id = self.shared.id.clone();
        let token = shutdown.child_token();
        dispatchers.spawn(async move {
            let result = dispatcher.run(queue_id, &worker_id, token).await;
            (queue_id, result)
        });
        debug!(queue_id = %queue_id, "Queue accepted");
    }

    async fn on_dispatch_exit(
        &self,
        joined: Result<(Uuid, Result<DispatchSummary, WorkerError>), JoinError>,
    ) -> Result<(), WorkerError> {
        let (queue_id, result) =
            joined.map_err(|e| WorkerError::Internal(format!("dispatcher task failed: {}", e)))?;

        self.shared.active_queues.lock().remove(&queue_id);
        if let Err(e) = self.repository.release_queue(queue_id, &self.shared.id).await {
            warn!(queue_id = %queue_id, "Failed to release queue claim: {}", e);
        }

        match result {
            Ok(summary) => debug!(
                queue_id = %queue_id,
                status = ?summary.final_status,
                "Dispatcher exited"
            ),
            Err(e) => warn!(queue_id = %queue_id, "Dispatcher stopped with error: {}", e),
        }
        Ok(())
    }

    async fn heartbeat(&self) {
        self.shared.beat();

        if let Err(e) = self.registry.heartbeat(&self.record()).await {
            warn!("Failed to publish heartbeat: {}", e);
        }

        for queue_id in self.shared.active_queues() {
            match self
                .repository
                .try_claim_queue(queue_id, &self.shared.id, self.config.claim_ttl)
                .await
            {
                Ok(true) => {}
                Ok(false) => warn!(queue_id = %queue_id, "Queue claim lost to another worker"),
                Err(e) => warn!(queue_id = %queue_id, "Failed to renew queue claim: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::task::{Artifact, Task, TaskKind, TaskPayload, TextToImageParams};
    use crate::domain::services::progress_tracker::ProgressTracker;
    use crate::domain::services::queue_manager::{QueueLimits, QueueManager};
    use crate::engines::traits::{BackendError, GenerationBackend, ProgressReporter};
    use crate::infrastructure::repositories::memory_queue_repo::MemoryQueueRepository;
    use crate::queue::dispatcher::DispatcherConfig;
    use async_trait::async_trait;

    struct InstantBackend;

    #[async_trait]
    impl GenerationBackend for InstantBackend {
        async fn run(&self, task: &Task, _progress: ProgressReporter) -> Result<Artifact, BackendError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(Artifact::new(format!("file:///{}.png", task.id)))
        }

        fn supports(&self, _kind: TaskKind) -> u8 {
            100
        }

        fn name(&self) -> &'static str {
            "instant"
        }
    }

    fn payload() -> TaskPayload {
        TaskPayload::TextToImage(TextToImageParams {
            prompt: "a lighthouse".to_string(),
            negative_prompt: None,
            width: None,
            height: None,
            seed: None,
            enhance: false,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_unit_runs_assigned_queue_and_deregisters() {
        let repo = Arc::new(MemoryQueueRepository::default());
        let manager = Arc::new(QueueManager::new(repo.clone(), QueueLimits::default()));
        let dispatcher = TaskDispatcher::new(
            manager.clone(),
            Arc::new(InstantBackend),
            Arc::new(ProgressTracker::new()),
            DispatcherConfig::default(),
        );
        let queue_id = manager
            .create_queue("alice", vec![payload(), payload()], None)
            .await
            .unwrap();

        let shared = Arc::new(UnitShared::new("unit-1"));
        let (sender, receiver) = mpsc::channel(8);
        let unit = WorkerUnit::new(
            shared.clone(),
            dispatcher,
            repo.clone(),
            repo.clone(),
            receiver,
            WorkerUnitConfig::default(),
        );
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(unit.run(shutdown.clone()));

        sender.send(queue_id).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let view = manager.get_status(queue_id).await.unwrap();
        assert_eq!(view.completed_tasks, 2);
        assert!(shared.active_queues().is_empty());
        assert_eq!(repo.queue_claimant(queue_id).await.unwrap(), None);
        assert_eq!(shared.state(), WorkerState::Running);
        assert_eq!(repo.workers().await.unwrap().len(), 1);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(shared.state(), WorkerState::Terminated);
        assert!(repo.workers().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unit_skips_queue_claimed_elsewhere() {
        let repo = Arc::new(MemoryQueueRepository::default());
        let manager = Arc::new(QueueManager::new(repo.clone(), QueueLimits::default()));
        let dispatcher = TaskDispatcher::new(
            manager.clone(),
            Arc::new(InstantBackend),
            Arc::new(ProgressTracker::new()),
            DispatcherConfig::default(),
        );
        let queue_id = manager
            .create_queue("alice", vec![payload()], None)
            .await
            .unwrap();
        assert!(repo
            .try_claim_queue(queue_id, "sibling", Duration::from_secs(30))
            .await
            .unwrap());

        let shared = Arc::new(UnitShared::new("unit-1"));
        let (sender, receiver) = mpsc::channel(8);
        let unit = WorkerUnit::new(
            shared.clone(),
            dispatcher,
            repo.clone(),
            repo.clone(),
            receiver,
            WorkerUnitConfig::default(),
        );
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(unit.run(shutdown.clone()));

        sender.send(queue_id).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let view = manager.get_status(queue_id).await.unwrap();
        assert_eq!(view.status, crate::domain::models::queue::QueueStatus::Waiting);
        assert!(shared.active_queues().is_empty());

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
