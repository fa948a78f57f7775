// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use metrics::{gauge, histogram};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::models::progress::{StageEvent, TaskProgress};
use crate::domain::models::queue::QueueStatus;
use crate::domain::models::task::{FailureCode, Task, TaskOutcome};
use crate::domain::repositories::queue_repository::{QueueRepository, StoreError};
use crate::domain::services::progress_tracker::ProgressTracker;
use crate::domain::services::queue_manager::{QueueError, QueueManager};
use crate::engines::traits::{GenerationBackend, ProgressReporter};
use crate::utils::errors::WorkerError;
use crate::utils::retry_policy::{loop_backoff, store_backoff};

/// 调度器配置
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// 单个任务的生成超时
    pub task_timeout: Duration,
    /// 关闭时等待执行中任务的宽限期
    pub shutdown_grace: Duration,
    /// 关闭阶段补记中止任务结果时的最长重试时间
    pub shutdown_report_retry: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(600),
            shutdown_grace: Duration::from_secs(30),
            shutdown_report_retry: Duration::from_secs(10),
        }
    }
}

/// 一次调度运行的统计
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchSummary {
    /// 本次启动的任务数
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    /// 因关闭超时被中止的任务数
    pub aborted: u64,
    /// 退出时队列的状态
    pub final_status: Option<QueueStatus>,
}

impl DispatchSummary {
    fn tally(&mut self, outcome: &TaskOutcome) {
        if outcome.is_success() {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// 执行中任务计数守卫，任务被中止时同样递减
struct InFlightGuard;

impl InFlightGuard {
    fn new() -> Self {
        gauge!("genqueue_tasks_in_flight").increment(1.0);
        Self
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        gauge!("genqueue_tasks_in_flight").decrement(1.0);
    }
}

/// 任务调度器
///
/// 每个队列一个调度循环：在并发上限内补充执行中任务，
/// 以先完成先唤醒的方式等待结果，慢任务不会阻塞快任务的启动。
#[derive(Clone)]
pub struct TaskDispatcher {
    manager: Arc<QueueManager>,
    backend: Arc<dyn GenerationBackend>,
    tracker: Arc<ProgressTracker>,
    config: DispatcherConfig,
}

impl TaskDispatcher {
    /// 创建新的任务调度器
    ///
    /// # 参数
    ///
    /// * `manager` - 队列管理服务
    /// * `backend` - 生成后端
    /// * `tracker` - 进度跟踪器
    /// * `config` - 调度器配置
    pub fn new(
        manager: Arc<QueueManager>,
        backend: Arc<dyn GenerationBackend>,
        tracker: Arc<ProgressTracker>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            manager,
            backend,
            tracker,
            config,
        }
    }

    fn repository(&self) -> &Arc<dyn QueueRepository> {
        self.manager.repository()
    }

    /// 运行一个队列直到排空或收到关闭信号
    ///
    /// # 参数
    ///
    /// * `queue_id` - 队列ID
    /// * `worker_id` - 执行该队列的工作单元ID
    /// * `shutdown` - 关闭信号
    ///
    /// # 返回值
    ///
    /// * `Ok(DispatchSummary)` - 本次运行统计
    /// * `Err(WorkerError)` - 启动阶段读取存储失败
    #[instrument(skip_all, fields(queue_id = %queue_id, worker_id = %worker_id))]
    pub async fn run(
        &self,
        queue_id: Uuid,
        worker_id: &str,
        shutdown: CancellationToken,
    ) -> Result<DispatchSummary, WorkerError> {
        let mut summary = DispatchSummary::default();

        let Some(queue) = self.repository().find(queue_id).await? else {
            debug!("Queue vanished before dispatch");
            return Ok(summary);
        };
        if !queue.is_active() {
            summary.final_status = Some(queue.status);
            return Ok(summary);
        }
        if queue.status == QueueStatus::Waiting {
            self.manager.begin_processing(queue_id).await?;
        }

        let concurrency = queue.concurrency.max(1);
        info!(concurrency, total = queue.total_tasks, "Dispatching queue");

        let mut in_flight: JoinSet<(Uuid, TaskOutcome)> = JoinSet::new();
        let mut task_ids: HashMap<Id, Uuid> = HashMap::new();
        let mut exhausted = false;
        let mut pauses = loop_backoff();

        loop {
            let mut store_failed = false;
            while !exhausted && in_flight.len() < concurrency && !shutdown.is_cancelled() {
                match self.repository().claim_next_task(queue_id, worker_id).await {
                    Ok(Some(task)) => {
                        let task_id = task.id;
                        let dispatcher = self.clone();
                        let handle = in_flight.spawn(async move { dispatcher.execute(task).await });
                        task_ids.insert(handle.id(), task_id);
                        summary.started += 1;
                        pauses.reset();
                    }
                    Ok(None) => exhausted = true,
                    Err(e) => {
                        warn!("Failed to claim next task: {}", e);
                        store_failed = true;
                        break;
                    }
                }
            }

            if in_flight.is_empty() {
                if shutdown.is_cancelled() {
                    break;
                }
                if exhausted {
                    match self.manager.finalize_if_drained(queue_id).await {
                        Ok(_) => break,
                        Err(e) => warn!("Failed to finalize drained queue: {}", e),
                    }
                }
                let pause = pauses.next_backoff().unwrap_or(Duration::from_secs(5));
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(pause) => continue,
                }
            }

            let pause = if store_failed {
                pauses.next_backoff().unwrap_or(Duration::from_secs(5))
            } else {
                Duration::ZERO
            };
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    self.drain(queue_id, &mut in_flight, &mut task_ids, &mut summary).await;
                    break;
                }
                Some(joined) = in_flight.join_next_with_id() => {
                    self.settle_joined(queue_id, joined, &mut task_ids, &mut summary).await;
                }
                _ = tokio::time::sleep(pause), if store_failed => {}
            }
        }

        summary.final_status = match self.repository().find(queue_id).await {
            Ok(queue) => queue.map(|q| q.status),
            Err(e) => {
                warn!("Failed to read final queue status: {}", e);
                None
            }
        };
        info!(
            started = summary.started,
            completed = summary.completed,
            failed = summary.failed,
            aborted = summary.aborted,
            status = ?summary.final_status,
            "Dispatch finished"
        );
        Ok(summary)
    }

    /// 关闭时等待宽限期，超时后中止剩余任务并记为失败
    async fn drain(
        &self,
        queue_id: Uuid,
        in_flight: &mut JoinSet<(Uuid, TaskOutcome)>,
        task_ids: &mut HashMap<Id, Uuid>,
        summary: &mut DispatchSummary,
    ) {
        if in_flight.is_empty() {
            return;
        }
        info!(
            in_flight = in_flight.len(),
            grace_secs = self.config.shutdown_grace.as_secs(),
            "Draining in-flight tasks"
        );

        let deadline = tokio::time::sleep(self.config.shutdown_grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                joined = in_flight.join_next_with_id() => match joined {
                    Some(joined) => self.settle_joined(queue_id, joined, task_ids, summary).await,
                    None => return,
                },
            }
        }

        warn!(remaining = in_flight.len(), "Grace period expired, aborting tasks");
        in_flight.abort_all();
        while let Some(joined) = in_flight.join_next_with_id().await {
            self.settle_joined(queue_id, joined, task_ids, summary).await;
        }
    }

    /// 处理一个结束的执行单元
    ///
    /// 正常结束时结果已在任务内上报；被中止或崩溃时在此补记失败。
    async fn settle_joined(
        &self,
        queue_id: Uuid,
        joined: Result<(Id, (Uuid, TaskOutcome)), JoinError>,
        task_ids: &mut HashMap<Id, Uuid>,
        summary: &mut DispatchSummary,
    ) {
        match joined {
            Ok((id, (_, outcome))) => {
                task_ids.remove(&id);
                summary.tally(&outcome);
            }
            Err(join_error) => {
                let Some(task_id) = task_ids.remove(&join_error.id()) else {
                    return;
                };
                self.tracker.finish(task_id);
                // 中止只发生在关闭阶段，此时上报有时限，未记录的任务留给下次启动对账
                let (outcome, policy) = if join_error.is_cancelled() {
                    summary.aborted += 1;
                    let outcome = TaskOutcome::failed(
                        FailureCode::WorkerShutdown,
                        "task aborted after shutdown grace period",
                    );
                    (outcome, store_backoff(self.config.shutdown_report_retry))
                } else {
                    error!(task_id = %task_id, "Task execution panicked");
                    let outcome =
                        TaskOutcome::failed(FailureCode::Execution, "task execution panicked");
                    (outcome, loop_backoff())
                };
                summary.tally(&outcome);
                self.report_with_backoff(queue_id, task_id, &outcome, policy).await;
            }
        }
    }

    /// 执行单个任务并上报结果
    #[instrument(skip(self, task), fields(task_id = %task.id, kind = %task.kind()))]
    async fn execute(&self, task: Task) -> (Uuid, TaskOutcome) {
        let _guard = InFlightGuard::new();
        let started = Instant::now();
        self.tracker.start(task.id, task.kind());

        let (reporter, mut events) = ProgressReporter::channel();
        let run = tokio::time::timeout(self.config.task_timeout, self.backend.run(&task, reporter));
        tokio::pin!(run);

        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                Some(event) = events.recv() => self.record_progress(&task, &event).await,
            }
        };
        while let Ok(event) = events.try_recv() {
            self.record_progress(&task, &event).await;
        }

        let outcome = match result {
            Ok(Ok(artifact)) => TaskOutcome::completed(artifact),
            Ok(Err(e)) => {
                warn!(backend = %self.backend.name(), "Generation failed: {}", e);
                TaskOutcome::failed(e.failure_code(), e.to_string())
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.config.task_timeout.as_secs(),
                    "Generation timed out"
                );
                TaskOutcome::failed(
                    FailureCode::Timeout,
                    format!(
                        "generation exceeded {}s",
                        self.config.task_timeout.as_secs()
                    ),
                )
            }
        };

        let snapshot = self.tracker.finish(task.id).unwrap_or_default();
        if outcome.is_success() {
            let progress = TaskProgress::finished(snapshot);
            if let Err(e) = self
                .repository()
                .save_progress(task.queue_id, task.id, &progress)
                .await
            {
                warn!("Failed to save final progress: {}", e);
            }
        }

        histogram!("genqueue_task_duration_seconds").record(started.elapsed().as_secs_f64());
        self.report_with_backoff(task.queue_id, task.id, &outcome, loop_backoff())
            .await;
        (task.id, outcome)
    }

    async fn record_progress(&self, task: &Task, event: &StageEvent) {
        let snapshot = self.tracker.update(task.id, event);
        let progress = TaskProgress::from_snapshot(snapshot);
        if let Err(e) = self
            .repository()
            .save_progress(task.queue_id, task.id, &progress)
            .await
        {
            debug!("Failed to save progress: {}", e);
        }
    }

    /// 上报结果，存储不可用时按退避重试
    ///
    /// 正常运行时使用不设上限的退避，直到存储恢复；
    /// 只有关闭阶段的补记会在时限后放弃。
    async fn report_with_backoff(
        &self,
        queue_id: Uuid,
        task_id: Uuid,
        outcome: &TaskOutcome,
        policy: ExponentialBackoff,
    ) {
        let manager = &self.manager;
        let operation = move || async move {
            manager
                .report_outcome(queue_id, task_id, outcome)
                .await
                .map_err(|e| match e {
                    QueueError::Store(StoreError::Unavailable(_)) => {
                        warn!(task_id = %task_id, "Store unavailable while reporting outcome, retrying: {}", e);
                        backoff::Error::transient(e)
                    }
                    other => backoff::Error::permanent(other),
                })
        };

        if let Err(e) = backoff::future::retry(policy, operation).await {
            error!(queue_id = %queue_id, task_id = %task_id, "Failed to report task outcome: {}", e);
        }
    }
}
