// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use metrics::counter;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::domain::models::queue::{
    OutcomeReceipt, Queue, QueueSnapshot, QueueStatus, QueueView, REASON_CANCELLED_BY_OWNER,
    REASON_INTERRUPTED_BY_RESTART,
};
use crate::domain::models::task::{FailureCode, Task, TaskOutcome, TaskPayload};
use crate::domain::repositories::queue_repository::{QueueRepository, StoreError};

/// 队列服务错误类型
#[derive(Error, Debug)]
pub enum QueueError {
    /// 所有者的活跃队列数已达上限
    #[error("Owner '{owner_id}' already has {limit} active queues")]
    QuotaExceeded { owner_id: String, limit: usize },
    /// 队列不存在或已过期
    #[error("Queue {0} not found")]
    NotFound(Uuid),
    /// 请求参数无效
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    /// 共享存储错误
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 队列限制配置
#[derive(Debug, Clone)]
pub struct QueueLimits {
    /// 并发上限的最大值
    pub max_concurrency: usize,
    /// 未指定时的默认并发
    pub default_concurrency: usize,
    /// 每个所有者最多同时拥有的活跃队列数
    pub max_active_queues_per_owner: usize,
    /// 单个队列的最大任务数
    pub max_tasks_per_queue: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            default_concurrency: 5,
            max_active_queues_per_owner: 5,
            max_tasks_per_queue: 100,
        }
    }
}

/// 队列管理服务
///
/// 负责队列的创建、查询与取消，执行所有者配额，
/// 并根据任务计数计算聚合状态。状态转换只通过存储的比较交换完成，
/// 终态一旦写入不再改变。
pub struct QueueManager {
    repository: Arc<dyn QueueRepository>,
    limits: QueueLimits,
}

impl QueueManager {
    /// 创建新的队列管理服务
    ///
    /// # 参数
    ///
    /// * `repository` - 队列仓库
    /// * `limits` - 队列限制
    pub fn new(repository: Arc<dyn QueueRepository>, limits: QueueLimits) -> Self {
        Self { repository, limits }
    }

    pub fn repository(&self) -> &Arc<dyn QueueRepository> {
        &self.repository
    }

    pub fn limits(&self) -> &QueueLimits {
        &self.limits
    }

    /// 将请求的并发钳制到 `[1, max_concurrency]`
    pub fn clamp_concurrency(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.limits.default_concurrency)
            .clamp(1, self.limits.max_concurrency.max(1))
    }

    /// 创建队列
    ///
    /// 先校验负载和配额，再原子写入队列与任务并通知监管器。
    /// 写入或通知失败时删除该队列的全部键。
    ///
    /// # 参数
    ///
    /// * `owner_id` - 所有者身份
    /// * `payloads` - 任务负载列表
    /// * `concurrency` - 请求的并发上限
    ///
    /// # 返回值
    ///
    /// * `Ok(Uuid)` - 新队列ID
    /// * `Err(QueueError::QuotaExceeded)` - 活跃队列数已达上限
    pub async fn create_queue(
        &self,
        owner_id: &str,
        payloads: Vec<TaskPayload>,
        concurrency: Option<usize>,
    ) -> Result<Uuid, QueueError> {
        if owner_id.trim().is_empty() {
            return Err(QueueError::InvalidRequest("owner id is required".to_string()));
        }
        if payloads.is_empty() {
            return Err(QueueError::InvalidRequest(
                "queue must contain at least one task".to_string(),
            ));
        }
        if payloads.len() > self.limits.max_tasks_per_queue {
            return Err(QueueError::InvalidRequest(format!(
                "queue may contain at most {} tasks",
                self.limits.max_tasks_per_queue
            )));
        }
        for (index, payload) in payloads.iter().enumerate() {
            payload
                .validate()
                .map_err(|e| QueueError::InvalidRequest(format!("task {}: {}", index, e)))?;
        }

        let active = self.list_active_queues(owner_id).await?.len();
        if active >= self.limits.max_active_queues_per_owner {
            warn!(owner_id = %owner_id, active, "Queue creation rejected: quota exceeded");
            return Err(QueueError::QuotaExceeded {
                owner_id: owner_id.to_string(),
                limit: self.limits.max_active_queues_per_owner,
            });
        }

        let concurrency = self.clamp_concurrency(concurrency);
        let queue = Queue::new(owner_id, concurrency, payloads.len() as u64);
        let tasks: Vec<Task> = payloads
            .into_iter()
            .enumerate()
            .map(|(position, payload)| Task::new(queue.id, position as u32, payload))
            .collect();

        let persisted = match self.repository.create(&queue, &tasks).await {
            Ok(()) => self.repository.publish_created(queue.id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            error!(queue_id = %queue.id, "Failed to create queue, rolling back: {}", e);
            if let Err(cleanup) = self.repository.delete(queue.id).await {
                error!(queue_id = %queue.id, "Rollback of partial queue failed: {}", cleanup);
            }
            return Err(e.into());
        }

        counter!("genqueue_queues_created_total").increment(1);
        info!(
            queue_id = %queue.id,
            owner_id = %owner_id,
            tasks = tasks.len(),
            concurrency,
            "Queue created"
        );
        Ok(queue.id)
    }

    /// 查询队列状态
    ///
    /// 若计数表明队列已排空但存储的状态仍为非终态，先修正并持久化再返回。
    pub async fn get_status(&self, queue_id: Uuid) -> Result<QueueView, QueueError> {
        let mut snapshot = self
            .repository
            .snapshot(queue_id)
            .await?
            .ok_or(QueueError::NotFound(queue_id))?;
        self.heal(&mut snapshot).await?;
        Ok(QueueView::from(&snapshot))
    }

    /// 取消队列
    ///
    /// 只有所有者可以取消。待处理任务立即丢弃，执行中的任务自然结束，
    /// 没有执行中的任务后状态变为 cancelled。重复调用是幂等的。
    ///
    /// # 返回值
    ///
    /// 取消请求是否被接受
    pub async fn cancel_queue(&self, queue_id: Uuid, owner_id: &str) -> Result<bool, QueueError> {
        let Some(queue) = self.repository.find(queue_id).await? else {
            return Ok(false);
        };
        if queue.owner_id != owner_id {
            warn!(queue_id = %queue_id, owner_id = %owner_id, "Cancel rejected: not the queue owner");
            return Ok(false);
        }

        match queue.status {
            QueueStatus::Cancelled => return Ok(true),
            QueueStatus::Completed | QueueStatus::Failed => return Ok(false),
            QueueStatus::Waiting | QueueStatus::Processing => {}
        }

        let Some(discarded) = self.repository.request_cancel(queue_id).await? else {
            // 在读取与取消之间进入了终态
            let current = self.repository.find(queue_id).await?;
            return Ok(current.is_some_and(|q| q.status == QueueStatus::Cancelled));
        };

        info!(queue_id = %queue_id, discarded, "Queue cancellation requested");
        self.finalize_if_drained(queue_id).await?;
        Ok(true)
    }

    /// 列出所有者的活跃队列，按创建时间倒序
    pub async fn list_active_queues(&self, owner_id: &str) -> Result<Vec<QueueView>, QueueError> {
        let mut views = Vec::new();
        for queue_id in self.repository.owner_queue_ids(owner_id).await? {
            let Some(mut snapshot) = self.repository.snapshot(queue_id).await? else {
                continue;
            };
            self.heal(&mut snapshot).await?;
            if snapshot.queue.is_active() {
                views.push(QueueView::from(&snapshot));
            }
        }
        views.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(views)
    }

    /// 所有非终态队列的ID，供监管器发现新工作
    pub async fn active_queue_ids(&self) -> Result<Vec<Uuid>, QueueError> {
        let mut active = Vec::new();
        for queue_id in self.repository.queue_ids().await? {
            if let Some(queue) = self.repository.find(queue_id).await? {
                if queue.is_active() {
                    active.push((queue.created_at, queue_id));
                }
            }
        }
        active.sort();
        Ok(active.into_iter().map(|(_, queue_id)| queue_id).collect())
    }

    /// 标记队列开始执行（waiting → processing）
    pub async fn begin_processing(&self, queue_id: Uuid) -> Result<bool, QueueError> {
        Ok(self
            .repository
            .transition(
                queue_id,
                &[QueueStatus::Waiting],
                QueueStatus::Processing,
                None,
            )
            .await?)
    }

    /// 上报任务结果并在队列排空时结束队列
    ///
    /// # 参数
    ///
    /// * `queue_id` - 队列ID
    /// * `task_id` - 任务ID
    /// * `outcome` - 任务终态结果
    pub async fn report_outcome(
        &self,
        queue_id: Uuid,
        task_id: Uuid,
        outcome: &TaskOutcome,
    ) -> Result<OutcomeReceipt, QueueError> {
        let receipt = self
            .repository
            .record_outcome(queue_id, task_id, outcome)
            .await?;

        if receipt.applied {
            match outcome.failure_code() {
                None => counter!("genqueue_tasks_completed_total").increment(1),
                Some(code) => {
                    counter!("genqueue_tasks_failed_total", "code" => code.as_str()).increment(1)
                }
            }
            debug!(
                queue_id = %queue_id,
                task_id = %task_id,
                completed = receipt.completed_count,
                failed = receipt.failed_count,
                "Task outcome recorded"
            );
        } else {
            debug!(queue_id = %queue_id, task_id = %task_id, "Duplicate task outcome ignored");
        }

        self.finalize_if_drained(queue_id).await?;
        Ok(receipt)
    }

    /// 若队列已排空则转换到相应终态
    ///
    /// # 返回值
    ///
    /// 本次调用写入的终态；未转换时返回 `None`
    pub async fn finalize_if_drained(
        &self,
        queue_id: Uuid,
    ) -> Result<Option<QueueStatus>, QueueError> {
        let Some(queue) = self.repository.find(queue_id).await? else {
            return Ok(None);
        };
        let occupancy = self.repository.occupancy(queue_id).await?;
        let Some(target) = queue.settle(occupancy) else {
            return Ok(None);
        };

        if self.settle_to(&queue, target).await? {
            Ok(Some(target))
        } else {
            Ok(None)
        }
    }

    /// 将某工作单元名下的执行中任务记为失败
    ///
    /// 用于工作单元崩溃、心跳超时或强制关闭后的清理（至多一次语义）。
    pub async fn fail_orphaned_tasks(
        &self,
        queue_id: Uuid,
        worker_id: &str,
        code: FailureCode,
        message: &str,
    ) -> Result<u64, QueueError> {
        let orphaned = self
            .repository
            .in_flight_for_worker(queue_id, worker_id)
            .await?;

        let mut failed = 0;
        for task_id in orphaned {
            let outcome = TaskOutcome::failed(code, message);
            if self.report_outcome(queue_id, task_id, &outcome).await?.applied {
                failed += 1;
            }
        }
        if failed > 0 {
            warn!(
                queue_id = %queue_id,
                worker_id = %worker_id,
                failed,
                code = %code,
                "In-flight tasks of a lost worker marked failed"
            );
        }
        Ok(failed)
    }

    /// 启动对账
    ///
    /// 上次运行遗留的 waiting/processing 队列中，没有存活持有者的都标记为失败，
    /// 其剩余任务一并记为失败。
    ///
    /// # 参数
    ///
    /// * `live_workers` - 心跳仍然新鲜的工作单元ID
    ///
    /// # 返回值
    ///
    /// 被标记为失败的队列ID
    pub async fn reconcile_interrupted(
        &self,
        live_workers: &HashSet<String>,
    ) -> Result<Vec<Uuid>, QueueError> {
        let mut reconciled = Vec::new();

        for queue_id in self.repository.queue_ids().await? {
            let Some(queue) = self.repository.find(queue_id).await? else {
                continue;
            };
            if !queue.is_active() {
                continue;
            }
            if let Some(claimant) = self.repository.queue_claimant(queue_id).await? {
                if live_workers.contains(&claimant) {
                    continue;
                }
            }


            let transitioned = self
                .repository
                .transition(
                    queue_id,
                    &QueueStatus::ACTIVE,
                    QueueStatus::Failed,
                    Some(REASON_INTERRUPTED_BY_RESTART),
                )
                .await?;
            if !transitioned {
                continue;
            }

            let outcome = TaskOutcome::failed(
                FailureCode::InterruptedByRestart,
                "queue was interrupted by a service restart",
            );
            let abandoned = self.repository.abandon_remaining(queue_id, &outcome).await?;
            counter!("genqueue_queues_finished_total", "status" => QueueStatus::Failed.as_str())
                .increment(1);
            warn!(
                queue_id = %queue_id,
                abandoned,
                "Queue interrupted by restart marked failed"
            );
            reconciled.push(queue_id);
        }

        Ok(reconciled)
    }

    /// 按计数修正快照中的过期状态
    async fn heal(&self, snapshot: &mut QueueSnapshot) -> Result<(), QueueError> {
        let Some(target) = snapshot.queue.settle(snapshot.occupancy()) else {
            return Ok(());
        };

        if self.settle_to(&snapshot.queue, target).await? {
            info!(queue_id = %snapshot.queue.id, status = %target, "Stale queue status corrected");
        }
        if let Some(current) = self.repository.find(snapshot.queue.id).await? {
            snapshot.queue = current;
        }
        Ok(())
    }

    async fn settle_to(&self, queue: &Queue, target: QueueStatus) -> Result<bool, QueueError> {
        let reason = match target {
            QueueStatus::Cancelled => Some(REASON_CANCELLED_BY_OWNER),
            _ => None,
        };
        let applied = self
            .repository
            .transition(queue.id, &QueueStatus::ACTIVE, target, reason)
            .await?;

        if applied {
            counter!("genqueue_queues_finished_total", "status" => target.as_str()).increment(1);
            info!(
                queue_id = %queue.id,
                status = %target,
                completed = queue.completed_count,
                failed = queue.failed_count,
                total = queue.total_tasks,
                "Queue finished"
            );
        }
        Ok(applied)
    }
}
