// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use async_trait::async_trait;
use futures::stream::BoxStream;
use genqueue::domain::models::progress::TaskProgress;
use genqueue::domain::models::queue::{
    Occupancy, OutcomeReceipt, Queue, QueueSnapshot, QueueStatus,
};
use genqueue::domain::models::task::{Task, TaskOutcome};
use genqueue::domain::models::worker::WorkerRecord;
use genqueue::domain::repositories::queue_repository::{QueueRepository, StoreError};
use genqueue::domain::repositories::worker_registry::WorkerRegistry;
use genqueue::infrastructure::repositories::MemoryQueueRepository;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// 前若干次心跳失败的注册表
pub struct FlakyRegistry {
    inner: Arc<MemoryQueueRepository>,
    failures_left: AtomicUsize,
}

impl FlakyRegistry {
    pub fn new(inner: Arc<MemoryQueueRepository>, failures: usize) -> Self {
        Self {
            inner,
            failures_left: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl WorkerRegistry for FlakyRegistry {
    async fn heartbeat(&self, record: &WorkerRecord) -> Result<(), StoreError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("registry flapping".to_string()));
        }
        self.inner.heartbeat(record).await
    }

    async fn workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        self.inner.workers().await
    }

    async fn deregister(&self, worker_id: &str) -> Result<(), StoreError> {
        self.inner.deregister(worker_id).await
    }
}

/// 可注入存储故障的仓库包装
pub struct FaultyRepository {
    inner: Arc<MemoryQueueRepository>,
    refuse_publish: AtomicBool,
    outcome_outage: AtomicBool,
}

impl FaultyRepository {
    pub fn new(inner: Arc<MemoryQueueRepository>) -> Self {
        Self {
            inner,
            refuse_publish: AtomicBool::new(false),
            outcome_outage: AtomicBool::new(false),
        }
    }

    /// 创建通知总是失败
    pub fn refusing_publish(inner: Arc<MemoryQueueRepository>) -> Self {
        let repo = Self::new(inner);
        repo.refuse_publish.store(true, Ordering::SeqCst);
        repo
    }

    /// 打开或关闭结果写入的存储中断
    pub fn set_outcome_outage(&self, down: bool) {
        self.outcome_outage.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl QueueRepository for FaultyRepository {
    async fn create(&self, queue: &Queue, tasks: &[Task]) -> Result<(), StoreError> {
        self.inner.create(queue, tasks).await
    }

    async fn delete(&self, queue_id: Uuid) -> Result<(), StoreError> {
        self.inner.delete(queue_id).await
    }

    async fn find(&self, queue_id: Uuid) -> Result<Option<Queue>, StoreError> {
        self.inner.find(queue_id).await
    }

    async fn snapshot(&self, queue_id: Uuid) -> Result<Option<QueueSnapshot>, StoreError> {
        self.inner.snapshot(queue_id).await
    }

    async fn queue_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        self.inner.queue_ids().await
    }

    async fn owner_queue_ids(&self, owner_id: &str) -> Result<Vec<Uuid>, StoreError> {
        self.inner.owner_queue_ids(owner_id).await
    }

    async fn transition(
        &self,
        queue_id: Uuid,
        from: &[QueueStatus],
        to: QueueStatus,
        reason: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.inner.transition(queue_id, from, to, reason).await
    }

    async fn request_cancel(&self, queue_id: Uuid) -> Result<Option<u64>, StoreError> {
        self.inner.request_cancel(queue_id).await
    }

    async fn claim_next_task(
        &self,
        queue_id: Uuid,
        worker_id: &str,
    ) -> Result<Option<Task>, StoreError> {
        self.inner.claim_next_task(queue_id, worker_id).await
    }

    async fn record_outcome(
        &self,
        queue_id: Uuid,
        task_id: Uuid,
        outcome: &TaskOutcome,
    ) -> Result<OutcomeReceipt, StoreError> {
        if self.outcome_outage.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store connection lost".to_string()));
        }
        self.inner.record_outcome(queue_id, task_id, outcome).await
    }

    async fn abandon_remaining(
        &self,
        queue_id: Uuid,
        outcome: &TaskOutcome,
    ) -> Result<u64, StoreError> {
        self.inner.abandon_remaining(queue_id, outcome).await
    }

    async fn occupancy(&self, queue_id: Uuid) -> Result<Occupancy, StoreError> {
        self.inner.occupancy(queue_id).await
    }

    async fn in_flight_for_worker(
        &self,
        queue_id: Uuid,
        worker_id: &str,
    ) -> Result<Vec<Uuid>, StoreError> {
        self.inner.in_flight_for_worker(queue_id, worker_id).await
    }

    async fn save_progress(
        &self,
        queue_id: Uuid,
        task_id: Uuid,
        progress: &TaskProgress,
    ) -> Result<(), StoreError> {
        self.inner.save_progress(queue_id, task_id, progress).await
    }

    async fn try_claim_queue(
        &self,
        queue_id: Uuid,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.inner.try_claim_queue(queue_id, worker_id, ttl).await
    }

    async fn release_queue(&self, queue_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        self.inner.release_queue(queue_id, worker_id).await
    }

    async fn queue_claimant(&self, queue_id: Uuid) -> Result<Option<String>, StoreError> {
        self.inner.queue_claimant(queue_id).await
    }

    async fn publish_created(&self, queue_id: Uuid) -> Result<(), StoreError> {
        if self.refuse_publish.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("publish refused".to_string()));
        }
        self.inner.publish_created(queue_id).await
    }

    async fn watch_created(&self) -> Result<BoxStream<'static, Uuid>, StoreError> {
        self.inner.watch_created().await
    }
}
