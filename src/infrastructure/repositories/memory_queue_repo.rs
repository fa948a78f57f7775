// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use crate::domain::models::progress::TaskProgress;
use crate::domain::models::queue::{
    Occupancy, OutcomeReceipt, Queue, QueueSnapshot, QueueStatus, TaskRecord,
};
use crate::domain::models::task::{Task, TaskOutcome, TaskStatus};
use crate::domain::models::worker::WorkerRecord;
use crate::domain::repositories::queue_repository::{QueueRepository, StoreError};
use crate::domain::repositories::worker_registry::WorkerRegistry;

/// 内存队列仓库
///
/// 与 Redis 实现语义一致的单进程存储，用于测试和单进程部署。
/// 每个操作在一次加锁内完成，从而与 Redis 的脚本/事务具有相同的原子性。
pub struct MemoryQueueRepository {
    state: Mutex<MemoryState>,
    retention: chrono::Duration,
    created: broadcast::Sender<Uuid>,
}

#[derive(Default)]
struct MemoryState {
    queues: HashMap<Uuid, QueueEntry>,
    owners: HashMap<String, HashSet<Uuid>>,
    claims: HashMap<Uuid, Claim>,
    workers: HashMap<String, WorkerRecord>,
}

struct Claim {
    worker_id: String,
    expires_at: Instant,
}

struct QueueEntry {
    queue: Queue,
    tasks: HashMap<Uuid, Task>,
    pending: VecDeque<Uuid>,
    in_flight: HashMap<Uuid, String>,
    completed: HashSet<Uuid>,
    failed: HashSet<Uuid>,
    cancelled: HashSet<Uuid>,
    outcomes: HashMap<Uuid, TaskOutcome>,
    progress: HashMap<Uuid, TaskProgress>,
    expires_at: DateTime<Utc>,
}

impl QueueEntry {
    fn status_of(&self, task_id: &Uuid) -> TaskStatus {
        if self.completed.contains(task_id) {
            TaskStatus::Completed
        } else if self.failed.contains(task_id) {
            TaskStatus::Failed
        } else if self.cancelled.contains(task_id) {
            TaskStatus::Cancelled
        } else if self.in_flight.contains_key(task_id) {
            TaskStatus::Processing
        } else {
            TaskStatus::Pending
        }
    }

    fn is_finished(&self, task_id: &Uuid) -> bool {
        self.completed.contains(task_id)
            || self.failed.contains(task_id)
            || self.cancelled.contains(task_id)
    }

    fn occupancy(&self) -> Occupancy {
        Occupancy {
            pending: self.pending.len() as u64,
            in_flight: self.in_flight.len() as u64,
        }
    }

    fn receipt(&self, applied: bool) -> OutcomeReceipt {
        OutcomeReceipt {
            applied,
            completed_count: self.queue.completed_count,
            failed_count: self.queue.failed_count,
        }
    }

    fn apply_outcome(&mut self, task_id: Uuid, outcome: &TaskOutcome) {
        self.in_flight.remove(&task_id);
        self.pending.retain(|id| *id != task_id);
        if outcome.is_success() {
            self.completed.insert(task_id);
            self.queue.completed_count += 1;
        } else {
            self.failed.insert(task_id);
            self.queue.failed_count += 1;
        }
        self.outcomes.insert(task_id, outcome.clone());
    }
}

impl Default for MemoryQueueRepository {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60))
    }
}

impl MemoryQueueRepository {
    /// 创建内存仓库
    ///
    /// # 参数
    ///
    /// * `retention` - 终态队列的保留时长
    pub fn new(retention: Duration) -> Self {
        let (created, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(MemoryState::default()),
            retention: chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
            created,
        }
    }

    fn expiry(&self) -> DateTime<Utc> {
        Utc::now() + self.retention
    }

    /// 清理已过保留期的终态队列
    fn purge_expired(state: &mut MemoryState) {
        let now = Utc::now();
        let expired: Vec<(Uuid, String)> = state
            .queues
            .values()
            .filter(|entry| entry.queue.status.is_terminal() && entry.expires_at <= now)
            .map(|entry| (entry.queue.id, entry.queue.owner_id.clone()))
            .collect();

        for (queue_id, owner_id) in expired {
            state.queues.remove(&queue_id);
            state.claims.remove(&queue_id);
            if let Some(owned) = state.owners.get_mut(&owner_id) {
                owned.remove(&queue_id);
            }
        }
    }
}

#[async_trait]
impl QueueRepository for MemoryQueueRepository {
    async fn create(&self, queue: &Queue, tasks: &[Task]) -> Result<(), StoreError> {
        let mut ordered: Vec<&Task> = tasks.iter().collect();
        ordered.sort_by_key(|task| task.position);

        let entry = QueueEntry {
            queue: queue.clone(),
            tasks: tasks.iter().map(|task| (task.id, task.clone())).collect(),
            pending: ordered.iter().map(|task| task.id).collect(),
            in_flight: HashMap::new(),
            completed: HashSet::new(),
            failed: HashSet::new(),
            cancelled: HashSet::new(),
            outcomes: HashMap::new(),
            progress: HashMap::new(),
            expires_at: self.expiry(),
        };

        let mut state = self.state.lock();
        Self::purge_expired(&mut state);
        state
            .owners
            .entry(queue.owner_id.clone())
            .or_default()
            .insert(queue.id);
        state.queues.insert(queue.id, entry);
        Ok(())
    }

    async fn delete(&self, queue_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let Some(entry) = state.queues.remove(&queue_id) {
            if let Some(owned) = state.owners.get_mut(&entry.queue.owner_id) {
                owned.remove(&queue_id);
            }
        }
        state.claims.remove(&queue_id);
        Ok(())
    }

    async fn find(&self, queue_id: Uuid) -> Result<Option<Queue>, StoreError> {
        let mut state = self.state.lock();
        Self::purge_expired(&mut state);
        Ok(state.queues.get(&queue_id).map(|entry| entry.queue.clone()))
    }

    async fn snapshot(&self, queue_id: Uuid) -> Result<Option<QueueSnapshot>, StoreError> {
        let mut state = self.state.lock();
        Self::purge_expired(&mut state);
        let Some(entry) = state.queues.get(&queue_id) else {
            return Ok(None);
        };

        let mut tasks: Vec<TaskRecord> = entry
            .tasks
            .values()
            .map(|task| TaskRecord {
                task: task.clone(),
                status: entry.status_of(&task.id),
                outcome: entry.outcomes.get(&task.id).cloned(),
                progress: entry.progress.get(&task.id).cloned(),
            })
            .collect();
        tasks.sort_by_key(|record| record.task.position);

        Ok(Some(QueueSnapshot {
            queue: entry.queue.clone(),
            tasks,
        }))
    }

    async fn queue_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut state = self.state.lock();
        Self::purge_expired(&mut state);
        Ok(state.queues.keys().copied().collect())
    }

    async fn owner_queue_ids(&self, owner_id: &str) -> Result<Vec<Uuid>, StoreError> {
        let mut state = self.state.lock();
        Self::purge_expired(&mut state);
        Ok(state
            .owners
            .get(owner_id)
            .map(|owned| owned.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn transition(
        &self,
        queue_id: Uuid,
        from: &[QueueStatus],
        to: QueueStatus,
        reason: Option<&str>,
    ) -> Result<bool, StoreError> {
        let expires_at = self.expiry();
        let mut state = self.state.lock();
        let Some(entry) = state.queues.get_mut(&queue_id) else {
            return Ok(false);
        };
        if !from.contains(&entry.queue.status) {
            return Ok(false);
        }

        entry.queue.status = to;
        if let Some(reason) = reason {
            entry.queue.reason = Some(reason.to_string());
        }
        if to.is_terminal() {
            entry.queue.completed_at = Some(Utc::now());
        }
        entry.expires_at = expires_at;
        Ok(true)
    }

    async fn request_cancel(&self, queue_id: Uuid) -> Result<Option<u64>, StoreError> {
        let mut state = self.state.lock();
        let Some(entry) = state.queues.get_mut(&queue_id) else {
            return Ok(None);
        };
        if entry.queue.status.is_terminal() {
            return Ok(None);
        }

        entry.queue.cancel_requested = true;
        let discarded: Vec<Uuid> = entry.pending.drain(..).collect();
        let count = discarded.len() as u64;
        entry.cancelled.extend(discarded);
        Ok(Some(count))
    }

    async fn claim_next_task(
        &self,
        queue_id: Uuid,
        worker_id: &str,
    ) -> Result<Option<Task>, StoreError> {
        let mut state = self.state.lock();
        let Some(entry) = state.queues.get_mut(&queue_id) else {
            return Ok(None);
        };
        if entry.queue.cancel_requested || entry.queue.status.is_terminal() {
            return Ok(None);
        }

        while let Some(task_id) = entry.pending.pop_front() {
            if let Some(task) = entry.tasks.get(&task_id) {
                let task = task.clone();
                entry.in_flight.insert(task_id, worker_id.to_string());
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    async fn record_outcome(
        &self,
        queue_id: Uuid,
        task_id: Uuid,
        outcome: &TaskOutcome,
    ) -> Result<OutcomeReceipt, StoreError> {
        let expires_at = self.expiry();
        let mut state = self.state.lock();
        let entry = state
            .queues
            .get_mut(&queue_id)
            .ok_or_else(|| StoreError::Corrupt(format!("queue {} is missing", queue_id)))?;

        if !entry.tasks.contains_key(&task_id) || entry.is_finished(&task_id) {
            return Ok(entry.receipt(false));
        }

        entry.apply_outcome(task_id, outcome);
        entry.expires_at = expires_at;
        Ok(entry.receipt(true))
    }

    async fn abandon_remaining(
        &self,
        queue_id: Uuid,
        outcome: &TaskOutcome,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock();
        let Some(entry) = state.queues.get_mut(&queue_id) else {
            return Ok(0);
        };

        let mut remaining: Vec<Uuid> = entry.pending.iter().copied().collect();
        remaining.extend(entry.in_flight.keys().copied());
        for task_id in &remaining {
            entry.apply_outcome(*task_id, outcome);
        }
        Ok(remaining.len() as u64)
    }

    async fn occupancy(&self, queue_id: Uuid) -> Result<Occupancy, StoreError> {
        let state = self.state.lock();
        Ok(state
            .queues
            .get(&queue_id)
            .map(QueueEntry::occupancy)
            .unwrap_or_default())
    }

    async fn in_flight_for_worker(
        &self,
        queue_id: Uuid,
        worker_id: &str,
    ) -> Result<Vec<Uuid>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .queues
            .get(&queue_id)
            .map(|entry| {
                entry
                    .in_flight
                    .iter()
                    .filter(|(_, owner)| owner.as_str() == worker_id)
                    .map(|(task_id, _)| *task_id)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn save_progress(
        &self,
        queue_id: Uuid,
        task_id: Uuid,
        progress: &TaskProgress,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let Some(entry) = state.queues.get_mut(&queue_id) {
            entry.progress.insert(task_id, progress.clone());
        }
        Ok(())
    }

    async fn try_claim_queue(
        &self,
        queue_id: Uuid,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let available = match state.claims.get(&queue_id) {
            None => true,
            Some(claim) => claim.worker_id == worker_id || claim.expires_at <= now,
        };
        if available {
            state.claims.insert(
                queue_id,
                Claim {
                    worker_id: worker_id.to_string(),
                    expires_at: now + ttl,
                },
            );
        }
        Ok(available)
    }

    async fn release_queue(&self, queue_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state
            .claims
            .get(&queue_id)
            .is_some_and(|claim| claim.worker_id == worker_id)
        {
            state.claims.remove(&queue_id);
        }
        Ok(())
    }

    async fn queue_claimant(&self, queue_id: Uuid) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let state = self.state.lock();
        Ok(state
            .claims
            .get(&queue_id)
            .filter(|claim| claim.expires_at > now)
            .map(|claim| claim.worker_id.clone()))
    }

    async fn publish_created(&self, queue_id: Uuid) -> Result<(), StoreError> {
        // 没有订阅者时发送失败，属于正常情况
        let _ = self.created.send(queue_id);
        Ok(())
    }

    async fn watch_created(&self) -> Result<BoxStream<'static, Uuid>, StoreError> {
        let receiver = self.created.subscribe();
        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(queue_id) => return Some((queue_id, receiver)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[async_trait]
impl WorkerRegistry for MemoryQueueRepository {
    async fn heartbeat(&self, record: &WorkerRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.workers.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let state = self.state.lock();
        Ok(state.workers.values().cloned().collect())
    }

    async fn deregister(&self, worker_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.workers.remove(worker_id);
        Ok(())
    }
}
