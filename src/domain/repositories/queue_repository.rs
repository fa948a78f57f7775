// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::progress::TaskProgress;
use crate::domain::models::queue::{Occupancy, OutcomeReceipt, Queue, QueueSnapshot, QueueStatus};
use crate::domain::models::task::{Task, TaskOutcome};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// 共享存储错误类型
///
/// 均视为瞬时错误：调度和监管循环退避重试，
/// 不会转换为任务级失败。
#[derive(Error, Debug)]
pub enum StoreError {
    /// 存储不可达或命令执行失败
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    /// 记录序列化失败
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// 存储中的记录无法解析
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// 队列仓库特质
///
/// 共享存储是跨进程队列和任务状态的唯一事实来源。
/// 所有计数变更和状态转换都必须是单次原子存储操作。
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// 原子地写入队列元数据和全部任务
    async fn create(&self, queue: &Queue, tasks: &[Task]) -> Result<(), StoreError>;

    /// 删除队列的全部键
    async fn delete(&self, queue_id: Uuid) -> Result<(), StoreError>;

    /// 读取队列元数据
    async fn find(&self, queue_id: Uuid) -> Result<Option<Queue>, StoreError>;

    /// 读取队列及其全部任务的快照
    async fn snapshot(&self, queue_id: Uuid) -> Result<Option<QueueSnapshot>, StoreError>;

    /// 列出所有仍被索引的队列ID
    async fn queue_ids(&self) -> Result<Vec<Uuid>, StoreError>;

    /// 列出某所有者的队列ID
    async fn owner_queue_ids(&self, owner_id: &str) -> Result<Vec<Uuid>, StoreError>;

    /// 状态比较交换
    ///
    /// 仅当当前状态在 `from` 中时才转换为 `to`，进入终态时写入完成时间并刷新过期时间。
    ///
    /// # 返回值
    ///
    /// 转换是否生效
    async fn transition(
        &self,
        queue_id: Uuid,
        from: &[QueueStatus],
        to: QueueStatus,
        reason: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// 请求取消并丢弃全部待处理任务
    ///
    /// # 返回值
    ///
    /// * `Some(n)` - 被丢弃的待处理任务数
    /// * `None` - 队列不存在或已处于终态
    async fn request_cancel(&self, queue_id: Uuid) -> Result<Option<u64>, StoreError>;

    /// 按先进先出取出下一个待处理任务并记为执行中
    ///
    /// 队列已请求取消或已处于终态时返回 `None`。
    async fn claim_next_task(
        &self,
        queue_id: Uuid,
        worker_id: &str,
    ) -> Result<Option<Task>, StoreError>;

    /// 幂等地记录任务终态结果并原子递增对应计数
    async fn record_outcome(
        &self,
        queue_id: Uuid,
        task_id: Uuid,
        outcome: &TaskOutcome,
    ) -> Result<OutcomeReceipt, StoreError>;

    /// 将剩余的待处理和执行中任务全部记为失败
    ///
    /// # 返回值
    ///
    /// 被记为失败的任务数
    async fn abandon_remaining(
        &self,
        queue_id: Uuid,
        outcome: &TaskOutcome,
    ) -> Result<u64, StoreError>;

    /// 当前待处理和执行中的任务数
    async fn occupancy(&self, queue_id: Uuid) -> Result<Occupancy, StoreError>;

    /// 某工作单元名下的执行中任务
    async fn in_flight_for_worker(
        &self,
        queue_id: Uuid,
        worker_id: &str,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// 写入任务进度记录
    async fn save_progress(
        &self,
        queue_id: Uuid,
        task_id: Uuid,
        progress: &TaskProgress,
    ) -> Result<(), StoreError>;

    /// 获取或续期队列的调度所有权
    ///
    /// 已由同一工作单元持有时续期并返回 true。
    async fn try_claim_queue(
        &self,
        queue_id: Uuid,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// 释放调度所有权（仅当仍由该工作单元持有）
    async fn release_queue(&self, queue_id: Uuid, worker_id: &str) -> Result<(), StoreError>;

    /// 当前持有调度所有权的工作单元
    async fn queue_claimant(&self, queue_id: Uuid) -> Result<Option<String>, StoreError>;

    /// 广播新队列创建通知
    async fn publish_created(&self, queue_id: Uuid) -> Result<(), StoreError>;

    /// 订阅新队列创建通知
    async fn watch_created(&self) -> Result<BoxStream<'static, Uuid>, StoreError>;
}
