// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use uuid::Uuid;

/// Redis 键空间
///
/// 所有键共享同一命名空间前缀，队列相关键共享同一保留期。
#[derive(Debug, Clone)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// 队列元数据哈希
    pub fn queue(&self, queue_id: Uuid) -> String {
        format!("{}:queue:{}", self.namespace, queue_id)
    }

    fn queue_part(&self, queue_id: Uuid, part: &str) -> String {
        format!("{}:queue:{}:{}", self.namespace, queue_id, part)
    }

    /// 任务 ID → 任务 JSON
    pub fn tasks(&self, queue_id: Uuid) -> String {
        self.queue_part(queue_id, "tasks")
    }

    /// 待处理任务列表（RPUSH/LPOP）
    pub fn pending(&self, queue_id: Uuid) -> String {
        self.queue_part(queue_id, "pending")
    }

    /// 任务 ID → 工作单元 ID
    pub fn in_flight(&self, queue_id: Uuid) -> String {
        self.queue_part(queue_id, "in_flight")
    }

    pub fn completed(&self, queue_id: Uuid) -> String {
        self.queue_part(queue_id, "completed")
    }

    pub fn failed(&self, queue_id: Uuid) -> String {
        self.queue_part(queue_id, "failed")
    }

    pub fn cancelled(&self, queue_id: Uuid) -> String {
        self.queue_part(queue_id, "cancelled")
    }

    /// 任务 ID → 结果 JSON
    pub fn results(&self, queue_id: Uuid) -> String {
        self.queue_part(queue_id, "results")
    }

    /// 任务 ID → 进度 JSON
    pub fn progress(&self, queue_id: Uuid) -> String {
        self.queue_part(queue_id, "progress")
    }

    /// 调度所有权锁
    pub fn claim(&self, queue_id: Uuid) -> String {
        self.queue_part(queue_id, "claim")
    }

    /// 全部队列索引
    pub fn index(&self) -> String {
        format!("{}:queues", self.namespace)
    }

    /// 所有者队列索引
    pub fn owner(&self, owner_id: &str) -> String {
        format!("{}:owner:{}:queues", self.namespace, owner_id)
    }

    /// 工作单元心跳哈希
    pub fn workers(&self) -> String {
        format!("{}:workers", self.namespace)
    }

    /// 新队列通知频道
    pub fn created_channel(&self) -> String {
        format!("{}:events:queue_created", self.namespace)
    }

    /// 共享保留期的全部队列键，元数据键在首位
    pub fn queue_keys(&self, queue_id: Uuid) -> Vec<String> {
        vec![
            self.queue(queue_id),
            self.tasks(queue_id),
            self.pending(queue_id),
            self.in_flight(queue_id),
            self.completed(queue_id),
            self.failed(queue_id),
            self.cancelled(queue_id),
            self.results(queue_id),
            self.progress(queue_id),
        ]
    }
}
