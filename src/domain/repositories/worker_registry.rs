// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use super::queue_repository::StoreError;
use crate::domain::models::worker::WorkerRecord;
use async_trait::async_trait;

/// 工作单元注册表特质
///
/// 保存每个工作单元最近一次心跳，供跨进程存活检测使用
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// 写入或刷新心跳记录
    async fn heartbeat(&self, record: &WorkerRecord) -> Result<(), StoreError>;
    /// 列出全部心跳记录
    async fn workers(&self) -> Result<Vec<WorkerRecord>, StoreError>;
    /// 注销工作单元
    async fn deregister(&self, worker_id: &str) -> Result<(), StoreError>;
}
