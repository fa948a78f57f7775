// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use thiserror::Error;

use crate::domain::repositories::queue_repository::StoreError;
use crate::domain::services::queue_manager::QueueError;

/// Worker错误类型
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),

    #[error("队列错误: {0}")]
    Queue(#[from] QueueError),

    #[error("启动失败: {0}")]
    Bootstrap(String),

    #[error("内部错误: {0}")]
    Internal(String),
}
