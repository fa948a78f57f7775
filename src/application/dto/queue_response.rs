// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::models::queue::QueueSummary;

/// 创建队列响应
#[derive(Debug, Deserialize, Serialize)]
pub struct CreateQueueResponseDto {
    pub queue_id: Uuid,
}

/// 活跃队列列表响应
#[derive(Debug, Serialize)]
pub struct QueueListResponseDto {
    /// 活跃队列摘要，按创建时间倒序
    pub queues: Vec<QueueSummary>,
}

/// 取消队列响应
#[derive(Debug, Deserialize, Serialize)]
pub struct CancelQueueResponseDto {
    /// 取消请求是否被接受
    pub success: bool,
}
