// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::domain::models::task::TaskPayload;

/// 创建队列请求数据传输对象
///
/// 任务负载的逐项校验和数量上限由队列服务负责，
/// 这里只做结构层面的校验
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct CreateQueueRequestDto {
    /// 任务负载列表
    #[validate(length(min = 1, message = "tasks cannot be empty"))]
    pub tasks: Vec<TaskPayload>,
    /// 请求的并发上限，超出范围时被钳制
    pub concurrency: Option<usize>,
}
