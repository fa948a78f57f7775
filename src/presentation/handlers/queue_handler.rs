// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::application::dto::queue_request::CreateQueueRequestDto;
use crate::application::dto::queue_response::{
    CancelQueueResponseDto, CreateQueueResponseDto, QueueListResponseDto,
};
use crate::domain::models::queue::{QueueSummary, QueueView};
use crate::domain::services::queue_manager::{QueueError, QueueManager};
use crate::presentation::errors::AppError;
use crate::presentation::extractors::owner_id::OwnerId;

/// 创建队列
///
/// # 返回值
///
/// * `201 {queue_id}` - 创建成功
/// * `429` - 活跃队列数已达上限
pub async fn create_queue(
    Extension(manager): Extension<Arc<QueueManager>>,
    OwnerId(owner_id): OwnerId,
    Json(request): Json<CreateQueueRequestDto>,
) -> Result<(StatusCode, Json<CreateQueueResponseDto>), AppError> {
    request.validate()?;

    let queue_id = manager
        .create_queue(&owner_id, request.tasks, request.concurrency)
        .await?;
    info!(queue_id = %queue_id, owner_id = %owner_id, "Queue accepted");
    Ok((StatusCode::CREATED, Json(CreateQueueResponseDto { queue_id })))
}

/// 查询队列状态，只有所有者可见
pub async fn get_queue(
    Extension(manager): Extension<Arc<QueueManager>>,
    OwnerId(owner_id): OwnerId,
    Path(queue_id): Path<Uuid>,
) -> Result<Json<QueueView>, AppError> {
    let view = manager.get_status(queue_id).await?;
    if view.owner_id != owner_id {
        return Err(QueueError::NotFound(queue_id).into());
    }
    Ok(Json(view))
}

/// 列出所有者的活跃队列
pub async fn list_queues(
    Extension(manager): Extension<Arc<QueueManager>>,
    OwnerId(owner_id): OwnerId,
) -> Result<Json<QueueListResponseDto>, AppError> {
    let queues = manager
        .list_active_queues(&owner_id)
        .await?
        .iter()
        .map(QueueSummary::from)
        .collect();
    Ok(Json(QueueListResponseDto { queues }))
}

/// 取消队列
pub async fn cancel_queue(
    Extension(manager): Extension<Arc<QueueManager>>,
    OwnerId(owner_id): OwnerId,
    Path(queue_id): Path<Uuid>,
) -> Result<Json<CancelQueueResponseDto>, AppError> {
    let success = manager.cancel_queue(queue_id, &owner_id).await?;
    Ok(Json(CancelQueueResponseDto { success }))
}
