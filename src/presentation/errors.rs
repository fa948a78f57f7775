// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use crate::domain::services::queue_manager::QueueError;

/// 应用错误类型
///
/// 封装所有可能的应用层错误，提供统一的错误处理接口
#[derive(Debug)]
pub struct AppError(anyhow::Error);

impl AppError {
    fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<QueueError>() {
            Some(QueueError::QuotaExceeded { .. }) => StatusCode::TOO_MANY_REQUESTS,
            Some(QueueError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(QueueError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            Some(QueueError::Store(_)) => StatusCode::SERVICE_UNAVAILABLE,
            None if self.0.downcast_ref::<validator::ValidationErrors>().is_some() => {
                StatusCode::BAD_REQUEST
            }
            None => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {:#}", self.0);
        }

        let body = Json(json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
