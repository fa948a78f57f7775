// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::services::queue_manager::QueueManager;
use crate::presentation::handlers::queue_handler;
use axum::{
    extract::Extension,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// 创建应用路由
///
/// # 参数
///
/// * `manager` - 队列管理服务
///
/// # 返回值
///
/// 返回配置好的路由
pub fn routes(manager: Arc<QueueManager>) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health_check))
        .route("/v1/version", get(version));

    let queue_routes = Router::new()
        .route(
            "/v1/queues",
            post(queue_handler::create_queue).get(queue_handler::list_queues),
        )
        .route("/v1/queues/{id}", get(queue_handler::get_queue))
        .route("/v1/queues/{id}/cancel", post(queue_handler::cancel_queue))
        .layer(Extension(manager));

    Router::new()
        .merge(public_routes)
        .merge(queue_routes)
        .layer(TraceLayer::new_for_http())
}

/// 健康检查端点
///
/// # 返回值
///
/// 返回"OK"字符串
pub async fn health_check() -> &'static str {
    "OK"
}

/// 版本信息端点
///
/// # 返回值
///
/// 返回应用版本号
pub async fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
