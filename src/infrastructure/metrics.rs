// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{info, warn};

/// 初始化指标系统
///
/// 安装 Prometheus 导出器并注册队列、任务、工作单元和后端熔断指标。
/// 导出器安装失败只记录警告，不影响服务启动。
///
/// # 参数
///
/// * `addr` - 导出器 HTTP 监听地址
pub fn init_metrics(addr: SocketAddr) {
    // Ignore error if address is already in use (for development/testing)
    if let Err(e) = PrometheusBuilder::new().with_http_listener(addr).install() {
        warn!(
            "Failed to install Prometheus recorder: {}. This might happen if the port is already in use.",
            e
        );
        return;
    }

    describe_counter!("genqueue_queues_created_total", "Total number of queues created");
    describe_counter!(
        "genqueue_queues_finished_total",
        "Total number of queues that reached a terminal status"
    );
    describe_counter!(
        "genqueue_tasks_completed_total",
        "Total number of generation tasks completed"
    );
    describe_counter!(
        "genqueue_tasks_failed_total",
        "Total number of generation tasks failed, by failure code"
    );
    describe_histogram!(
        "genqueue_task_duration_seconds",
        Unit::Seconds,
        "Duration of generation tasks in seconds"
    );
    describe_gauge!("genqueue_tasks_in_flight", "Tasks currently executing in this process");
    describe_gauge!("genqueue_worker_units", "Worker units currently running in this process");
    describe_counter!(
        "genqueue_worker_restarts_total",
        "Total number of worker unit restarts"
    );
    describe_counter!(
        "genqueue_backend_circuit_open_total",
        "Total number of times a backend circuit breaker opened"
    );
    describe_gauge!(
        "genqueue_backend_circuit_status",
        "Current status of backend circuit breaker (0=Closed, 0.5=HalfOpen, 1=Open)"
    );

    info!("Metrics exporter listening on {}", addr);
}
