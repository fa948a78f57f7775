// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::models::progress::StageEvent;
use crate::domain::models::task::{Artifact, FailureCode, Task, TaskKind};

/// 生成后端错误类型
#[derive(Error, Debug)]
pub enum BackendError {
    /// 请求失败
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// 后端返回非成功状态码
    #[error("Backend returned status {status}: {body}")]
    Status { status: u16, body: String },
    /// 后端报告执行错误
    #[error("Execution failed: {0}")]
    Execution(String),
    /// 响应无法解析
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    /// 没有可用后端（不支持或熔断中）
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    /// 判断错误是否可重试
    ///
    /// 可重试错误计入熔断器失败次数
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Request(e) => {
                e.is_timeout() || e.is_connect() || e.status().is_some_and(|s| s.is_server_error())
            }
            BackendError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// 对应的任务失败码
    pub fn failure_code(&self) -> FailureCode {
        match self {
            BackendError::Request(e) if e.is_timeout() => FailureCode::Timeout,
            _ => FailureCode::Execution,
        }
    }
}

/// 进度上报句柄
///
/// 后端通过它发送阶段事件；接收端关闭后上报被静默丢弃。
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    sender: Option<mpsc::UnboundedSender<StageEvent>>,
}

impl ProgressReporter {
    /// 创建上报句柄及对应的接收端
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StageEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// 不接收任何事件的上报句柄
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn report(&self, event: StageEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }
}

/// 生成后端特质
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// 执行一次生成调用
    ///
    /// # 参数
    ///
    /// * `task` - 待执行任务
    /// * `progress` - 进度上报句柄
    ///
    /// # 返回值
    ///
    /// * `Ok(Artifact)` - 生成产物引用
    /// * `Err(BackendError)` - 执行失败
    async fn run(&self, task: &Task, progress: ProgressReporter) -> Result<Artifact, BackendError>;

    /// 计算对任务类型的支持分数（0-100），0 表示不支持
    fn supports(&self, kind: TaskKind) -> u8;

    /// 后端名称
    fn name(&self) -> &'static str;
}
