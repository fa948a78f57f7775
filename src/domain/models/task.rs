// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::{Validate, ValidationErrors};

/// 任务实体
///
/// 表示队列中的一个生成工作单元。任务只属于一个队列，
/// 其运行时状态（待处理、执行中、终态）由存储中的集合成员关系推导，
/// 因此实体本身只携带创建时确定的不可变字段。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// 任务唯一标识符
    pub id: Uuid,
    /// 所属队列ID
    pub queue_id: Uuid,
    /// 创建顺序，待处理任务按此顺序先进先出
    pub position: u32,
    /// 任务负载，按任务类型区分的参数集合
    pub payload: TaskPayload,
}

impl Task {
    /// 创建一个新的任务
    ///
    /// # 参数
    ///
    /// * `queue_id` - 所属队列ID
    /// * `position` - 在队列中的创建顺序
    /// * `payload` - 任务负载
    pub fn new(queue_id: Uuid, position: u32, payload: TaskPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue_id,
            position,
            payload,
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.payload.kind()
    }
}

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// 文生图
    TextToImage,
    /// 图生图
    ImageToImage,
    /// 图生视频
    ImageToVideo,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::TextToImage => "text_to_image",
            TaskKind::ImageToImage => "image_to_image",
            TaskKind::ImageToVideo => "image_to_video",
        }
    }

    /// 后端生成接口的相对路径
    pub fn endpoint_path(&self) -> &'static str {
        match self {
            TaskKind::TextToImage => "generate/text-to-image",
            TaskKind::ImageToImage => "generate/image-to-image",
            TaskKind::ImageToVideo => "generate/image-to-video",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text_to_image" => Ok(TaskKind::TextToImage),
            "image_to_image" => Ok(TaskKind::ImageToImage),
            "image_to_video" => Ok(TaskKind::ImageToVideo),
            _ => Err(()),
        }
    }
}

/// 任务负载
///
/// 每种任务类型拥有独立且经过校验的字段集合，
/// 序列化时以 `kind` 字段区分类型。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    TextToImage(TextToImageParams),
    ImageToImage(ImageToImageParams),
    ImageToVideo(ImageToVideoParams),
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::TextToImage(_) => TaskKind::TextToImage,
            TaskPayload::ImageToImage(_) => TaskKind::ImageToImage,
            TaskPayload::ImageToVideo(_) => TaskKind::ImageToVideo,
        }
    }
}

impl Validate for TaskPayload {
    fn validate(&self) -> Result<(), ValidationErrors> {
        match self {
            TaskPayload::TextToImage(params) => params.validate(),
            TaskPayload::ImageToImage(params) => params.validate(),
            TaskPayload::ImageToVideo(params) => params.validate(),
        }
    }
}

/// 文生图参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct TextToImageParams {
    #[validate(length(min = 1, max = 2000))]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 2000))]
    pub negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 64, max = 2048))]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 64, max = 2048))]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default)]
    pub enhance: bool,
}

/// 图生图参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ImageToImageParams {
    /// 源图片引用（URL 或存储路径）
    #[validate(length(min = 1, max = 4096))]
    pub source_image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 2000))]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 64, max = 2048))]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 64, max = 2048))]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    /// 每个任务生成的变体数量
    #[serde(default = "default_variants")]
    #[validate(range(min = 1, max = 4))]
    pub variants: u8,
    #[serde(default)]
    pub enhance: bool,
}

/// 图生视频参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ImageToVideoParams {
    /// 源图片引用（URL 或存储路径）
    #[validate(length(min = 1, max = 4096))]
    pub source_image: String,
    #[validate(length(min = 1, max = 2000))]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 2000))]
    pub negative_prompt: Option<String>,
    /// 推理步数
    #[serde(default = "default_steps")]
    #[validate(range(min = 1, max = 100))]
    pub steps: u32,
    /// 视频帧数
    #[serde(default = "default_frames")]
    #[validate(range(min = 1, max = 241))]
    pub frames: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

fn default_variants() -> u8 {
    3
}

fn default_steps() -> u32 {
    10
}

fn default_frames() -> u32 {
    81
}

/// 任务状态枚举
///
/// 状态转换遵循以下流程：
/// Pending → Processing → Completed/Failed
/// Pending → Cancelled（队列取消时丢弃）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 等待调度
    #[default]
    Pending,
    /// 正在执行
    Processing,
    /// 执行成功
    Completed,
    /// 执行失败
    Failed,
    /// 队列取消时被丢弃，未曾执行
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// 任务失败原因代码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    /// 生成后端返回错误
    Execution,
    /// 生成后端调用超时
    Timeout,
    /// 执行该任务的工作单元崩溃或心跳超时
    WorkerCrash,
    /// 服务重启时任务仍未完成
    InterruptedByRestart,
    /// 优雅关闭超过宽限期被中止
    WorkerShutdown,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::Execution => "execution",
            FailureCode::Timeout => "timeout",
            FailureCode::WorkerCrash => "worker_crash",
            FailureCode::InterruptedByRestart => "interrupted_by_restart",
            FailureCode::WorkerShutdown => "worker_shutdown",
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 生成产物引用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// 产物位置（URL 或存储路径）
    pub uri: String,
    /// 后端附带的元数据
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl Artifact {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// 任务错误详情
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub code: FailureCode,
    pub message: String,
}

/// 任务终态结果，只在终态转换时写入一次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed { artifact: Artifact },
    Failed { error: TaskFailure },
}

impl TaskOutcome {
    pub fn completed(artifact: Artifact) -> Self {
        TaskOutcome::Completed { artifact }
    }

    pub fn failed(code: FailureCode, message: impl Into<String>) -> Self {
        TaskOutcome::Failed {
            error: TaskFailure {
                code,
                message: message.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Completed { .. })
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Completed { .. } => TaskStatus::Completed,
            TaskOutcome::Failed { .. } => TaskStatus::Failed,
        }
    }

    pub fn failure_code(&self) -> Option<FailureCode> {
        match self {
            TaskOutcome::Completed { .. } => None,
            TaskOutcome::Failed { error } => Some(error.code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_is_tagged_by_kind() {
        let payload: TaskPayload = serde_json::from_value(serde_json::json!({
            "kind": "image_to_video",
            "source_image": "uploads/cat.png",
            "prompt": "a cat waves"
        }))
        .unwrap();

        assert_eq!(payload.kind(), TaskKind::ImageToVideo);
        match payload {
            TaskPayload::ImageToVideo(params) => {
                assert_eq!(params.steps, 10);
                assert_eq!(params.frames, 81);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_payload_validation() {
        let ok = TaskPayload::TextToImage(TextToImageParams {
            prompt: "a red fox".to_string(),
            negative_prompt: None,
            width: Some(1024),
            height: Some(1024),
            seed: Some(1),
            enhance: false,
        });
        assert!(ok.validate().is_ok());

        let empty_prompt = TaskPayload::TextToImage(TextToImageParams {
            prompt: String::new(),
            negative_prompt: None,
            width: None,
            height: None,
            seed: None,
            enhance: false,
        });
        assert!(empty_prompt.validate().is_err());

        let too_many_variants = TaskPayload::ImageToImage(ImageToImageParams {
            source_image: "a.png".to_string(),
            prompt: None,
            width: None,
            height: Some(4096),
            seed: None,
            variants: 9,
            enhance: false,
        });
        let errors = too_many_variants.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("variants"));
        assert!(fields.contains_key("height"));
    }

    #[test]
    fn test_outcome_status() {
        let ok = TaskOutcome::completed(Artifact::new("s3://bucket/a.png"));
        assert!(ok.is_success());
        assert_eq!(ok.status(), TaskStatus::Completed);
        assert_eq!(ok.failure_code(), None);

        let failed = TaskOutcome::failed(FailureCode::Timeout, "timed out");
        assert_eq!(failed.status(), TaskStatus::Failed);
        assert_eq!(failed.failure_code(), Some(FailureCode::Timeout));
        assert_eq!(FailureCode::InterruptedByRestart.to_string(), "interrupted_by_restart");
    }
}
