// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use serde::{Deserialize, Serialize};

/// 生成后端上报的原始阶段事件
#[derive(Debug, Clone, PartialEq)]
pub enum StageEvent {
    /// 开始执行某个阶段（节点）
    Started { stage: String },
    /// 某阶段的步进进度，`step` 为已完成步数
    Step { stage: String, step: u32, total: u32 },
    /// 整个生成流程结束
    Finished,
}

/// 当前阶段信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInfo {
    /// 阶段标识（节点 ID 或阶段名）
    pub id: String,
    /// 可读标签
    pub label: String,
    /// 在总体进度中所占权重，不参与加权的阶段为 0
    pub weight: f64,
}

/// 进度快照
///
/// 由 ProgressTracker 根据阶段事件计算得出，嵌入到任务进度记录中。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProgressSnapshot {
    pub elapsed_seconds: f64,
    pub estimated_remaining_seconds: f64,
    pub percent_complete: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<StageInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_step_seconds: Option<f64>,
}

/// 持久化的任务进度记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskProgress {
    /// 0-100 的整数进度
    pub percent: u8,
    pub snapshot: ProgressSnapshot,
}

impl TaskProgress {
    pub fn from_snapshot(snapshot: ProgressSnapshot) -> Self {
        Self {
            percent: snapshot.percent_complete.floor().clamp(0.0, 100.0) as u8,
            snapshot,
        }
    }

    /// 任务成功结束时写入的最终进度
    pub fn finished(mut snapshot: ProgressSnapshot) -> Self {
        snapshot.percent_complete = 100.0;
        snapshot.estimated_remaining_seconds = 0.0;
        Self {
            percent: 100,
            snapshot,
        }
    }
}
