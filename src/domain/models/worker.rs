// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 工作单元状态
///
/// 状态转换遵循以下流程：
/// Starting → Running → (Crashed | Stopping) → Terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Running,
    Crashed,
    Stopping,
    Terminated,
}

impl WorkerState {
    /// 检查状态转换是否合法
    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Crashed)
                | (Starting, Stopping)
                | (Running, Crashed)
                | (Running, Stopping)
                | (Crashed, Terminated)
                | (Stopping, Terminated)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Crashed => "crashed",
            WorkerState::Stopping => "stopping",
            WorkerState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// 工作单元心跳记录
///
/// 工作单元本身不持久化，仅在存储中保留最近一次心跳，
/// 供其他进程判断其存活状态。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: String,
    pub pid: u32,
    pub state: WorkerState,
    pub assigned_queue_ids: Vec<Uuid>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(self.last_heartbeat) > timeout
    }
}

/// 生成工作单元 ID：`{pid}-{slot}-{随机后缀}`
pub fn new_worker_id(slot: usize) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", std::process::id(), slot, &suffix[..8])
}
