// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::progress::TaskProgress;
use super::task::{Task, TaskKind, TaskOutcome, TaskStatus};

/// 队列原因：服务重启时队列仍在执行
pub const REASON_INTERRUPTED_BY_RESTART: &str = "interrupted_by_restart";
/// 队列原因：由所有者取消
pub const REASON_CANCELLED_BY_OWNER: &str = "cancelled_by_owner";

/// 队列实体
///
/// 一组共享并发预算和聚合状态的生成任务。
/// 计数字段只通过存储层的原子操作递增。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Queue {
    /// 队列唯一标识符
    pub id: Uuid,
    /// 请求者身份，用于权限校验和配额统计
    pub owner_id: String,
    /// 并发上限
    pub concurrency: usize,
    /// 任务总数
    pub total_tasks: u64,
    /// 已完成任务数
    pub completed_count: u64,
    /// 已失败任务数
    pub failed_count: u64,
    /// 队列状态
    pub status: QueueStatus,
    /// 是否已请求取消
    pub cancel_requested: bool,
    /// 终态原因（如 interrupted_by_restart）
    pub reason: Option<String>,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 进入终态的时间
    pub completed_at: Option<DateTime<Utc>>,
}

impl Queue {
    /// 创建一个处于等待状态的新队列
    ///
    /// # 参数
    ///
    /// * `owner_id` - 所有者身份
    /// * `concurrency` - 已钳制的并发上限
    /// * `total_tasks` - 任务总数
    pub fn new(owner_id: impl Into<String>, concurrency: usize, total_tasks: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            concurrency,
            total_tasks,
            completed_count: 0,
            failed_count: 0,
            status: QueueStatus::Waiting,
            cancel_requested: false,
            reason: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// 已结束（成功或失败）的任务数
    pub fn finished_count(&self) -> u64 {
        self.completed_count + self.failed_count
    }

    /// 根据计数和占用情况计算应当进入的终态
    ///
    /// 返回 `None` 表示队列尚未排空或已经处于终态。
    ///
    /// # 参数
    ///
    /// * `occupancy` - 当前待处理和执行中的任务数
    pub fn settle(&self, occupancy: Occupancy) -> Option<QueueStatus> {
        if self.status.is_terminal() {
            return None;
        }

        if self.cancel_requested {
            return occupancy.is_drained().then_some(QueueStatus::Cancelled);
        }

        if self.finished_count() >= self.total_tasks {
            if self.total_tasks > 0 && self.failed_count >= self.total_tasks {
                Some(QueueStatus::Failed)
            } else {
                Some(QueueStatus::Completed)
            }
        } else {
            None
        }
    }
}

/// 队列状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    #[default]
    Waiting,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl QueueStatus {
    /// 非终态集合，状态比较交换的默认来源
    pub const ACTIVE: [QueueStatus; 2] = [QueueStatus::Waiting, QueueStatus::Processing];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Completed | QueueStatus::Failed | QueueStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Waiting => "waiting",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(QueueStatus::Waiting),
            "processing" => Ok(QueueStatus::Processing),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            "cancelled" => Ok(QueueStatus::Cancelled),
            _ => Err(()),
        }
    }
}

/// 队列当前占用：待处理与执行中的任务数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Occupancy {
    pub pending: u64,
    pub in_flight: u64,
}

impl Occupancy {
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.in_flight == 0
    }
}

/// 结果记录回执
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutcomeReceipt {
    /// 本次写入是否生效；重复上报时为 false
    pub applied: bool,
    pub completed_count: u64,
    pub failed_count: u64,
}

/// 单个任务的存储快照
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task: Task,
    pub status: TaskStatus,
    pub outcome: Option<TaskOutcome>,
    pub progress: Option<TaskProgress>,
}

/// 队列及其全部任务的存储快照
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub queue: Queue,
    pub tasks: Vec<TaskRecord>,
}

impl QueueSnapshot {
    pub fn occupancy(&self) -> Occupancy {
        let mut occupancy = Occupancy::default();
        for record in &self.tasks {
            match record.status {
                TaskStatus::Pending => occupancy.pending += 1,
                TaskStatus::Processing => occupancy.in_flight += 1,
                _ => {}
            }
        }
        occupancy
    }
}

/// 对调用方暴露的单任务视图
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub id: Uuid,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<super::task::Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<super::task::TaskFailure>,
}

impl From<&TaskRecord> for TaskView {
    fn from(record: &TaskRecord) -> Self {
        let (result, error) = match &record.outcome {
            Some(TaskOutcome::Completed { artifact }) => (Some(artifact.clone()), None),
            Some(TaskOutcome::Failed { error }) => (None, Some(error.clone())),
            None => (None, None),
        };
        let progress = record.progress.as_ref();
        Self {
            id: record.task.id,
            kind: record.task.kind(),
            status: record.status,
            progress: match record.status {
                TaskStatus::Completed => 100,
                _ => progress.map(|p| p.percent).unwrap_or(0),
            },
            stage: progress
                .and_then(|p| p.snapshot.current_stage.as_ref())
                .map(|stage| stage.label.clone()),
            eta_seconds: match record.status {
                TaskStatus::Processing => {
                    progress.map(|p| p.snapshot.estimated_remaining_seconds)
                }
                _ => None,
            },
            result,
            error,
        }
    }
}

/// 对调用方暴露的队列视图
#[derive(Debug, Clone, Serialize)]
pub struct QueueView {
    pub queue_id: Uuid,
    pub owner_id: String,
    pub status: QueueStatus,
    pub concurrency: usize,
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub pending_tasks: u64,
    pub in_flight_tasks: u64,
    pub cancelled_tasks: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub tasks: Vec<TaskView>,
}

impl From<&QueueSnapshot> for QueueView {
    fn from(snapshot: &QueueSnapshot) -> Self {
        let queue = &snapshot.queue;
        let occupancy = snapshot.occupancy();
        let cancelled = snapshot
            .tasks
            .iter()
            .filter(|record| record.status == TaskStatus::Cancelled)
            .count() as u64;
        Self {
            queue_id: queue.id,
            owner_id: queue.owner_id.clone(),
            status: queue.status,
            concurrency: queue.concurrency,
            total_tasks: queue.total_tasks,
            completed_tasks: queue.completed_count,
            failed_tasks: queue.failed_count,
            pending_tasks: occupancy.pending,
            in_flight_tasks: occupancy.in_flight,
            cancelled_tasks: cancelled,
            reason: queue.reason.clone(),
            created_at: queue.created_at,
            completed_at: queue.completed_at,
            tasks: snapshot.tasks.iter().map(TaskView::from).collect(),
        }
    }
}

/// 活跃队列摘要
#[derive(Debug, Clone, Serialize)]
pub struct QueueSummary {
    pub queue_id: Uuid,
    pub status: QueueStatus,
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub created_at: DateTime<Utc>,
}

impl From<&Queue> for QueueSummary {
    fn from(queue: &Queue) -> Self {
        Self {
            queue_id: queue.id,
            status: queue.status,
            total_tasks: queue.total_tasks,
            completed_tasks: queue.completed_count,
            failed_tasks: queue.failed_count,
            created_at: queue.created_at,
        }
    }
}

impl From<&QueueView> for QueueSummary {
    fn from(view: &QueueView) -> Self {
        Self {
            queue_id: view.queue_id,
            status: view.status,
            total_tasks: view.total_tasks,
            completed_tasks: view.completed_tasks,
            failed_tasks: view.failed_tasks,
            created_at: view.created_at,
        }
    }
}
