// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use uuid::Uuid;

use crate::domain::models::progress::{ProgressSnapshot, StageEvent, StageInfo};
use crate::domain::models::task::TaskKind;

/// 移动平均窗口大小
pub const STEP_WINDOW: usize = 10;

/// 后续加权阶段的预估耗时占当前阶段预估总耗时的比例
const FOLLOWING_STAGE_RATIO: f64 = 1.0 / 3.0;

/// 未知阶段的通用标签
pub const UNKNOWN_STAGE_LABEL: &str = "processing";

static STAGE_LABELS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("11", "Initializing service"),
        ("13", "Loading model"),
        ("16", "Preparing environment"),
        ("17", "Setting iteration parameters"),
        ("18", "Loading image"),
        ("21", "Preprocessing image"),
        ("22", "Configuring model parameters"),
        ("23", "Preparing prompt"),
        ("24", "Configuring sampler"),
        ("25", "Configuring scheduler"),
        ("26", "Preparing inference"),
        ("27", "Video inference"),
        ("28", "Post-processing frames"),
        ("29", "Preparing video"),
        ("30", "Combining video"),
        ("31", "Optimizing video"),
        ("32", "Post-processing video"),
        ("40", "Finishing"),
        ("inference", "Generating image"),
    ])
});

/// 图生视频的加权阶段：推理 70%，合成 30%
const IMAGE_TO_VIDEO_STAGES: &[(&str, f64)] = &[("27", 0.7), ("30", 0.3)];

/// 阶段 ID 对应的可读标签
pub fn stage_label(stage: &str) -> &'static str {
    STAGE_LABELS
        .get(stage)
        .copied()
        .unwrap_or(UNKNOWN_STAGE_LABEL)
}

/// 任务类型对应的进度流水线
#[derive(Debug, Clone, Copy)]
enum Pipeline {
    /// 单阶段：任意上报步进的阶段都占全部权重
    Single,
    /// 多阶段：按固定权重凸组合
    Weighted(&'static [(&'static str, f64)]),
}

impl Pipeline {
    fn for_kind(kind: TaskKind) -> Self {
        match kind {
            TaskKind::ImageToVideo => Pipeline::Weighted(IMAGE_TO_VIDEO_STAGES),
            TaskKind::TextToImage | TaskKind::ImageToImage => Pipeline::Single,
        }
    }

    fn weight_of(&self, stage: &str) -> f64 {
        match self {
            Pipeline::Single => 1.0,
            Pipeline::Weighted(stages) => stages
                .iter()
                .find(|(id, _)| *id == stage)
                .map(|(_, weight)| *weight)
                .unwrap_or(0.0),
        }
    }

    fn position_of(&self, stage: &str) -> Option<usize> {
        match self {
            Pipeline::Single => None,
            Pipeline::Weighted(stages) => stages.iter().position(|(id, _)| *id == stage),
        }
    }
}

/// 单个阶段的步进计时器
#[derive(Debug, Clone)]
struct StageTimer {
    total: u32,
    last_step: u32,
    last_step_at: Instant,
    durations: VecDeque<f64>,
}

impl StageTimer {
    fn new(now: Instant) -> Self {
        Self {
            total: 0,
            last_step: 0,
            last_step_at: now,
            durations: VecDeque::with_capacity(STEP_WINDOW),
        }
    }

    /// 记录新的步进；重复或回退的步数不修改窗口
    fn record(&mut self, step: u32, total: u32, now: Instant) {
        if total > 0 {
            self.total = total;
        }
        if step <= self.last_step {
            return;
        }

        let steps_taken = step - self.last_step;
        let elapsed = now.saturating_duration_since(self.last_step_at).as_secs_f64();
        let per_step = elapsed / steps_taken as f64;
        // 超出窗口的部分会被立即丢弃，只补足窗口容量
        let samples = (steps_taken as usize).min(STEP_WINDOW);
        self.durations.extend(std::iter::repeat(per_step).take(samples));
        while self.durations.len() > STEP_WINDOW {
            self.durations.pop_front();
        }

        self.last_step = step;
        self.last_step_at = now;
    }

    fn average(&self) -> Option<f64> {
        if self.durations.is_empty() {
            None
        } else {
            Some(self.durations.iter().sum::<f64>() / self.durations.len() as f64)
        }
    }

    fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.last_step.min(self.total) as f64 / self.total as f64) * 100.0
        }
    }

    fn remaining(&self) -> f64 {
        self.average()
            .map(|avg| avg * self.total.saturating_sub(self.last_step) as f64)
            .unwrap_or(0.0)
    }

    fn estimated_total(&self) -> f64 {
        self.average()
            .map(|avg| avg * self.total as f64)
            .unwrap_or(0.0)
    }
}

/// 单个任务的进度时间线
#[derive(Debug, Clone)]
struct TaskTimeline {
    pipeline: Pipeline,
    started_at: Instant,
    stages: HashMap<String, StageTimer>,
    current_stage: Option<String>,
    stepping_stage: Option<String>,
    last_event_at: Instant,
    best_percent: f64,
    finished: bool,
}

impl TaskTimeline {
    fn new(kind: Option<TaskKind>, now: Instant) -> Self {
        Self {
            pipeline: kind.map(Pipeline::for_kind).unwrap_or(Pipeline::Single),
            started_at: now,
            stages: HashMap::new(),
            current_stage: None,
            stepping_stage: None,
            last_event_at: now,
            best_percent: 0.0,
            finished: false,
        }
    }

    fn apply(&mut self, event: &StageEvent, now: Instant) {
        // 未显式开始的阶段从上一个事件起计时
        let since = self.last_event_at;
        match event {
            StageEvent::Started { stage } => {
                self.stages
                    .entry(stage.clone())
                    .or_insert_with(|| StageTimer::new(now));
                self.current_stage = Some(stage.clone());
            }
            StageEvent::Step { stage, step, total } => {
                self.stages
                    .entry(stage.clone())
                    .or_insert_with(|| StageTimer::new(since))
                    .record(*step, *total, now);
                self.current_stage = Some(stage.clone());
                self.stepping_stage = Some(stage.clone());
            }
            StageEvent::Finished => {
                self.finished = true;
            }
        }
        self.last_event_at = now;
    }

    fn overall_percent(&self) -> f64 {
        if self.finished {
            return 100.0;
        }

        match self.pipeline {
            Pipeline::Single => self
                .stepping_stage
                .as_ref()
                .and_then(|stage| self.stages.get(stage))
                .map(StageTimer::percent)
                .unwrap_or(0.0),
            Pipeline::Weighted(stages) => {
                // 已进入的最后一个加权阶段之前的加权阶段视为已完成
                let reached = stages
                    .iter()
                    .rposition(|(id, _)| self.stages.contains_key(*id));
                stages
                    .iter()
                    .enumerate()
                    .map(|(index, (id, weight))| {
                        let percent = match reached {
                            Some(last) if index < last => 100.0,
                            _ => self.stages.get(*id).map(StageTimer::percent).unwrap_or(0.0),
                        };
                        weight * percent
                    })
                    .sum()
            }
        }
    }

    fn remaining(&self) -> (f64, Option<f64>) {
        if self.finished {
            return (0.0, None);
        }
        let Some(stage) = self.stepping_stage.as_ref() else {
            return (0.0, None);
        };
        let Some(timer) = self.stages.get(stage) else {
            return (0.0, None);
        };

        let mut remaining = timer.remaining();
        if let (Pipeline::Weighted(stages), Some(position)) =
            (self.pipeline, self.pipeline.position_of(stage))
        {
            let later_pending = stages[position + 1..]
                .iter()
                .any(|(id, _)| !self.stages.contains_key(*id));
            if later_pending {
                remaining += timer.estimated_total() * FOLLOWING_STAGE_RATIO;
            }
        }
        (remaining, timer.average())
    }

    fn snapshot(&mut self, now: Instant) -> ProgressSnapshot {
        let percent = self.overall_percent().clamp(0.0, 100.0);
        if percent > self.best_percent {
            self.best_percent = percent;
        }
        let (remaining, average) = self.remaining();

        ProgressSnapshot {
            elapsed_seconds: round1(now.saturating_duration_since(self.started_at).as_secs_f64()),
            estimated_remaining_seconds: round1(remaining),
            percent_complete: round1(self.best_percent),
            current_stage: self.current_stage.as_ref().map(|stage| StageInfo {
                id: stage.clone(),
                label: stage_label(stage).to_string(),
                weight: self.pipeline.weight_of(stage),
            }),
            average_step_seconds: average.map(round1),
        }
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// 进度跟踪器
///
/// 将原始阶段事件（节点 ID、步数）转换为 0-100 的总体进度和剩余时间预估。
/// 每个任务保留最近 10 个步进耗时用于移动平均；重复上报同一步数时只重新计算，
/// 不修改窗口。
#[derive(Default)]
pub struct ProgressTracker {
    timelines: DashMap<Uuid, TaskTimeline>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开始跟踪一个任务
    pub fn start(&self, task_id: Uuid, kind: TaskKind) {
        self.start_at(task_id, kind, Instant::now());
    }

    pub fn start_at(&self, task_id: Uuid, kind: TaskKind, now: Instant) {
        self.timelines
            .insert(task_id, TaskTimeline::new(Some(kind), now));
    }

    /// 应用阶段事件并返回最新快照
    ///
    /// # 参数
    ///
    /// * `task_id` - 任务ID
    /// * `event` - 阶段事件
    ///
    /// # 返回值
    ///
    /// 计算得到的进度快照
    pub fn update(&self, task_id: Uuid, event: &StageEvent) -> ProgressSnapshot {
        self.update_at(task_id, event, Instant::now())
    }

    pub fn update_at(&self, task_id: Uuid, event: &StageEvent, now: Instant) -> ProgressSnapshot {
        let mut timeline = self
            .timelines
            .entry(task_id)
            .or_insert_with(|| TaskTimeline::new(None, now));
        timeline.apply(event, now);
        timeline.snapshot(now)
    }

    /// 当前快照（不修改状态）
    pub fn snapshot(&self, task_id: Uuid) -> Option<ProgressSnapshot> {
        self.timelines
            .get_mut(&task_id)
            .map(|mut timeline| timeline.snapshot(Instant::now()))
    }

    /// 停止跟踪并返回最后的快照
    pub fn finish(&self, task_id: Uuid) -> Option<ProgressSnapshot> {
        self.timelines
            .remove(&task_id)
            .map(|(_, mut timeline)| timeline.snapshot(Instant::now()))
    }

    pub fn tracked(&self) -> usize {
        self.timelines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn step(stage: &str, step: u32, total: u32) -> StageEvent {
        StageEvent::Step {
            stage: stage.to_string(),
            step,
            total,
        }
    }

    #[test]
    fn test_moving_average_remaining_time() {
        let tracker = ProgressTracker::new();
        let task_id = Uuid::new_v4();
        let t0 = Instant::now();
        tracker.start_at(task_id, TaskKind::TextToImage, t0);

        tracker.update_at(task_id, &step("inference", 1, 10), t0 + Duration::from_secs(2));
        let snapshot =
            tracker.update_at(task_id, &step("inference", 2, 10), t0 + Duration::from_secs(4));

        assert_eq!(snapshot.average_step_seconds, Some(2.0));
        assert_eq!(snapshot.estimated_remaining_seconds, 16.0);
        assert_eq!(snapshot.percent_complete, 20.0);
        assert_eq!(snapshot.elapsed_seconds, 4.0);
        assert_eq!(
            snapshot.current_stage.as_ref().map(|s| s.label.as_str()),
            Some("Generating image")
        );
    }

    #[test]
    fn test_duplicate_step_does_not_double_count() {
        let tracker = ProgressTracker::new();
        let task_id = Uuid::new_v4();
        let t0 = Instant::now();
        tracker.start_at(task_id, TaskKind::TextToImage, t0);

        tracker.update_at(task_id, &step("inference", 1, 5), t0 + Duration::from_secs(1));
        let single =
            tracker.update_at(task_id, &step("inference", 2, 5), t0 + Duration::from_secs(2));
        let duplicate =
            tracker.update_at(task_id, &step("inference", 2, 5), t0 + Duration::from_secs(9));

        assert_eq!(
            single.estimated_remaining_seconds,
            duplicate.estimated_remaining_seconds
        );
        assert_eq!(single.average_step_seconds, duplicate.average_step_seconds);
        assert_eq!(single.percent_complete, duplicate.percent_complete);
    }

    #[test]
    fn test_multi_step_jump_splits_elapsed_time() {
        let tracker = ProgressTracker::new();
        let task_id = Uuid::new_v4();
        let t0 = Instant::now();
        tracker.start_at(task_id, TaskKind::TextToImage, t0);

        let snapshot =
            tracker.update_at(task_id, &step("inference", 4, 8), t0 + Duration::from_secs(8));
        assert_eq!(snapshot.average_step_seconds, Some(2.0));
        assert_eq!(snapshot.estimated_remaining_seconds, 8.0);
    }

    #[test]
    fn test_window_keeps_last_ten_steps() {
        let tracker = ProgressTracker::new();
        let task_id = Uuid::new_v4();
        let t0 = Instant::now();
        tracker.start_at(task_id, TaskKind::TextToImage, t0);

        // 前 10 步每步 10 秒，之后 10 步每步 1 秒
        let mut at = t0;
        for i in 1..=10 {
            at += Duration::from_secs(10);
            tracker.update_at(task_id, &step("inference", i, 30), at);
        }
        let mut last = ProgressSnapshot::default();
        for i in 11..=20 {
            at += Duration::from_secs(1);
            last = tracker.update_at(task_id, &step("inference", i, 30), at);
        }
        assert_eq!(last.average_step_seconds, Some(1.0));
        assert_eq!(last.estimated_remaining_seconds, 10.0);
    }

    #[test]
    fn test_huge_step_jump_keeps_window_bounded() {
        let tracker = ProgressTracker::new();
        let task_id = Uuid::new_v4();
        let t0 = Instant::now();
        tracker.start_at(task_id, TaskKind::TextToImage, t0);

        let snapshot = tracker.update_at(
            task_id,
            &step("inference", 2_000_000_000, 2_000_000_010),
            t0 + Duration::from_secs(1),
        );
        assert_eq!(snapshot.average_step_seconds, Some(0.0));
        assert!(snapshot.percent_complete <= 100.0);

        // 窗口只有 10 个样本，下一步 1 秒拉高平均值到 0.1
        let snapshot = tracker.update_at(
            task_id,
            &step("inference", 2_000_000_001, 2_000_000_010),
            t0 + Duration::from_secs(2),
        );
        assert_eq!(snapshot.average_step_seconds, Some(0.1));
        assert_eq!(snapshot.estimated_remaining_seconds, 0.9);
    }

    #[test]
    fn test_image_to_video_weighted_stages() {
        let tracker = ProgressTracker::new();
        let task_id = Uuid::new_v4();
        let t0 = Instant::now();
        tracker.start_at(task_id, TaskKind::ImageToVideo, t0);

        tracker.update_at(
            task_id,
            &StageEvent::Started {
                stage: "27".to_string(),
            },
            t0,
        );
        let half = tracker.update_at(task_id, &step("27", 5, 10), t0 + Duration::from_secs(10));
        assert_eq!(half.percent_complete, 35.0);
        // 剩余推理 5 步 × 2 秒，加上预估合成时间 20 / 3
        assert_eq!(half.estimated_remaining_seconds, 16.7);
        let stage = half.current_stage.unwrap();
        assert_eq!(stage.label, "Video inference");
        assert_eq!(stage.weight, 0.7);

        let combining =
            tracker.update_at(task_id, &step("30", 1, 4), t0 + Duration::from_secs(30));
        assert_eq!(combining.percent_complete, 77.5);
        assert_eq!(combining.current_stage.unwrap().label, "Combining video");

        let done = tracker.update_at(task_id, &StageEvent::Finished, t0 + Duration::from_secs(40));
        assert_eq!(done.percent_complete, 100.0);
        assert_eq!(done.estimated_remaining_seconds, 0.0);
    }

    #[test]
    fn test_unweighted_stage_keeps_percent_monotonic() {
        let tracker = ProgressTracker::new();
        let task_id = Uuid::new_v4();
        let t0 = Instant::now();
        tracker.start_at(task_id, TaskKind::ImageToVideo, t0);

        let inference = tracker.update_at(task_id, &step("27", 10, 10), t0 + Duration::from_secs(5));
        assert_eq!(inference.percent_complete, 70.0);

        let post = tracker.update_at(
            task_id,
            &StageEvent::Started {
                stage: "28".to_string(),
            },
            t0 + Duration::from_secs(6),
        );
        assert_eq!(post.percent_complete, 70.0);
        assert_eq!(post.current_stage.unwrap().weight, 0.0);
    }

    #[test]
    fn test_unknown_stage_label() {
        assert_eq!(stage_label("999"), UNKNOWN_STAGE_LABEL);
        assert_eq!(stage_label("30"), "Combining video");
    }

    #[test]
    fn test_finish_stops_tracking() {
        let tracker = ProgressTracker::new();
        let task_id = Uuid::new_v4();
        tracker.start(task_id, TaskKind::ImageToImage);
        assert_eq!(tracker.tracked(), 1);
        assert!(tracker.finish(task_id).is_some());
        assert_eq!(tracker.tracked(), 0);
        assert!(tracker.snapshot(task_id).is_none());
    }
}
