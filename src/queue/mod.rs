// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 队列模块
///
/// 负责单个队列内任务的并发受限调度和结果上报
pub mod dispatcher;

pub use dispatcher::{DispatchSummary, DispatcherConfig, TaskDispatcher};
