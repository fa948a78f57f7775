// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 领域服务模块
///
/// 包含的服务：
/// - 队列管理（queue_manager）：队列创建、配额、取消与聚合状态
/// - 进度跟踪（progress_tracker）：按阶段的进度百分比与剩余时间估算
pub mod progress_tracker;
pub mod queue_manager;
