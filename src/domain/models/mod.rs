// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 领域模型模块
///
/// 该模块定义了系统的核心业务实体，包括：
/// - 队列（queue）：共享并发预算与聚合状态的一组任务
/// - 任务（task）：单个生成工作单元及其类型化负载
/// - 进度（progress）：阶段事件与进度快照
/// - 工作单元（worker）：心跳记录与生命周期状态
pub mod progress;
pub mod queue;
pub mod task;
pub mod worker;
