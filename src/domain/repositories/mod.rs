// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 仓库接口模块
///
/// 该模块定义了领域层的仓库接口，遵循依赖倒置原则。
/// 具体实现由基础设施层提供（Redis 与内存两种）。
///
/// 包含的仓库接口：
/// - 队列仓库（queue_repository）：队列、任务、结果与进度的原子存取
/// - 工作单元注册表（worker_registry）：跨进程心跳记录
pub mod queue_repository;
pub mod worker_registry;
