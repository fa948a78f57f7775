// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 领域层模块
///
/// 该模块包含系统的核心业务逻辑，包括：
/// - 领域模型（models）：队列、任务、进度与工作单元
/// - 仓库接口（repositories）：共享存储抽象接口
/// - 服务（services）：队列管理与进度跟踪
///
/// 领域层不依赖于任何具体存储或生成后端实现。
pub mod models;
pub mod repositories;
pub mod services;
