// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 基础设施层模块
///
/// 该模块包含系统的技术实现细节，负责与外部系统的交互。
///
/// 包含的子模块：
/// - 缓存（cache）：Redis客户端和键布局
/// - 指标（metrics）：Prometheus 导出器和指标注册
/// - 仓库实现（repositories）：共享存储的 Redis 与内存实现
///
/// 基础设施层依赖于领域层的抽象接口，
/// 领域层不感知具体的存储技术。
pub mod cache;
pub mod metrics;
pub mod repositories;
