// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 应用程序模块
///
/// 包含HTTP控制面的数据传输对象
pub mod application;

/// 配置模块
///
/// 处理应用程序的配置设置和环境变量
pub mod config;

/// 领域模块
///
/// 包含队列与任务模型、存储接口以及队列管理和进度跟踪服务
pub mod domain;

/// 引擎模块
///
/// 实现生成后端的调用、路由和熔断
pub mod engines;

/// 基础设施模块
///
/// 提供共享存储、Redis客户端和指标导出
pub mod infrastructure;

/// 表示层模块
///
/// 处理HTTP请求和响应，包括路由、处理器和提取器
pub mod presentation;

/// 队列模块
///
/// 实现单个队列内的任务调度
pub mod queue;

/// 工具模块
///
/// 提供错误类型、重启策略和日志初始化
pub mod utils;

/// 工作器模块
///
/// 实现工作单元和监管器
pub mod workers;
