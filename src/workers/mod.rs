// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 工作器模块
///
/// 工作单元负责按分配驱动队列调度，监管器负责发现队列、
/// 检测崩溃和按退避策略重启工作单元
pub mod supervisor;
pub mod worker_unit;

pub use supervisor::{SupervisorConfig, SupervisorStats, WorkerSupervisor};
pub use worker_unit::{UnitShared, WorkerUnit, WorkerUnitConfig};
