// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 仓库实现模块
///
/// 提供队列仓库和工作单元注册表的具体实现：
/// Redis 实现用于多进程部署，内存实现用于测试和单进程模式
pub mod memory_queue_repo;
pub mod redis_queue_repo;

pub use memory_queue_repo::MemoryQueueRepository;
pub use redis_queue_repo::RedisQueueRepository;
