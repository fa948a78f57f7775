// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 缓存模块
///
/// 提供 Redis 客户端和共享存储的键命名规则
pub mod keys;
pub mod redis_client;
