// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use futures::stream::{BoxStream, StreamExt};
use redis::aio::ConnectionManager;
use redis::RedisError;
use std::time::Duration;
use tracing::warn;

use crate::domain::repositories::queue_repository::StoreError;
use crate::utils::retry_policy::store_backoff;

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Redis客户端
///
/// 持有一个自动重连的连接管理器，所有命令共享该连接
#[derive(Clone)]
pub struct RedisClient {
    /// Redis客户端
    client: redis::Client,
    /// 连接管理器
    connection: ConnectionManager,
}

impl RedisClient {
    /// 创建新的Redis客户端实例并建立连接
    ///
    /// # 参数
    ///
    /// * `redis_url` - Redis连接URL
    ///
    /// # 返回值
    ///
    /// * `Ok(RedisClient)` - Redis客户端实例
    /// * `Err(StoreError)` - 连接失败
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let connection = client.get_connection_manager().await?;
        Ok(Self { client, connection })
    }

    /// 带退避重试地建立连接
    ///
    /// # 参数
    ///
    /// * `redis_url` - Redis连接URL
    /// * `max_elapsed` - 放弃前的最长累计重试时间
    pub async fn connect_with_retry(
        redis_url: &str,
        max_elapsed: Duration,
    ) -> Result<Self, StoreError> {
        backoff::future::retry(store_backoff(max_elapsed), || async {
            let client = Self::connect(redis_url).await.map_err(|e| match e {
                StoreError::Unavailable(_) => {
                    warn!("Redis not reachable, retrying: {}", e);
                    backoff::Error::transient(e)
                }
                other => backoff::Error::permanent(other),
            })?;
            client.ping().await.map_err(backoff::Error::transient)?;
            Ok(client)
        })
        .await
    }

    /// 获取共享连接
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    /// 检查连接是否可用
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut con = self.connection();
        let _: String = redis::cmd("PING").query_async(&mut con).await?;
        Ok(())
    }

    /// 订阅频道并返回消息负载流
    ///
    /// 订阅使用独立连接；无法解析为字符串的消息会被丢弃。
    ///
    /// # 参数
    ///
    /// * `channel` - 频道名称
    pub async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!("Dropping undecodable pub/sub message: {}", e);
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
