// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

use crate::domain::services::queue_manager::QueueLimits;
use crate::queue::dispatcher::DispatcherConfig;
use crate::utils::retry_policy::RestartPolicy;
use crate::workers::supervisor::SupervisorConfig;

/// 应用程序配置设置
///
/// 包含存储、Redis、服务器、队列、调度、监管、生成后端和指标等所有配置项
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// 共享存储配置
    pub store: StoreSettings,
    /// Redis配置
    pub redis: RedisSettings,
    /// 服务器配置
    pub server: ServerSettings,
    /// 队列限制配置
    pub queue: QueueSettings,
    /// 调度器配置
    pub dispatcher: DispatcherSettings,
    /// 监管器配置
    pub supervisor: SupervisorSettings,
    /// 生成后端配置
    pub backend: BackendSettings,
    /// 指标配置
    pub metrics: MetricsSettings,
}

/// 共享存储类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

/// 共享存储配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    /// 存储类型 (redis, memory)
    pub backend: StoreBackend,
    /// 键命名空间
    pub namespace: String,
    /// 启动时连接存储的最长重试时间（秒）
    pub connect_retry_secs: u64,
}

/// Redis配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    /// Redis连接URL，设置后优先于 host/port/db
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub db: i64,
}

impl RedisSettings {
    /// 组合出最终的连接URL
    pub fn connection_url(&self) -> String {
        match &self.url {
            Some(url) if !url.is_empty() => url.clone(),
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// 服务器配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// 服务器监听主机地址
    pub host: String,
    /// 服务器监听端口
    pub port: u16,
}

/// 队列限制配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    /// 单个队列允许的最大并发数
    pub max_concurrency: usize,
    /// 未指定时的默认并发数
    pub default_concurrency: usize,
    /// 每个所有者的最大活跃队列数
    pub max_active_queues_per_owner: usize,
    /// 单个队列的最大任务数
    pub max_tasks_per_queue: usize,
    /// 终态队列的保留时长（秒）
    pub retention_secs: u64,
}

/// 调度器配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherSettings {
    /// 单个任务的执行超时（秒）
    pub task_timeout_secs: u64,
    /// 关闭时等待执行中任务的宽限期（秒）
    pub shutdown_grace_secs: u64,
}

/// 监管器配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSettings {
    /// 最多同时运行的工作单元数
    pub max_units: usize,
    pub poll_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub stop_grace_secs: u64,
    pub stable_after_secs: u64,
    pub restart_initial_ms: u64,
    pub restart_multiplier: f64,
    pub restart_max_secs: u64,
    pub restart_cluster_window_secs: u64,
    pub restart_cluster_threshold: usize,
    pub restart_cooldown_multiplier: f64,
    pub restart_max_consecutive: u32,
    pub restart_long_backoff_secs: u64,
}

/// 生成后端配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSettings {
    /// 后端服务基础URL
    pub base_url: String,
    /// 连接超时时间（秒）
    pub connect_timeout_secs: u64,
}

/// 指标配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSettings {
    pub enabled: bool,
    /// Prometheus 导出器监听地址
    pub listen: SocketAddr,
}

impl Settings {
    /// 创建新的配置实例
    ///
    /// 依次叠加内置默认值、配置文件、`GENQUEUE` 前缀环境变量，
    /// 最后由 `REDIS_URL`/`REDIS_HOST`/`REDIS_PORT`/`REDIS_DB` 覆盖存储位置
    ///
    /// # 返回值
    ///
    /// * `Ok(Settings)` - 成功加载的配置
    /// * `Err(ConfigError)` - 配置加载失败
    pub fn new() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENVIRONMENT").unwrap_or_else(|_| "default".to_string());
        let builder = Self::defaults(Config::builder())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(Environment::with_prefix("GENQUEUE").separator("__"))
            .set_override_option("redis.url", std::env::var("REDIS_URL").ok())?
            .set_override_option("redis.host", std::env::var("REDIS_HOST").ok())?
            .set_override_option("redis.port", std::env::var("REDIS_PORT").ok())?
            .set_override_option("redis.db", std::env::var("REDIS_DB").ok())?;

        let settings: Self = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// 仅由内置默认值构成的配置
    pub fn with_defaults() -> Result<Self, ConfigError> {
        let settings: Self = Self::defaults(Config::builder())?.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// 检查反序列化无法表达的取值约束
    pub fn validate(&self) -> Result<(), ConfigError> {
        let supervisor = &self.supervisor;
        for (key, value) in [
            ("supervisor.restart_multiplier", supervisor.restart_multiplier),
            (
                "supervisor.restart_cooldown_multiplier",
                supervisor.restart_cooldown_multiplier,
            ),
        ] {
            if !value.is_finite() || value < 1.0 {
                return Err(ConfigError::Message(format!(
                    "{} must be a finite number >= 1.0, got {}",
                    key, value
                )));
            }
        }
        if supervisor.max_units == 0 {
            return Err(ConfigError::Message(
                "supervisor.max_units must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        builder
            .set_default("store.backend", "redis")?
            .set_default("store.namespace", "genqueue")?
            .set_default("store.connect_retry_secs", 60)?
            .set_default("redis.host", "127.0.0.1")?
            .set_default("redis.port", 6379)?
            .set_default("redis.db", 0)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("queue.max_concurrency", 10)?
            .set_default("queue.default_concurrency", 5)?
            .set_default("queue.max_active_queues_per_owner", 5)?
            .set_default("queue.max_tasks_per_queue", 100)?
            .set_default("queue.retention_secs", 86_400)?
            .set_default("dispatcher.task_timeout_secs", 600)?
            .set_default("dispatcher.shutdown_grace_secs", 30)?
            .set_default("supervisor.max_units", 5)?
            .set_default("supervisor.poll_interval_secs", 5)?
            .set_default("supervisor.heartbeat_interval_secs", 5)?
            .set_default("supervisor.heartbeat_timeout_secs", 30)?
            .set_default("supervisor.stop_grace_secs", 10)?
            .set_default("supervisor.stable_after_secs", 60)?
            .set_default("supervisor.restart_initial_ms", 1000)?
            .set_default("supervisor.restart_multiplier", 2.0)?
            .set_default("supervisor.restart_max_secs", 120)?
            .set_default("supervisor.restart_cluster_window_secs", 30)?
            .set_default("supervisor.restart_cluster_threshold", 3)?
            .set_default("supervisor.restart_cooldown_multiplier", 2.0)?
            .set_default("supervisor.restart_max_consecutive", 8)?
            .set_default("supervisor.restart_long_backoff_secs", 300)?
            .set_default("backend.base_url", "http://127.0.0.1:8188/")?
            .set_default("backend.connect_timeout_secs", 10)?
            .set_default("metrics.enabled", true)?
            .set_default("metrics.listen", "0.0.0.0:9100")
    }

    /// 终态队列的保留时长
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.queue.retention_secs)
    }

    /// 构造监管器配置
    ///
    /// # 参数
    ///
    /// * `max_units` - 最多同时运行的工作单元数
    pub fn supervisor_config(&self, max_units: usize) -> SupervisorConfig {
        SupervisorConfig {
            max_units,
            ..SupervisorConfig::from(self)
        }
    }
}

impl From<&QueueSettings> for QueueLimits {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            max_concurrency: settings.max_concurrency.max(1),
            default_concurrency: settings.default_concurrency.clamp(1, settings.max_concurrency.max(1)),
            max_active_queues_per_owner: settings.max_active_queues_per_owner,
            max_tasks_per_queue: settings.max_tasks_per_queue,
        }
    }
}

impl From<&DispatcherSettings> for DispatcherConfig {
    fn from(settings: &DispatcherSettings) -> Self {
        Self {
            task_timeout: Duration::from_secs(settings.task_timeout_secs),
            shutdown_grace: Duration::from_secs(settings.shutdown_grace_secs),
            ..DispatcherConfig::default()
        }
    }
}

impl From<&SupervisorSettings> for RestartPolicy {
    fn from(settings: &SupervisorSettings) -> Self {
        Self {
            initial: Duration::from_millis(settings.restart_initial_ms),
            multiplier: settings.restart_multiplier,
            max: Duration::from_secs(settings.restart_max_secs),
            cluster_window: Duration::from_secs(settings.restart_cluster_window_secs),
            cluster_threshold: settings.restart_cluster_threshold,
            cooldown_multiplier: settings.restart_cooldown_multiplier,
            max_consecutive: settings.restart_max_consecutive,
            long_backoff: Duration::from_secs(settings.restart_long_backoff_secs),
            stable_after: Duration::from_secs(settings.stable_after_secs),
        }
    }
}

impl From<&Settings> for SupervisorConfig {
    fn from(settings: &Settings) -> Self {
        let supervisor = &settings.supervisor;
        // 工作单元收到停止信号后，调度器先等待执行中任务的宽限期
        let stop_timeout = Duration::from_secs(
            settings.dispatcher.shutdown_grace_secs + supervisor.stop_grace_secs,
        );
        Self {
            max_units: supervisor.max_units.max(1),
            poll_interval: Duration::from_secs(supervisor.poll_interval_secs),
            heartbeat_interval: Duration::from_secs(supervisor.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(supervisor.heartbeat_timeout_secs),
            stop_timeout,
            reconcile_retry: Duration::from_secs(settings.store.connect_retry_secs),
            restart: RestartPolicy::from(supervisor),
            ..SupervisorConfig::default()
        }
    }
}
