// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

pub mod backends;
pub mod stores;

use genqueue::domain::models::task::{TaskPayload, TextToImageParams};
use genqueue::domain::repositories::worker_registry::WorkerRegistry;
use self::stores::FaultyRepository;
use genqueue::domain::services::progress_tracker::ProgressTracker;
use genqueue::domain::services::queue_manager::{QueueLimits, QueueManager};
use genqueue::engines::traits::GenerationBackend;
use genqueue::infrastructure::repositories::MemoryQueueRepository;
use genqueue::queue::dispatcher::{DispatcherConfig, TaskDispatcher};
use genqueue::workers::supervisor::{SupervisorConfig, SupervisorStats, WorkerSupervisor};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use genqueue::utils::errors::WorkerError;

/// 文生图任务负载
pub fn text_task(prompt: &str) -> TaskPayload {
    TaskPayload::TextToImage(TextToImageParams {
        prompt: prompt.to_string(),
        negative_prompt: None,
        width: Some(512),
        height: Some(512),
        seed: None,
        enhance: false,
    })
}

/// 基于内存存储的测试环境
pub struct Harness {
    pub repo: Arc<MemoryQueueRepository>,
    pub manager: Arc<QueueManager>,
}

impl Harness {
    pub fn new() -> Self {
        let repo = Arc::new(MemoryQueueRepository::default());
        let manager = Arc::new(QueueManager::new(repo.clone(), QueueLimits::default()));
        Self { repo, manager }
    }

    /// 队列管理经由可注入故障的仓库访问存储，工作单元注册表仍直连内存存储
    pub fn faulty() -> (Self, Arc<FaultyRepository>) {
        let repo = Arc::new(MemoryQueueRepository::default());
        let faulty = Arc::new(FaultyRepository::new(repo.clone()));
        let manager = Arc::new(QueueManager::new(faulty.clone(), QueueLimits::default()));
        (Self { repo, manager }, faulty)
    }

    /// 启动监管器并等待启动对账完成，返回关闭句柄、统计和任务句柄
    pub async fn start_supervisor(
        &self,
        backend: Arc<dyn GenerationBackend>,
        registry: Option<Arc<dyn WorkerRegistry>>,
        config: SupervisorConfig,
    ) -> RunningSupervisor {
        self.start_supervisor_with(backend, registry, config, DispatcherConfig::default())
            .await
    }

    pub async fn start_supervisor_with(
        &self,
        backend: Arc<dyn GenerationBackend>,
        registry: Option<Arc<dyn WorkerRegistry>>,
        config: SupervisorConfig,
        dispatcher_config: DispatcherConfig,
    ) -> RunningSupervisor {
        let dispatcher = TaskDispatcher::new(
            self.manager.clone(),
            backend,
            Arc::new(ProgressTracker::new()),
            dispatcher_config,
        );
        let registry = registry.unwrap_or_else(|| self.repo.clone() as Arc<dyn WorkerRegistry>);
        let supervisor = WorkerSupervisor::new(self.manager.clone(), dispatcher, registry, config);
        let stats = supervisor.stats();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(shutdown.clone()));
        // 之后创建的队列不会被启动对账当作上次运行的遗留
        tokio::time::sleep(Duration::from_millis(50)).await;
        RunningSupervisor {
            shutdown,
            stats,
            handle,
        }
    }
}

pub struct RunningSupervisor {
    pub shutdown: CancellationToken,
    pub stats: Arc<Mutex<SupervisorStats>>,
    pub handle: JoinHandle<Result<SupervisorStats, WorkerError>>,
}

impl RunningSupervisor {
    pub async fn stop(self) -> SupervisorStats {
        self.shutdown.cancel();
        self.handle
            .await
            .expect("supervisor task panicked")
            .expect("supervisor failed")
    }
}
