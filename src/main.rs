// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use clap::Parser;
use genqueue::config::settings::{Settings, StoreBackend};
use genqueue::domain::repositories::queue_repository::QueueRepository;
use genqueue::domain::repositories::worker_registry::WorkerRegistry;
use genqueue::domain::services::progress_tracker::ProgressTracker;
use genqueue::domain::services::queue_manager::{QueueLimits, QueueManager};
use genqueue::engines::circuit_breaker::{CircuitBreaker, CircuitConfig};
use genqueue::engines::http_engine::HttpGenerationBackend;
use genqueue::engines::router::BackendRouter;
use genqueue::engines::traits::GenerationBackend;
use genqueue::infrastructure::cache::redis_client::RedisClient;
use genqueue::infrastructure::repositories::{MemoryQueueRepository, RedisQueueRepository};
use genqueue::presentation::routes;
use genqueue::queue::dispatcher::{DispatcherConfig, TaskDispatcher};
use genqueue::utils::telemetry;
use genqueue::workers::supervisor::WorkerSupervisor;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use url::Url;

/// 图像与视频生成任务队列服务
#[derive(Parser)]
#[command(name = "genqueue")]
#[command(about = "Task queue and worker supervision for image/video generation")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run the HTTP control plane.
    ///
    /// With the in-memory store the same process also runs the worker supervisor.
    Serve,
    /// Run a worker supervisor.
    Worker(WorkerArgs),
}

#[derive(clap::Args, Debug)]
struct WorkerArgs {
    /// Maximum number of concurrently running worker units.
    ///
    /// Defaults to `supervisor.max_units` from the configuration.
    #[arg(long, env = "GENQUEUE_WORKER_CONCURRENCY")]
    concurrency: Option<usize>,
}

/// 共享存储句柄
struct Store {
    repository: Arc<dyn QueueRepository>,
    registry: Arc<dyn WorkerRegistry>,
    in_memory: bool,
}

/// 主函数
///
/// 应用程序入口点，负责初始化所有组件并启动服务
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 1. Initialize logging
    telemetry::init_telemetry();
    info!("Starting genqueue...");

    // 2. Load configuration
    let settings = Settings::new()?;
    info!("Configuration loaded");

    if settings.metrics.enabled {
        genqueue::infrastructure::metrics::init_metrics(settings.metrics.listen);
    }

    // 3. Connect to the shared store
    let store = open_store(&settings).await?;
    let manager = Arc::new(QueueManager::new(
        store.repository.clone(),
        QueueLimits::from(&settings.queue),
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    match cli.command {
        Commands::Serve => {
            let supervisor = if store.in_memory {
                info!("In-memory store selected, running embedded worker supervisor");
                let supervisor = build_supervisor(
                    &settings,
                    &store,
                    manager.clone(),
                    settings.supervisor.max_units,
                )?;
                Some(tokio::spawn(supervisor.run(shutdown.clone())))
            } else {
                None
            };

            let app = routes::routes(manager);
            let addr = format!("{}:{}", settings.server.host, settings.server.port);
            let listener = TcpListener::bind(&addr).await?;
            info!("Server listening on {}", addr);

            let token = shutdown.clone();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await?;
            shutdown.cancel();

            if let Some(handle) = supervisor {
                handle.await??;
            }
        }
        Commands::Worker(args) => {
            let max_units = args
                .concurrency
                .unwrap_or(settings.supervisor.max_units)
                .max(1);
            let supervisor = build_supervisor(&settings, &store, manager, max_units)?;
            supervisor.run(shutdown).await?;
        }
    }

    info!("genqueue stopped");
    Ok(())
}

async fn open_store(settings: &Settings) -> anyhow::Result<Store> {
    match settings.store.backend {
        StoreBackend::Memory => {
            let memory = Arc::new(MemoryQueueRepository::new(settings.retention()));
            Ok(Store {
                repository: memory.clone(),
                registry: memory,
                in_memory: true,
            })
        }
        StoreBackend::Redis => {
            let url = settings.redis.connection_url();
            let redis = RedisClient::connect_with_retry(
                &url,
                Duration::from_secs(settings.store.connect_retry_secs),
            )
            .await?;
            info!("Redis client initialized");

            let redis = Arc::new(RedisQueueRepository::new(
                redis,
                settings.store.namespace.clone(),
                settings.retention(),
            ));
            Ok(Store {
                repository: redis.clone(),
                registry: redis,
                in_memory: false,
            })
        }
    }
}

fn build_supervisor(
    settings: &Settings,
    store: &Store,
    manager: Arc<QueueManager>,
    max_units: usize,
) -> anyhow::Result<WorkerSupervisor> {
    let base_url = Url::parse(&settings.backend.base_url)?;
    let http = HttpGenerationBackend::new(
        base_url,
        Duration::from_secs(settings.backend.connect_timeout_secs),
    )?;
    let backends: Vec<Arc<dyn GenerationBackend>> = vec![Arc::new(http)];
    let router = BackendRouter::new(
        backends,
        Arc::new(CircuitBreaker::new(CircuitConfig::default())),
    );

    let dispatcher = TaskDispatcher::new(
        manager.clone(),
        Arc::new(router),
        Arc::new(ProgressTracker::new()),
        DispatcherConfig::from(&settings.dispatcher),
    );
    Ok(WorkerSupervisor::new(
        manager,
        dispatcher,
        store.registry.clone(),
        settings.supervisor_config(max_units),
    ))
}

/// 等待 SIGINT 或 SIGTERM 并触发关闭
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for shutdown signal: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("Unable to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
    shutdown.cancel();
}
