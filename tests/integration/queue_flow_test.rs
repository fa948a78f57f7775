// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::helpers::backends::ScriptedBackend;
use crate::helpers::stores::{FaultyRepository, FlakyRegistry};
use crate::helpers::{text_task, Harness};
use genqueue::domain::models::queue::{QueueStatus, REASON_INTERRUPTED_BY_RESTART};
use genqueue::domain::models::task::{FailureCode, TaskStatus};
use genqueue::domain::repositories::queue_repository::QueueRepository;
use genqueue::domain::repositories::worker_registry::WorkerRegistry;
use genqueue::domain::services::queue_manager::{QueueError, QueueLimits, QueueManager};
use genqueue::infrastructure::repositories::MemoryQueueRepository;
use genqueue::queue::dispatcher::DispatcherConfig;
use genqueue::workers::supervisor::SupervisorConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

#[tokio::test(start_paused = true)]
async fn test_queue_never_exceeds_its_concurrency() {
    let harness = Harness::new();
    let backend = Arc::new(ScriptedBackend::new(Duration::from_secs(1)));
    let supervisor = harness
        .start_supervisor(backend.clone(), None, SupervisorConfig::default())
        .await;

    let tasks = (0..10).map(|i| text_task(&format!("frame {}", i))).collect();
    let queue_id = harness
        .manager
        .create_queue("alice", tasks, Some(3))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    let view = harness.manager.get_status(queue_id).await.unwrap();
    assert_eq!(view.status, QueueStatus::Completed);
    assert_eq!(view.completed_tasks, 10);
    assert_eq!(backend.calls(), 10);
    assert_eq!(backend.peak(), 3);
    assert!(view.tasks.iter().all(|task| task.progress == 100));

    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_partial_failure_completes_and_total_failure_fails() {
    let harness = Harness::new();
    let backend = Arc::new(ScriptedBackend::new(Duration::from_millis(200)));
    let supervisor = harness
        .start_supervisor(backend, None, SupervisorConfig::default())
        .await;

    let mixed = harness
        .manager
        .create_queue(
            "alice",
            vec![text_task("a cat"), text_task("fail please"), text_task("a dog")],
            None,
        )
        .await
        .unwrap();
    let doomed = harness
        .manager
        .create_queue("bob", vec![text_task("fail"), text_task("fail again")], None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let mixed = harness.manager.get_status(mixed).await.unwrap();
    assert_eq!(mixed.status, QueueStatus::Completed);
    assert_eq!(mixed.completed_tasks, 2);
    assert_eq!(mixed.failed_tasks, 1);
    let failed = mixed
        .tasks
        .iter()
        .find(|task| task.status == TaskStatus::Failed)
        .unwrap();
    assert_eq!(failed.error.as_ref().unwrap().code, FailureCode::Execution);

    let doomed = harness.manager.get_status(doomed).await.unwrap();
    assert_eq!(doomed.status, QueueStatus::Failed);
    assert_eq!(doomed.failed_tasks, 2);

    let stats = supervisor.stop().await;
    assert_eq!(stats.crashes, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_discards_pending_and_waits_for_in_flight() {
    let harness = Harness::new();
    let gate = Arc::new(Semaphore::new(0));
    let backend = Arc::new(ScriptedBackend::gated(gate.clone()));
    let supervisor = harness
        .start_supervisor(backend, None, SupervisorConfig::default())
        .await;

    let tasks = (0..5).map(|i| text_task(&format!("shot {}", i))).collect();
    let queue_id = harness
        .manager
        .create_queue("alice", tasks, Some(2))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let view = harness.manager.get_status(queue_id).await.unwrap();
    assert_eq!(view.in_flight_tasks, 2);
    assert_eq!(view.pending_tasks, 3);

    assert!(harness.manager.cancel_queue(queue_id, "alice").await.unwrap());
    let view = harness.manager.get_status(queue_id).await.unwrap();
    assert_eq!(view.pending_tasks, 0);
    assert_eq!(view.cancelled_tasks, 3);
    assert_eq!(view.status, QueueStatus::Processing);

    gate.add_permits(2);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let view = harness.manager.get_status(queue_id).await.unwrap();
    assert_eq!(view.status, QueueStatus::Cancelled);
    assert_eq!(view.completed_tasks, 2);
    assert_eq!(view.in_flight_tasks, 0);
    assert!(harness.manager.cancel_queue(queue_id, "alice").await.unwrap());

    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_fails_interrupted_queue() {
    let harness = Harness::new();
    let queue_id = harness
        .manager
        .create_queue("alice", vec![text_task("one"), text_task("two")], None)
        .await
        .unwrap();
    // 上一个进程已开始执行并在崩溃前取走了一个任务
    harness.manager.begin_processing(queue_id).await.unwrap();
    assert!(harness
        .repo
        .claim_next_task(queue_id, "1-0-gone")
        .await
        .unwrap()
        .is_some());
    // 已提交但上一个进程还没来得及开始执行
    let never_started = harness
        .manager
        .create_queue("bob", vec![text_task("three")], None)
        .await
        .unwrap();

    let backend = Arc::new(ScriptedBackend::new(Duration::from_millis(10)));
    let supervisor = harness
        .start_supervisor(backend.clone(), None, SupervisorConfig::default())
        .await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let view = harness.manager.get_status(queue_id).await.unwrap();
    assert_eq!(view.status, QueueStatus::Failed);
    assert_eq!(view.reason.as_deref(), Some(REASON_INTERRUPTED_BY_RESTART));
    assert_eq!(view.failed_tasks, 2);
    assert!(view
        .tasks
        .iter()
        .all(|task| task.error.as_ref().map(|e| e.code) == Some(FailureCode::InterruptedByRestart)));
    let never_started = harness.manager.get_status(never_started).await.unwrap();
    assert_eq!(never_started.status, QueueStatus::Failed);
    assert_eq!(never_started.failed_tasks, 1);
    assert_eq!(backend.calls(), 0);

    let stats = supervisor.stop().await;
    assert_eq!(stats.reconciled, 2);
}

#[tokio::test(start_paused = true)]
async fn test_unit_recovers_after_bootstrap_failures() {
    let harness = Harness::new();
    let registry: Arc<dyn WorkerRegistry> = Arc::new(FlakyRegistry::new(harness.repo.clone(), 2));
    let backend = Arc::new(ScriptedBackend::new(Duration::from_millis(100)));
    let config = SupervisorConfig {
        max_units: 1,
        ..SupervisorConfig::default()
    };
    let supervisor = harness
        .start_supervisor(backend, Some(registry), config)
        .await;

    let queue_id = harness
        .manager
        .create_queue("alice", vec![text_task("sunrise"), text_task("sunset")], None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    let view = harness.manager.get_status(queue_id).await.unwrap();
    assert_eq!(view.status, QueueStatus::Completed);
    assert_eq!(view.completed_tasks, 2);

    let stats = supervisor.stop().await;
    assert_eq!(stats.crashes, 2);
    assert_eq!(stats.restarts, 2);
    assert_eq!(
        stats.recent_delays,
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_fails_tasks_that_outlive_grace_period() {
    let harness = Harness::new();
    let gate = Arc::new(Semaphore::new(0));
    let backend = Arc::new(ScriptedBackend::gated(gate));
    let supervisor = harness
        .start_supervisor(backend, None, SupervisorConfig::default())
        .await;

    let tasks = (0..3).map(|i| text_task(&format!("scene {}", i))).collect();
    let queue_id = harness
        .manager
        .create_queue("alice", tasks, Some(2))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    supervisor.stop().await;

    let view = harness.manager.get_status(queue_id).await.unwrap();
    assert_eq!(view.status, QueueStatus::Processing);
    assert_eq!(view.failed_tasks, 2);
    assert_eq!(view.pending_tasks, 1);
    assert_eq!(view.in_flight_tasks, 0);
    assert_eq!(
        view.tasks
            .iter()
            .filter(|task| task.error.as_ref().map(|e| e.code) == Some(FailureCode::WorkerShutdown))
            .count(),
        2
    );
    assert!(harness.repo.workers().await.unwrap().is_empty());
    assert_eq!(harness.repo.queue_claimant(queue_id).await.unwrap(), None);
}

#[tokio::test]
async fn test_failed_publish_rolls_back_all_state() {
    let memory = Arc::new(MemoryQueueRepository::default());
    let manager = QueueManager::new(
        Arc::new(FaultyRepository::refusing_publish(memory.clone())),
        QueueLimits::default(),
    );

    let result = manager
        .create_queue("alice", vec![text_task("a boat")], None)
        .await;
    assert!(matches!(result, Err(QueueError::Store(_))));
    assert!(memory.queue_ids().await.unwrap().is_empty());
    assert!(memory.owner_queue_ids("alice").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_outcome_survives_store_outage_longer_than_report_window() {
    let (harness, faulty) = Harness::faulty();
    let backend = Arc::new(ScriptedBackend::new(Duration::from_millis(100)));
    let supervisor = harness
        .start_supervisor_with(
            backend.clone(),
            None,
            SupervisorConfig::default(),
            DispatcherConfig {
                shutdown_report_retry: Duration::from_secs(1),
                ..DispatcherConfig::default()
            },
        )
        .await;

    faulty.set_outcome_outage(true);
    let queue_id = harness
        .manager
        .create_queue("alice", vec![text_task("a lighthouse")], None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(backend.calls(), 1);
    let during = harness.manager.get_status(queue_id).await.unwrap();
    assert_eq!(during.status, QueueStatus::Processing);
    assert_eq!(during.in_flight_tasks, 1);

    faulty.set_outcome_outage(false);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    let view = loop {
        let view = harness.manager.get_status(queue_id).await.unwrap();
        if view.status.is_terminal() || tokio::time::Instant::now() > deadline {
            break view;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    };
    assert_eq!(view.status, QueueStatus::Completed);
    assert_eq!(view.completed_tasks, 1);
    assert_eq!(view.in_flight_tasks, 0);
    assert_eq!(backend.calls(), 1);

    supervisor.stop().await;
}
