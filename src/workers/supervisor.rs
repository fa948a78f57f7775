// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, Id, JoinError, JoinSet};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::models::task::FailureCode;
use crate::domain::models::worker::new_worker_id;
use crate::domain::repositories::queue_repository::{QueueRepository, StoreError};
use crate::domain::repositories::worker_registry::WorkerRegistry;
use crate::domain::services::queue_manager::{QueueError, QueueManager};
use crate::queue::dispatcher::TaskDispatcher;
use crate::utils::errors::WorkerError;
use crate::utils::retry_policy::{store_backoff, RestartPolicy, RestartTracker};
use crate::workers::worker_unit::{UnitShared, WorkerUnit, WorkerUnitConfig};

/// 保留的最近重启延迟个数
const RECENT_DELAYS: usize = 16;

/// 监管器配置
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// 最多同时运行的工作单元数
    pub max_units: usize,
    /// 轮询发现新队列的间隔
    pub poll_interval: Duration,
    /// 心跳间隔，同时是健康检查间隔
    pub heartbeat_interval: Duration,
    /// 超过该时间未心跳视为崩溃
    pub heartbeat_timeout: Duration,
    /// 关闭时等待工作单元退出的最长时间
    pub stop_timeout: Duration,
    /// 启动对账的最长重试时间
    pub reconcile_retry: Duration,
    pub restart: RestartPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_units: 5,
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(40),
            reconcile_retry: Duration::from_secs(60),
            restart: RestartPolicy::default(),
        }
    }
}

/// 监管器统计
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SupervisorStats {
    /// 本进程工作单元崩溃次数
    pub crashes: u64,
    /// 重启次数
    pub restarts: u64,
    /// 清理的其他进程失联工作单元数
    pub reaped: u64,
    /// 启动对账标记失败的队列数
    pub reconciled: u64,
    /// 最近的重启延迟
    pub recent_delays: Vec<Duration>,
}

struct RunningUnit {
    shared: Arc<UnitShared>,
    sender: mpsc::Sender<Uuid>,
    token: CancellationToken,
    abort: AbortHandle,
    spawned_at: Instant,
}

struct Slot {
    unit: Option<RunningUnit>,
    tracker: RestartTracker,
    restart_at: Option<Instant>,
}

impl Slot {
    fn load(&self) -> usize {
        self.unit
            .as_ref()
            .map(|unit| unit.shared.active_queues().len())
            .unwrap_or(0)
    }
}

/// 工作单元监管器
///
/// 负责启动对账、发现待处理队列并分配给工作单元、
/// 检测崩溃与心跳超时、按退避策略重启，以及清理其他进程的失联工作单元。
pub struct WorkerSupervisor {
    manager: Arc<QueueManager>,
    dispatcher: TaskDispatcher,
    registry: Arc<dyn WorkerRegistry>,
    config: SupervisorConfig,
    slots: Vec<Slot>,
    units: JoinSet<Result<(), WorkerError>>,
    unit_slots: HashMap<Id, usize>,
    /// 队列 → (槽位, 分配时间)
    assignments: HashMap<Uuid, (usize, Instant)>,
    stats: Arc<Mutex<SupervisorStats>>,
}

impl WorkerSupervisor {
    /// 创建新的监管器
    ///
    /// # 参数
    ///
    /// * `manager` - 队列管理服务
    /// * `dispatcher` - 任务调度器
    /// * `registry` - 工作单元注册表
    /// * `config` - 监管器配置
    pub fn new(
        manager: Arc<QueueManager>,
        dispatcher: TaskDispatcher,
        registry: Arc<dyn WorkerRegistry>,
        config: SupervisorConfig,
    ) -> Self {
        let slots = (0..config.max_units.max(1))
            .map(|_| Slot {
                unit: None,
                tracker: RestartTracker::new(config.restart.clone()),
                restart_at: None,
            })
            .collect();
        Self {
            manager,
            dispatcher,
            registry,
            config,
            slots,
            units: JoinSet::new(),
            unit_slots: HashMap::new(),
            assignments: HashMap::new(),
            stats: Arc::new(Mutex::new(SupervisorStats::default())),
        }
    }

    /// 统计信息句柄，可在 `run` 期间读取
    pub fn stats(&self) -> Arc<Mutex<SupervisorStats>> {
        self.stats.clone()
    }

    fn repository(&self) -> &Arc<dyn QueueRepository> {
        self.manager.repository()
    }

    /// 运行监管循环直到收到关闭信号
    ///
    /// # 返回值
    ///
    /// * `Ok(SupervisorStats)` - 正常关闭后的统计
    /// * `Err(WorkerError)` - 启动对账在重试后仍失败
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<SupervisorStats, WorkerError> {
        self.reconcile().await?;

        let mut created = match self.repository().watch_created().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!("Queue notifications unavailable, relying on polling: {}", e);
                None
            }
        };

        let mut poll = interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health = interval(self.config.heartbeat_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(max_units = self.slots.len(), "Supervisor started");
        loop {
            let next_restart = self.next_restart_at();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = self.units.join_next_with_id() => self.on_unit_exit(joined).await,
                _ = poll.tick() => self.discover().await,
                event = next_created(&mut created) => match event {
                    Some(queue_id) => {
                        debug!(queue_id = %queue_id, "Queue creation notified");
                        self.discover().await;
                    }
                    None => {
                        warn!("Queue notification stream closed, relying on polling");
                        created = None;
                    }
                },
                _ = health.tick() => {
                    self.check_heartbeats().await;
                    self.reap_stale_workers().await;
                }
                _ = sleep_until(next_restart.unwrap_or_else(Instant::now)), if next_restart.is_some() => {
                    self.restart_due_slots();
                    self.discover().await;
                }
            }
        }

        self.shutdown_units().await;
        let stats = self.stats.lock().clone();
        info!(
            crashes = stats.crashes,
            restarts = stats.restarts,
            reaped = stats.reaped,
            "Supervisor stopped"
        );
        Ok(stats)
    }

    /// 启动对账，存储不可用时按退避重试
    async fn reconcile(&mut self) -> Result<(), WorkerError> {
        let manager = &self.manager;
        let registry = &self.registry;
        let timeout = self.config.heartbeat_timeout;
        let operation = move || async move {
            reconcile_once(manager, registry.as_ref(), timeout)
                .await
                .map_err(|e| match e {
                    QueueError::Store(StoreError::Unavailable(_)) => {
                        warn!("Reconciliation failed, retrying: {}", e);
                        backoff::Error::transient(e)
                    }
                    other => backoff::Error::permanent(other),
                })
        };

        let reconciled =
            backoff::future::retry(store_backoff(self.config.reconcile_retry), operation).await?;
        if !reconciled.is_empty() {
            warn!(count = reconciled.len(), "Interrupted queues marked failed");
        }
        self.stats.lock().reconciled += reconciled.len() as u64;
        Ok(())
    }

    /// 发现尚未被调度的活跃队列并分配给工作单元
    async fn discover(&mut self) {
        let queue_ids = match self.manager.active_queue_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Failed to list active queues: {}", e);
                return;
            }
        };

        let active: HashSet<Uuid> = queue_ids.iter().copied().collect();
        self.assignments.retain(|queue_id, _| active.contains(queue_id));

        for queue_id in queue_ids {
            if self.is_covered(queue_id) {
                continue;
            }
            match self.repository().queue_claimant(queue_id).await {
                Ok(Some(claimant)) => {
                    debug!(queue_id = %queue_id, claimant = %claimant, "Queue already claimed");
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(queue_id = %queue_id, "Failed to read queue claim: {}", e);
                    continue;
                }
            }

            let Some(slot) = self.pick_slot() else {
                debug!("No worker unit available for new queues");
                break;
            };
            self.assign(slot, queue_id);
        }
    }

    /// 队列是否已由本进程的工作单元负责
    fn is_covered(&self, queue_id: Uuid) -> bool {
        let running = self.slots.iter().any(|slot| {
            slot.unit
                .as_ref()
                .is_some_and(|unit| unit.shared.is_running_queue(queue_id))
        });
        if running {
            return true;
        }
        self.assignments
            .get(&queue_id)
            .is_some_and(|(slot, assigned_at)| {
                self.slots[*slot].unit.is_some()
                    && assigned_at.elapsed() < self.config.heartbeat_interval
            })
    }

    /// 选择槽位：优先空闲单元，其次启动新单元，最后选负载最小的单元
    fn pick_slot(&self) -> Option<usize> {
        let pending = |index: usize| {
            self.assignments
                .values()
                .filter(|(slot, assigned_at)| {
                    *slot == index && assigned_at.elapsed() < self.config.heartbeat_interval
                })
                .count()
        };

        let idle = self.slots.iter().enumerate().find(|(index, slot)| {
            slot.unit.is_some() && slot.load() == 0 && pending(*index) == 0
        });
        if let Some((index, _)) = idle {
            return Some(index);
        }

        let vacant = self
            .slots
            .iter()
            .position(|slot| slot.unit.is_none() && slot.restart_at.is_none());
        if vacant.is_some() {
            return vacant;
        }

        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.unit.is_some())
            .min_by_key(|(index, slot)| slot.load() + pending(*index))
            .map(|(index, _)| index)
    }

    fn assign(&mut self, index: usize, queue_id: Uuid) {
        if self.slots[index].unit.is_none() {
            self.spawn_unit(index);
        }
        let Some(unit) = self.slots[index].unit.as_ref() else {
            return;
        };
        match unit.sender.try_send(queue_id) {
            Ok(()) => {
                debug!(queue_id = %queue_id, worker_id = %unit.shared.id(), "Queue assigned");
                self.assignments.insert(queue_id, (index, Instant::now()));
            }
            Err(e) => warn!(queue_id = %queue_id, "Failed to assign queue: {}", e),
        }
    }

    fn spawn_unit(&mut self, index: usize) {
        let worker_id = new_worker_id(index);
        let (sender, receiver) = mpsc::channel(64);
        let token = CancellationToken::new();
        let shared = Arc::new(UnitShared::new(worker_id.clone()));

        let unit = WorkerUnit::new(
            shared.clone(),
            self.dispatcher.clone(),
            self.repository().clone(),
            self.registry.clone(),
            receiver,
            WorkerUnitConfig {
                heartbeat_interval: self.config.heartbeat_interval,
                claim_ttl: self.config.heartbeat_timeout,
            },
        );
        let abort = self.units.spawn(unit.run(token.clone()));
        self.unit_slots.insert(abort.id(), index);

        let slot = &mut self.slots[index];
        slot.restart_at = None;
        slot.unit = Some(RunningUnit {
            shared,
            sender,
            token,
            abort,
            spawned_at: Instant::now(),
        });
        self.update_unit_gauge();
        info!(worker_id = %worker_id, slot = index, "Worker unit spawned");
    }

    async fn on_unit_exit(&mut self, joined: Result<(Id, Result<(), WorkerError>), JoinError>) {
        let (id, reason) = match joined {
            Ok((id, Ok(()))) => (id, "exited unexpectedly".to_string()),
            Ok((id, Err(e))) => (id, e.to_string()),
            Err(e) if e.is_panic() => (e.id(), "panicked".to_string()),
            Err(e) => (e.id(), "aborted".to_string()),
        };
        // 已因心跳超时处理过的单元不再重复处理
        let Some(index) = self.unit_slots.remove(&id) else {
            return;
        };
        self.handle_crash(index, &reason).await;
    }

    /// 检查心跳超时的工作单元
    async fn check_heartbeats(&mut self) {
        let timeout = self.config.heartbeat_timeout;
        let stalled: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| {
                slot.unit
                    .as_ref()
                    .is_some_and(|unit| unit.shared.last_heartbeat().elapsed() > timeout)
            })
            .map(|(index, _)| index)
            .collect();

        for index in stalled {
            if let Some(unit) = self.slots[index].unit.as_ref() {
                unit.token.cancel();
                unit.abort.abort();
                self.unit_slots.remove(&unit.abort.id());
            }
            self.handle_crash(index, "missed heartbeat").await;
        }
    }

    /// 处理工作单元崩溃：失败其执行中任务、释放所有权并安排重启
    async fn handle_crash(&mut self, index: usize, reason: &str) {
        let Some(unit) = self.slots[index].unit.take() else {
            return;
        };
        unit.shared.mark_crashed();
        let worker_id = unit.shared.id().to_string();

        let mut queues: HashSet<Uuid> = unit.shared.active_queues().into_iter().collect();
        queues.extend(
            self.assignments
                .iter()
                .filter(|(_, (slot, _))| *slot == index)
                .map(|(queue_id, _)| *queue_id),
        );
        self.assignments.retain(|_, (slot, _)| *slot != index);

        for queue_id in queues {
            if let Err(e) = self
                .manager
                .fail_orphaned_tasks(queue_id, &worker_id, FailureCode::WorkerCrash, "worker unit crashed")
                .await
            {
                warn!(queue_id = %queue_id, "Failed to fail orphaned tasks: {}", e);
            }
            if let Err(e) = self.repository().release_queue(queue_id, &worker_id).await {
                warn!(queue_id = %queue_id, "Failed to release queue claim: {}", e);
            }
        }
        if let Err(e) = self.registry.deregister(&worker_id).await {
            warn!(worker_id = %worker_id, "Failed to deregister crashed worker: {}", e);
        }

        let now = Instant::now();
        let slot = &mut self.slots[index];
        slot.tracker.record_stable(now.duration_since(unit.spawned_at));
        let delay = slot.tracker.record_failure(now);
        slot.restart_at = Some(now + delay);

        {
            let mut stats = self.stats.lock();
            stats.crashes += 1;
            stats.recent_delays.push(delay);
            if stats.recent_delays.len() > RECENT_DELAYS {
                stats.recent_delays.remove(0);
            }
        }
        self.update_unit_gauge();
        error!(
            worker_id = %worker_id,
            slot = index,
            reason = %reason,
            delay_ms = delay.as_millis() as u64,
            "Worker unit crashed, restart scheduled"
        );
    }

    fn next_restart_at(&self) -> Option<Instant> {
        self.slots.iter().filter_map(|slot| slot.restart_at).min()
    }

    fn restart_due_slots(&mut self) {
        let now = Instant::now();
        let due: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.unit.is_none() && slot.restart_at.is_some_and(|at| at <= now))
            .map(|(index, _)| index)
            .collect();

        for index in due {
            self.spawn_unit(index);
            self.stats.lock().restarts += 1;
            counter!("genqueue_worker_restarts_total").increment(1);
            info!(slot = index, "Worker unit restarted");
        }
    }

    /// 清理其他进程中心跳过期的工作单元
    async fn reap_stale_workers(&mut self) {
        let records = match self.registry.workers().await {
            Ok(records) => records,
            Err(e) => {
                warn!("Failed to list worker records: {}", e);
                return;
            }
        };
        let ours: HashSet<String> = self
            .slots
            .iter()
            .filter_map(|slot| slot.unit.as_ref())
            .map(|unit| unit.shared.id().to_string())
            .collect();

        let now = Utc::now();
        for record in records {
            if ours.contains(&record.id) || !record.is_stale(now, self.config.heartbeat_timeout) {
                continue;
            }
            for queue_id in &record.assigned_queue_ids {
                if let Err(e) = self
                    .manager
                    .fail_orphaned_tasks(
                        *queue_id,
                        &record.id,
                        FailureCode::WorkerCrash,
                        "worker heartbeat expired",
                    )
                    .await
                {
                    warn!(queue_id = %queue_id, "Failed to fail orphaned tasks: {}", e);
                }
                if let Err(e) = self.repository().release_queue(*queue_id, &record.id).await {
                    warn!(queue_id = %queue_id, "Failed to release stale claim: {}", e);
                }
            }
            if let Err(e) = self.registry.deregister(&record.id).await {
                warn!(worker_id = %record.id, "Failed to deregister stale worker: {}", e);
                continue;
            }
            self.stats.lock().reaped += 1;
            warn!(
                worker_id = %record.id,
                pid = record.pid,
                queues = record.assigned_queue_ids.len(),
                "Stale worker reaped"
            );
        }
    }

    /// 通知全部工作单元停止，超时后强制中止
    async fn shutdown_units(&mut self) {
        for unit in self.slots.iter().filter_map(|slot| slot.unit.as_ref()) {
            unit.token.cancel();
        }
        info!(units = self.units.len(), "Stopping worker units");

        let deadline = tokio::time::sleep(self.config.stop_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                joined = self.units.join_next_with_id() => match joined {
                    Some(joined) => self.on_unit_stopped(joined),
                    None => break,
                },
            }
        }

        if !self.units.is_empty() {
            warn!(units = self.units.len(), "Worker units did not stop in time, aborting");
            self.units.abort_all();
            while let Some(joined) = self.units.join_next_with_id().await {
                let id = match &joined {
                    Ok((id, _)) => *id,
                    Err(e) => e.id(),
                };
                let Some(index) = self.unit_slots.remove(&id) else {
                    continue;
                };
                let Some(unit) = self.slots[index].unit.take() else {
                    continue;
                };
                let worker_id = unit.shared.id().to_string();
                for queue_id in unit.shared.active_queues() {
                    if let Err(e) = self
                        .manager
                        .fail_orphaned_tasks(
                            queue_id,
                            &worker_id,
                            FailureCode::WorkerShutdown,
                            "worker stopped during shutdown",
                        )
                        .await
                    {
                        warn!(queue_id = %queue_id, "Failed to fail orphaned tasks: {}", e);
                    }
                    if let Err(e) = self.repository().release_queue(queue_id, &worker_id).await {
                        warn!(queue_id = %queue_id, worker_id = %worker_id, "Failed to release queue claim: {}", e);
                    }
                }
                if let Err(e) = self.registry.deregister(&worker_id).await {
                    warn!(worker_id = %worker_id, "Failed to deregister aborted worker unit: {}", e);
                }
            }
        }
        self.update_unit_gauge();
    }

    fn on_unit_stopped(&mut self, joined: Result<(Id, Result<(), WorkerError>), JoinError>) {
        let id = match &joined {
            Ok((id, result)) => {
                if let Err(e) = result {
                    warn!("Worker unit stopped with error: {}", e);
                }
                *id
            }
            Err(e) => e.id(),
        };
        if let Some(index) = self.unit_slots.remove(&id) {
            self.slots[index].unit = None;
        }
    }

    fn update_unit_gauge(&self) {
        let running = self.slots.iter().filter(|slot| slot.unit.is_some()).count();
        gauge!("genqueue_worker_units").set(running as f64);
    }
}

/// 读取存活工作单元并执行一次对账
async fn reconcile_once(
    manager: &QueueManager,
    registry: &dyn WorkerRegistry,
    heartbeat_timeout: Duration,
) -> Result<Vec<Uuid>, QueueError> {
    let now = Utc::now();
    let live: HashSet<String> = registry
        .workers()
        .await?
        .into_iter()
        .filter(|record| !record.is_stale(now, heartbeat_timeout))
        .map(|record| record.id)
        .collect();
    manager.reconcile_interrupted(&live).await
}

async fn next_created(stream: &mut Option<BoxStream<'static, Uuid>>) -> Option<Uuid> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
