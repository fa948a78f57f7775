// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use once_cell::sync::Lazy;
use redis::{AsyncCommands, Script};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::domain::models::progress::TaskProgress;
use crate::domain::models::queue::{
    Occupancy, OutcomeReceipt, Queue, QueueSnapshot, QueueStatus, TaskRecord,
};
use crate::domain::models::task::{Task, TaskOutcome, TaskStatus};
use crate::domain::models::worker::WorkerRecord;
use crate::domain::repositories::queue_repository::{QueueRepository, StoreError};
use crate::domain::repositories::worker_registry::WorkerRegistry;
use crate::infrastructure::cache::keys::KeySpace;
use crate::infrastructure::cache::redis_client::RedisClient;

/// 取出下一个待处理任务
///
/// KEYS: queue, pending, in_flight, tasks  ARGV: worker_id, ttl
///
/// 进行中哈希随认领创建，与其余队列键使用相同的保留期。
const CLAIM_NEXT_TASK_LUA: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then return false end
if status ~= 'waiting' and status ~= 'processing' then return false end
if redis.call('HGET', KEYS[1], 'cancel_requested') == '1' then return false end
while true do
  local task_id = redis.call('LPOP', KEYS[2])
  if not task_id then return false end
  local task = redis.call('HGET', KEYS[4], task_id)
  if task then
    redis.call('HSET', KEYS[3], task_id, ARGV[1])
    redis.call('EXPIRE', KEYS[3], ARGV[2])
    return task
  end
end
"#;

static CLAIM_NEXT_TASK: Lazy<Script> = Lazy::new(|| Script::new(CLAIM_NEXT_TASK_LUA));

/// 幂等记录任务结果
///
/// KEYS: queue, in_flight, completed, failed, cancelled, results, pending, tasks
/// ARGV: task_id, completed|failed, outcome_json, ttl
static RECORD_OUTCOME: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return {-1, 0, 0} end
local task_id = ARGV[1]
local applied = 0
if redis.call('HEXISTS', KEYS[8], task_id) == 1
  and redis.call('SISMEMBER', KEYS[3], task_id) == 0
  and redis.call('SISMEMBER', KEYS[4], task_id) == 0
  and redis.call('SISMEMBER', KEYS[5], task_id) == 0 then
  redis.call('HDEL', KEYS[2], task_id)
  redis.call('LREM', KEYS[7], 0, task_id)
  if ARGV[2] == 'completed' then
    redis.call('SADD', KEYS[3], task_id)
    redis.call('HINCRBY', KEYS[1], 'completed_count', 1)
  else
    redis.call('SADD', KEYS[4], task_id)
    redis.call('HINCRBY', KEYS[1], 'failed_count', 1)
  end
  redis.call('HSET', KEYS[6], task_id, ARGV[3])
  for i = 1, #KEYS do redis.call('EXPIRE', KEYS[i], ARGV[4]) end
  applied = 1
end
local completed = tonumber(redis.call('HGET', KEYS[1], 'completed_count') or '0')
local failed = tonumber(redis.call('HGET', KEYS[1], 'failed_count') or '0')
return {applied, completed, failed}
"#,
    )
});

/// 状态比较交换
///
/// KEYS: 全部队列键（元数据在首位）
/// ARGV: to, reason, completed_at, ttl, allowed_from...
static TRANSITION: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local current = redis.call('HGET', KEYS[1], 'status')
if not current then return 0 end
local allowed = false
for i = 5, #ARGV do
  if ARGV[i] == current then allowed = true end
end
if not allowed then return 0 end
redis.call('HSET', KEYS[1], 'status', ARGV[1])
if ARGV[2] ~= '' then redis.call('HSET', KEYS[1], 'reason', ARGV[2]) end
if ARGV[3] ~= '' then redis.call('HSET', KEYS[1], 'completed_at', ARGV[3]) end
for i = 1, #KEYS do redis.call('EXPIRE', KEYS[i], ARGV[4]) end
return 1
"#,
    )
});

/// 请求取消并丢弃待处理任务
///
/// KEYS: queue, pending, cancelled  ARGV: ttl
static REQUEST_CANCEL: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status or status == 'completed' or status == 'failed' or status == 'cancelled' then
  return -1
end
redis.call('HSET', KEYS[1], 'cancel_requested', '1')
local ids = redis.call('LRANGE', KEYS[2], 0, -1)
if #ids > 0 then redis.call('SADD', KEYS[3], unpack(ids)) end
redis.call('DEL', KEYS[2])
redis.call('EXPIRE', KEYS[1], ARGV[1])
redis.call('EXPIRE', KEYS[3], ARGV[1])
return #ids
"#,
    )
});

/// 将剩余任务全部记为失败
///
/// KEYS: queue, pending, in_flight, failed, results  ARGV: outcome_json, ttl
static ABANDON_REMAINING: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local ids = redis.call('LRANGE', KEYS[2], 0, -1)
local flying = redis.call('HKEYS', KEYS[3])
for _, id in ipairs(flying) do table.insert(ids, id) end
for _, id in ipairs(ids) do
  redis.call('SADD', KEYS[4], id)
  redis.call('HSET', KEYS[5], id, ARGV[1])
end
redis.call('DEL', KEYS[2], KEYS[3])
if #ids > 0 then redis.call('HINCRBY', KEYS[1], 'failed_count', #ids) end
for i = 1, #KEYS do redis.call('EXPIRE', KEYS[i], ARGV[2]) end
return #ids
"#,
    )
});

/// 获取或续期调度所有权
///
/// KEYS: claim  ARGV: worker_id, ttl_ms
static CLAIM_QUEUE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local owner = redis.call('GET', KEYS[1])
if not owner then
  redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
  return 1
end
if owner == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return 1
end
return 0
"#,
    )
});

/// 仅由持有者释放调度所有权
static RELEASE_QUEUE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#,
    )
});

/// Redis 队列仓库
///
/// 队列元数据存放在哈希中，任务状态由列表、哈希和集合的成员关系推导。
/// 计数与状态变更全部在单个 Lua 脚本或 MULTI 事务中完成。
#[derive(Clone)]
pub struct RedisQueueRepository {
    redis: RedisClient,
    keys: KeySpace,
    retention: Duration,
}

impl RedisQueueRepository {
    /// 创建新的Redis队列仓库
    ///
    /// # 参数
    ///
    /// * `redis` - Redis客户端
    /// * `namespace` - 键前缀
    /// * `retention` - 队列键的保留期
    pub fn new(redis: RedisClient, namespace: impl Into<String>, retention: Duration) -> Self {
        Self {
            redis,
            keys: KeySpace::new(namespace),
            retention,
        }
    }

    fn ttl(&self) -> i64 {
        self.retention.as_secs().max(1) as i64
    }

    /// 过滤掉元数据已过期的索引成员，并从索引中移除
    async fn prune_index(&self, index_key: &str, ids: Vec<String>) -> Result<Vec<Uuid>, StoreError> {
        let mut parsed = Vec::with_capacity(ids.len());
        let mut stale = Vec::new();
        for id in ids {
            match Uuid::parse_str(&id) {
                Ok(queue_id) => parsed.push(queue_id),
                Err(_) => stale.push(id),
            }
        }

        let mut con = self.redis.connection();
        let mut live = Vec::with_capacity(parsed.len());
        if !parsed.is_empty() {
            let mut pipe = redis::pipe();
            for queue_id in &parsed {
                pipe.exists(self.keys.queue(*queue_id));
            }
            let exists: Vec<bool> = pipe.query_async(&mut con).await?;
            for (queue_id, present) in parsed.into_iter().zip(exists) {
                if present {
                    live.push(queue_id);
                } else {
                    stale.push(queue_id.to_string());
                }
            }
        }

        if !stale.is_empty() {
            let _: () = con.srem(index_key, stale).await?;
        }
        Ok(live)
    }
}

/// 将队列元数据编码为哈希字段
pub(crate) fn queue_fields(queue: &Queue) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("owner_id", queue.owner_id.clone()),
        ("concurrency", queue.concurrency.to_string()),
        ("total_tasks", queue.total_tasks.to_string()),
        ("completed_count", queue.completed_count.to_string()),
        ("failed_count", queue.failed_count.to_string()),
        ("status", queue.status.to_string()),
        (
            "cancel_requested",
            if queue.cancel_requested { "1" } else { "0" }.to_string(),
        ),
        ("created_at", queue.created_at.to_rfc3339()),
    ];
    if let Some(reason) = &queue.reason {
        fields.push(("reason", reason.clone()));
    }
    if let Some(completed_at) = queue.completed_at {
        fields.push(("completed_at", completed_at.to_rfc3339()));
    }
    fields
}

/// 从哈希字段解析队列元数据
pub(crate) fn parse_queue(
    queue_id: Uuid,
    fields: &HashMap<String, String>,
) -> Result<Queue, StoreError> {
    fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str, StoreError> {
        fields
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| StoreError::Corrupt(format!("queue field '{}' is missing", name)))
    }

    fn number<T: std::str::FromStr>(
        fields: &HashMap<String, String>,
        name: &str,
    ) -> Result<T, StoreError> {
        field(fields, name)?
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("queue field '{}' is not a number", name)))
    }

    fn timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StoreError::Corrupt(format!("invalid timestamp '{}': {}", value, e)))
    }

    let status = field(fields, "status")?;
    Ok(Queue {
        id: queue_id,
        owner_id: field(fields, "owner_id")?.to_string(),
        concurrency: number(fields, "concurrency")?,
        total_tasks: number(fields, "total_tasks")?,
        completed_count: number(fields, "completed_count")?,
        failed_count: number(fields, "failed_count")?,
        status: status
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("unknown queue status '{}'", status)))?,
        cancel_requested: fields.get("cancel_requested").map(String::as_str) == Some("1"),
        reason: fields.get("reason").filter(|r| !r.is_empty()).cloned(),
        created_at: timestamp(field(fields, "created_at")?)?,
        completed_at: match fields.get("completed_at").filter(|v| !v.is_empty()) {
            Some(value) => Some(timestamp(value)?),
            None => None,
        },
    })
}

#[async_trait]
impl QueueRepository for RedisQueueRepository {
    async fn create(&self, queue: &Queue, tasks: &[Task]) -> Result<(), StoreError> {
        let mut ordered: Vec<&Task> = tasks.iter().collect();
        ordered.sort_by_key(|task| task.position);

        let mut encoded = Vec::with_capacity(tasks.len());
        for task in &ordered {
            encoded.push((task.id.to_string(), serde_json::to_string(task)?));
        }
        let pending: Vec<String> = ordered.iter().map(|task| task.id.to_string()).collect();

        let ttl = self.ttl();
        let meta_key = self.keys.queue(queue.id);
        let tasks_key = self.keys.tasks(queue.id);
        let pending_key = self.keys.pending(queue.id);
        let owner_key = self.keys.owner(&queue.owner_id);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(&meta_key, &queue_fields(queue))
            .ignore()
            .expire(&meta_key, ttl)
            .ignore()
            .sadd(self.keys.index(), queue.id.to_string())
            .ignore()
            .sadd(&owner_key, queue.id.to_string())
            .ignore()
            .expire(&owner_key, ttl)
            .ignore();
        if !encoded.is_empty() {
            pipe.hset_multiple(&tasks_key, &encoded)
                .ignore()
                .expire(&tasks_key, ttl)
                .ignore()
                .rpush(&pending_key, pending)
                .ignore()
                .expire(&pending_key, ttl)
                .ignore();
        }

        let mut con = self.redis.connection();
        let _: () = pipe.query_async(&mut con).await?;
        Ok(())
    }

    async fn delete(&self, queue_id: Uuid) -> Result<(), StoreError> {
        let mut con = self.redis.connection();
        let owner: Option<String> = con.hget(self.keys.queue(queue_id), "owner_id").await?;

        let mut keys = self.keys.queue_keys(queue_id);
        keys.push(self.keys.claim(queue_id));

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(keys)
            .ignore()
            .srem(self.keys.index(), queue_id.to_string())
            .ignore();
        if let Some(owner) = owner {
            pipe.srem(self.keys.owner(&owner), queue_id.to_string())
                .ignore();
        }
        let _: () = pipe.query_async(&mut con).await?;
        Ok(())
    }

    async fn find(&self, queue_id: Uuid) -> Result<Option<Queue>, StoreError> {
        let mut con = self.redis.connection();
        let fields: HashMap<String, String> = con.hgetall(self.keys.queue(queue_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_queue(queue_id, &fields).map(Some)
    }

    async fn snapshot(&self, queue_id: Uuid) -> Result<Option<QueueSnapshot>, StoreError> {
        let mut con = self.redis.connection();
        #[allow(clippy::type_complexity)]
        let (meta, tasks, pending, in_flight, completed, failed, cancelled, results, progress): (
            HashMap<String, String>,
            HashMap<String, String>,
            Vec<String>,
            HashMap<String, String>,
            HashSet<String>,
            HashSet<String>,
            HashSet<String>,
            HashMap<String, String>,
            HashMap<String, String>,
        ) = redis::pipe()
            .hgetall(self.keys.queue(queue_id))
            .hgetall(self.keys.tasks(queue_id))
            .lrange(self.keys.pending(queue_id), 0, -1)
            .hgetall(self.keys.in_flight(queue_id))
            .smembers(self.keys.completed(queue_id))
            .smembers(self.keys.failed(queue_id))
            .smembers(self.keys.cancelled(queue_id))
            .hgetall(self.keys.results(queue_id))
            .hgetall(self.keys.progress(queue_id))
            .query_async(&mut con)
            .await?;

        if meta.is_empty() {
            return Ok(None);
        }
        let queue = parse_queue(queue_id, &meta)?;
        let pending: HashSet<String> = pending.into_iter().collect();

        let mut records = Vec::with_capacity(tasks.len());
        for (task_id, raw) in &tasks {
            let task: Task = serde_json::from_str(raw)?;
            let status = if completed.contains(task_id) {
                TaskStatus::Completed
            } else if failed.contains(task_id) {
                TaskStatus::Failed
            } else if cancelled.contains(task_id) {
                TaskStatus::Cancelled
            } else if in_flight.contains_key(task_id) {
                TaskStatus::Processing
            } else {
                if !pending.contains(task_id) {
                    warn!(queue_id = %queue_id, task_id = %task_id, "Task is in no state set, reporting as pending");
                }
                TaskStatus::Pending
            };
            let outcome = match results.get(task_id) {
                Some(raw) => Some(serde_json::from_str::<TaskOutcome>(raw)?),
                None => None,
            };
            let progress = match progress.get(task_id) {
                Some(raw) => Some(serde_json::from_str::<TaskProgress>(raw)?),
                None => None,
            };
            records.push(TaskRecord {
                task,
                status,
                outcome,
                progress,
            });
        }
        records.sort_by_key(|record| record.task.position);

        Ok(Some(QueueSnapshot {
            queue,
            tasks: records,
        }))
    }

    async fn queue_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut con = self.redis.connection();
        let index = self.keys.index();
        let ids: Vec<String> = con.smembers(&index).await?;
        self.prune_index(&index, ids).await
    }

    async fn owner_queue_ids(&self, owner_id: &str) -> Result<Vec<Uuid>, StoreError> {
        let mut con = self.redis.connection();
        let owner_key = self.keys.owner(owner_id);
        let ids: Vec<String> = con.smembers(&owner_key).await?;
        self.prune_index(&owner_key, ids).await
    }

    async fn transition(
        &self,
        queue_id: Uuid,
        from: &[QueueStatus],
        to: QueueStatus,
        reason: Option<&str>,
    ) -> Result<bool, StoreError> {
        let completed_at = if to.is_terminal() {
            Utc::now().to_rfc3339()
        } else {
            String::new()
        };

        let mut invocation = TRANSITION.prepare_invoke();
        for key in self.keys.queue_keys(queue_id) {
            invocation.key(key);
        }
        invocation
            .arg(to.as_str())
            .arg(reason.unwrap_or(""))
            .arg(completed_at)
            .arg(self.ttl());
        for status in from {
            invocation.arg(status.as_str());
        }

        let mut con = self.redis.connection();
        let applied: i64 = invocation.invoke_async(&mut con).await?;
        Ok(applied == 1)
    }

    async fn request_cancel(&self, queue_id: Uuid) -> Result<Option<u64>, StoreError> {
        let mut con = self.redis.connection();
        let discarded: i64 = REQUEST_CANCEL
            .key(self.keys.queue(queue_id))
            .key(self.keys.pending(queue_id))
            .key(self.keys.cancelled(queue_id))
            .arg(self.ttl())
            .invoke_async(&mut con)
            .await?;
        Ok((discarded >= 0).then_some(discarded as u64))
    }

    async fn claim_next_task(
        &self,
        queue_id: Uuid,
        worker_id: &str,
    ) -> Result<Option<Task>, StoreError> {
        let mut con = self.redis.connection();
        let raw: Option<String> = CLAIM_NEXT_TASK
            .key(self.keys.queue(queue_id))
            .key(self.keys.pending(queue_id))
            .key(self.keys.in_flight(queue_id))
            .key(self.keys.tasks(queue_id))
            .arg(worker_id)
            .arg(self.ttl())
            .invoke_async(&mut con)
            .await?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn record_outcome(
        &self,
        queue_id: Uuid,
        task_id: Uuid,
        outcome: &TaskOutcome,
    ) -> Result<OutcomeReceipt, StoreError> {
        let kind = if outcome.is_success() {
            "completed"
        } else {
            "failed"
        };
        let encoded = serde_json::to_string(outcome)?;

        let mut con = self.redis.connection();
        let reply: Vec<i64> = RECORD_OUTCOME
            .key(self.keys.queue(queue_id))
            .key(self.keys.in_flight(queue_id))
            .key(self.keys.completed(queue_id))
            .key(self.keys.failed(queue_id))
            .key(self.keys.cancelled(queue_id))
            .key(self.keys.results(queue_id))
            .key(self.keys.pending(queue_id))
            .key(self.keys.tasks(queue_id))
            .arg(task_id.to_string())
            .arg(kind)
            .arg(encoded)
            .arg(self.ttl())
            .invoke_async(&mut con)
            .await?;

        match reply.as_slice() {
            [-1, ..] => Err(StoreError::Corrupt(format!("queue {} is missing", queue_id))),
            [applied, completed, failed] => Ok(OutcomeReceipt {
                applied: *applied == 1,
                completed_count: (*completed).max(0) as u64,
                failed_count: (*failed).max(0) as u64,
            }),
            other => Err(StoreError::Corrupt(format!(
                "unexpected record-outcome reply {:?}",
                other
            ))),
        }
    }

    async fn abandon_remaining(
        &self,
        queue_id: Uuid,
        outcome: &TaskOutcome,
    ) -> Result<u64, StoreError> {
        let encoded = serde_json::to_string(outcome)?;
        let mut con = self.redis.connection();
        let abandoned: i64 = ABANDON_REMAINING
            .key(self.keys.queue(queue_id))
            .key(self.keys.pending(queue_id))
            .key(self.keys.in_flight(queue_id))
            .key(self.keys.failed(queue_id))
            .key(self.keys.results(queue_id))
            .arg(encoded)
            .arg(self.ttl())
            .invoke_async(&mut con)
            .await?;
        Ok(abandoned.max(0) as u64)
    }

    async fn occupancy(&self, queue_id: Uuid) -> Result<Occupancy, StoreError> {
        let mut con = self.redis.connection();
        let (pending, in_flight): (u64, u64) = redis::pipe()
            .llen(self.keys.pending(queue_id))
            .hlen(self.keys.in_flight(queue_id))
            .query_async(&mut con)
            .await?;
        Ok(Occupancy { pending, in_flight })
    }

    async fn in_flight_for_worker(
        &self,
        queue_id: Uuid,
        worker_id: &str,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut con = self.redis.connection();
        let in_flight: HashMap<String, String> =
            con.hgetall(self.keys.in_flight(queue_id)).await?;
        Ok(in_flight
            .into_iter()
            .filter(|(_, owner)| owner == worker_id)
            .filter_map(|(task_id, _)| Uuid::parse_str(&task_id).ok())
            .collect())
    }

    async fn save_progress(
        &self,
        queue_id: Uuid,
        task_id: Uuid,
        progress: &TaskProgress,
    ) -> Result<(), StoreError> {
        let key = self.keys.progress(queue_id);
        let encoded = serde_json::to_string(progress)?;
        let mut con = self.redis.connection();
        let _: () = redis::pipe()
            .hset(&key, task_id.to_string(), encoded)
            .ignore()
            .expire(&key, self.ttl())
            .ignore()
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn try_claim_queue(
        &self,
        queue_id: Uuid,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut con = self.redis.connection();
        let claimed: i64 = CLAIM_QUEUE
            .key(self.keys.claim(queue_id))
            .arg(worker_id)
            .arg(ttl.as_millis().max(1) as u64)
            .invoke_async(&mut con)
            .await?;
        Ok(claimed == 1)
    }

    async fn release_queue(&self, queue_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        let mut con = self.redis.connection();
        let _: i64 = RELEASE_QUEUE
            .key(self.keys.claim(queue_id))
            .arg(worker_id)
            .invoke_async(&mut con)
            .await?;
        Ok(())
    }

    async fn queue_claimant(&self, queue_id: Uuid) -> Result<Option<String>, StoreError> {
        let mut con = self.redis.connection();
        let claimant: Option<String> = con.get(self.keys.claim(queue_id)).await?;
        Ok(claimant)
    }

    async fn publish_created(&self, queue_id: Uuid) -> Result<(), StoreError> {
        let mut con = self.redis.connection();
        let _: i64 = con
            .publish(self.keys.created_channel(), queue_id.to_string())
            .await?;
        Ok(())
    }

    async fn watch_created(&self) -> Result<BoxStream<'static, Uuid>, StoreError> {
        let messages = self.redis.subscribe(&self.keys.created_channel()).await?;
        Ok(messages
            .filter_map(|payload| async move { Uuid::parse_str(&payload).ok() })
            .boxed())
    }
}

#[async_trait]
impl WorkerRegistry for RedisQueueRepository {
    async fn heartbeat(&self, record: &WorkerRecord) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(record)?;
        let mut con = self.redis.connection();
        let _: () = con.hset(self.keys.workers(), &record.id, encoded).await?;
        Ok(())
    }

    async fn workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let mut con = self.redis.connection();
        let raw: HashMap<String, String> = con.hgetall(self.keys.workers()).await?;

        let mut records = Vec::with_capacity(raw.len());
        for (worker_id, encoded) in raw {
            match serde_json::from_str::<WorkerRecord>(&encoded) {
                Ok(record) => records.push(record),
                Err(e) => warn!(worker_id = %worker_id, "Skipping corrupt worker record: {}", e),
            }
        }
        Ok(records)
    }

    async fn deregister(&self, worker_id: &str) -> Result<(), StoreError> {
        let mut con = self.redis.connection();
        let _: () = con.hdel(self.keys.workers(), worker_id).await?;
        Ok(())
    }
}
