//! Redis-backed queue backend.
//!
//! Key layout under the configured prefix:
//!
//! | key | type | contents |
//! |---|---|---|
//! | `{prefix}:jobs` | hash | job id → job JSON |
//! | `{prefix}:waiting` | list | job ids, LPUSH in / RPOP out |
//! | `{prefix}:processing:{worker}` | list | ids claimed by one worker |
//! | `{prefix}:workers` | set | workers that ever claimed a job |
//! | `{prefix}:delayed` | sorted set | ids scored by ready time (ms) |
//! | `{prefix}:dead` | list | dead-lettered ids, newest first |
//! | `{prefix}:completed`, `{prefix}:failed` | string | counters |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::queue::{QueueBackend, QueueStats, QueuedJob};
use super::JobId;
use crate::error::{ErrorCode, Result, RollupError};

const PROMOTE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(ids) do
    redis.call('ZREM', KEYS[1], id)
    redis.call('LPUSH', KEYS[2], id)
end
return #ids
"#;

const RECOVER_SCRIPT: &str = r#"
local moved = 0
while true do
    local id = redis.call('LPOP', KEYS[1])
    if not id then
        break
    end
    redis.call('RPUSH', KEYS[2], id)
    moved = moved + 1
end
return moved
"#;

const DEAD_LETTER_SCRIPT: &str = r#"
redis.call('LREM', KEYS[1], 1, ARGV[1])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
redis.call('LPUSH', KEYS[3], ARGV[1])
redis.call('INCR', KEYS[4])
local max = tonumber(ARGV[3])
while redis.call('LLEN', KEYS[3]) > max do
    local evicted = redis.call('RPOP', KEYS[3])
    redis.call('HDEL', KEYS[2], evicted)
end
return 1
"#;

const REPLAY_SCRIPT: &str = r#"
local removed = redis.call('LREM', KEYS[1], 0, ARGV[1])
if removed == 0 then
    return 0
end
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
redis.call('LPUSH', KEYS[3], ARGV[1])
return 1
"#;

/// Redis-backed queue backend for production use.
#[derive(Clone)]
pub struct RedisQueueBackend {
    conn: ConnectionManager,
    prefix: String,
    dead_letter_max_size: usize,
}

impl RedisQueueBackend {
    /// Create a new Redis queue backend.
    ///
    /// # Arguments
    /// * `conn` - A connected Redis connection manager
    /// * `prefix` - Prefix for every key the queue owns (e.g. `"rollup:queue:review-processing"`)
    /// * `dead_letter_max_size` - Length the dead-letter list is trimmed to
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>, dead_letter_max_size: usize) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            dead_letter_max_size,
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn processing_key(&self, worker: &str) -> String {
        format!("{}:processing:{}", self.prefix, worker)
    }

    fn queue_error(message: &'static str, e: redis::RedisError) -> RollupError {
        RollupError::with_internal(ErrorCode::QueueError, message, e.to_string())
    }

    async fn store_job(&self, job: &QueuedJob) -> Result<()> {
        let serialized = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(self.key("jobs"), job.id().to_string(), serialized)
            .await
            .map_err(|e| Self::queue_error("Failed to store job in Redis", e))
    }

    async fn load_job(&self, id: &str) -> Result<Option<QueuedJob>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .hget(self.key("jobs"), id)
            .await
            .map_err(|e| Self::queue_error("Failed to read job from Redis", e))?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn enqueue(&self, job: QueuedJob) -> Result<()> {
        let serialized = serde_json::to_string(&job)?;
        let id = job.id().to_string();

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hset(self.key("jobs"), &id, serialized)
            .ignore()
            .lpush(self.key("waiting"), &id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| Self::queue_error("Failed to enqueue job to Redis", e))?;

        tracing::debug!(queue = %self.prefix, job_id = %id, "Job enqueued");
        Ok(())
    }

    async fn claim(&self, worker: &str) -> Result<Option<QueuedJob>> {
        let processing = self.processing_key(worker);
        let mut conn = self.conn.clone();

        conn.sadd::<_, _, ()>(self.key("workers"), worker)
            .await
            .map_err(|e| Self::queue_error("Failed to register worker in Redis", e))?;

        loop {
            let id: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(self.key("waiting"))
                .arg(&processing)
                .query_async(&mut conn)
                .await
                .map_err(|e| Self::queue_error("Failed to claim job from Redis", e))?;

            let Some(id) = id else {
                return Ok(None);
            };

            match self.load_job(&id).await? {
                Some(mut job) => {
                    job.metadata.mark_running();
                    self.store_job(&job).await?;
                    tracing::debug!(queue = %self.prefix, job_id = %id, worker, "Job claimed");
                    return Ok(Some(job));
                }
                None => {
                    // Orphaned id (its job body was evicted); drop it and keep looking.
                    conn.lrem::<_, _, ()>(&processing, 1, &id)
                        .await
                        .map_err(|e| Self::queue_error("Failed to drop orphaned job id", e))?;
                    tracing::warn!(queue = %self.prefix, job_id = %id, "Dropped orphaned job id");
                }
            }
        }
    }

    async fn complete(&self, worker: &str, job: &QueuedJob) -> Result<()> {
        let id = job.id().to_string();
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .lrem(self.processing_key(worker), 1, &id)
            .ignore()
            .hdel(self.key("jobs"), &id)
            .ignore()
            .incr(self.key("completed"), 1)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| Self::queue_error("Failed to complete job in Redis", e))
    }

    async fn schedule_retry(&self, worker: &str, job: &QueuedJob, ready_at: DateTime<Utc>) -> Result<()> {
        let id = job.id().to_string();
        let serialized = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .lrem(self.processing_key(worker), 1, &id)
            .ignore()
            .hset(self.key("jobs"), &id, serialized)
            .ignore()
            .zadd(self.key("delayed"), &id, ready_at.timestamp_millis())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| Self::queue_error("Failed to schedule job retry in Redis", e))
    }

    async fn dead_letter(&self, worker: &str, job: &QueuedJob) -> Result<()> {
        let serialized = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        redis::Script::new(DEAD_LETTER_SCRIPT)
            .key(self.processing_key(worker))
            .key(self.key("jobs"))
            .key(self.key("dead"))
            .key(self.key("failed"))
            .arg(job.id().to_string())
            .arg(serialized)
            .arg(self.dead_letter_max_size)
            .invoke_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| Self::queue_error("Failed to dead-letter job in Redis", e))?;
        Ok(())
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn.clone();
        let moved: i64 = redis::Script::new(PROMOTE_SCRIPT)
            .key(self.key("delayed"))
            .key(self.key("waiting"))
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Self::queue_error("Failed to promote delayed jobs in Redis", e))?;
        Ok(moved.max(0) as usize)
    }

    async fn recover_stalled(&self, worker: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let moved: i64 = redis::Script::new(RECOVER_SCRIPT)
            .key(self.processing_key(worker))
            .key(self.key("waiting"))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Self::queue_error("Failed to recover stalled jobs in Redis", e))?;
        Ok(moved.max(0) as usize)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<QueuedJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .lrange(self.key("dead"), 0, limit as isize - 1)
            .await
            .map_err(|e| Self::queue_error("Failed to list dead jobs in Redis", e))?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let bodies: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.key("jobs"))
            .arg(&ids)
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::queue_error("Failed to read dead jobs from Redis", e))?;

        bodies
            .into_iter()
            .flatten()
            .map(|raw| serde_json::from_str(&raw).map_err(RollupError::from))
            .collect()
    }

    async fn replay_dead(&self, id: JobId) -> Result<bool> {
        let id = id.to_string();
        let Some(mut job) = self.load_job(&id).await? else {
            return Ok(false);
        };
        job.metadata.reset_for_replay();
        let serialized = serde_json::to_string(&job)?;

        let mut conn = self.conn.clone();
        let replayed: i64 = redis::Script::new(REPLAY_SCRIPT)
            .key(self.key("dead"))
            .key(self.key("jobs"))
            .key(self.key("waiting"))
            .arg(&id)
            .arg(serialized)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Self::queue_error("Failed to replay dead job in Redis", e))?;
        Ok(replayed == 1)
    }

    async fn get(&self, id: JobId) -> Result<Option<QueuedJob>> {
        self.load_job(&id.to_string()).await
    }

    async fn stats(&self) -> Result<QueueStats> {
        let mut conn = self.conn.clone();
        let (waiting, delayed, dead, completed, failed, workers): (
            usize,
            usize,
            usize,
            Option<u64>,
            Option<u64>,
            Vec<String>,
        ) = redis::pipe()
            .llen(self.key("waiting"))
            .zcard(self.key("delayed"))
            .llen(self.key("dead"))
            .get(self.key("completed"))
            .get(self.key("failed"))
            .smembers(self.key("workers"))
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::queue_error("Failed to get Redis queue stats", e))?;

        let mut processing = 0usize;
        for worker in &workers {
            let len: usize = conn
                .llen(self.processing_key(worker))
                .await
                .map_err(|e| Self::queue_error("Failed to get Redis queue stats", e))?;
            processing += len;
        }

        Ok(QueueStats {
            waiting,
            delayed,
            processing,
            dead,
            completed: completed.unwrap_or(0),
            failed: failed.unwrap_or(0),
        })
    }
}
