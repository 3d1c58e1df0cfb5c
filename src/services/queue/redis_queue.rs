//! Redis-backed queue backend.
//!
//! Layout: job envelopes live in a hash keyed by job id; the per-priority
//! ready queues are lists of ids (LPUSH head, RPOP tail for FIFO); in-flight
//! and delay-scheduled ids live in sorted sets scored by their deadline; the
//! dead-letter sink is a list of failure records. State transitions that must
//! be atomic per job (pop-and-mark-invisible, expiry recovery, requeue
//! routing) run as Lua scripts so concurrent workers can never both own the
//! same job.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{FailureReason, FailureRecord, Job};

use super::{Disposition, FailureClass, JobQueue, QueueError};

const JOBS_KEY: &str = "pod_ocr:jobs";
const IN_FLIGHT_KEY: &str = "pod_ocr:in_flight";
const DELAYED_KEY: &str = "pod_ocr:delayed";
const DEAD_LETTER_KEY: &str = "pod_ocr:dead_letter";
const READY_EXPRESS_KEY: &str = "pod_ocr:ready:express";
const READY_NORMAL_KEY: &str = "pod_ocr:ready:normal";
const READY_BULK_KEY: &str = "pod_ocr:ready:bulk";

/// How often the dequeue loop re-runs its poll script while waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long dequeue_batch waits before returning an empty batch.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Promote due delayed jobs, recover expired in-flight jobs (incrementing
/// retry_count exactly once, dead-lettering on exhaustion), then pop up to
/// max_count envelopes express-first and mark them in flight.
const DEQUEUE_SCRIPT: &str = r#"
local jobs, inflight, delayed, dead = KEYS[1], KEYS[2], KEYS[3], KEYS[4]
local now = tonumber(ARGV[1])
local deadline = tonumber(ARGV[2])
local max_count = tonumber(ARGV[3])
local max_retries = tonumber(ARGV[4])

local function ready_key(priority)
  if priority == 'express' then return KEYS[5]
  elseif priority == 'bulk' then return KEYS[7]
  else return KEYS[6] end
end

local due = redis.call('ZRANGEBYSCORE', delayed, '-inf', now)
for _, id in ipairs(due) do
  redis.call('ZREM', delayed, id)
  local payload = redis.call('HGET', jobs, id)
  if payload then
    redis.call('LPUSH', ready_key(cjson.decode(payload).priority), id)
  end
end

local expired = redis.call('ZRANGEBYSCORE', inflight, '-inf', now)
for _, id in ipairs(expired) do
  redis.call('ZREM', inflight, id)
  local payload = redis.call('HGET', jobs, id)
  if payload then
    local job = cjson.decode(payload)
    job.retry_count = job.retry_count + 1
    if job.retry_count > max_retries then
      redis.call('RPUSH', dead, cjson.encode({
        job_id = id, reason = 'OCR_TIMEOUT',
        attempt = job.retry_count, timestamp_ms = now,
      }))
      redis.call('HDEL', jobs, id)
    else
      redis.call('HSET', jobs, id, cjson.encode(job))
      redis.call('LPUSH', ready_key(job.priority), id)
    end
  end
end

local popped = {}
for _, key in ipairs({KEYS[5], KEYS[6], KEYS[7]}) do
  while #popped < max_count do
    local id = redis.call('RPOP', key)
    if not id then break end
    local payload = redis.call('HGET', jobs, id)
    if payload then
      redis.call('ZADD', inflight, deadline, id)
      table.insert(popped, payload)
    end
  end
end
return popped
"#;

/// Route a failed in-flight job: increment retry_count, then either schedule
/// re-admission or move it to the dead-letter sink.
const REQUEUE_SCRIPT: &str = r#"
local jobs, inflight, delayed, dead = KEYS[1], KEYS[2], KEYS[3], KEYS[4]
local id = ARGV[1]
if redis.call('ZREM', inflight, id) == 0 then
  return 'not_found'
end
local payload = redis.call('HGET', jobs, id)
if not payload then
  return 'not_found'
end
local job = cjson.decode(payload)
job.retry_count = job.retry_count + 1
if ARGV[3] == '1' or job.retry_count > tonumber(ARGV[5]) then
  redis.call('RPUSH', dead, cjson.encode({
    job_id = id, reason = ARGV[2],
    attempt = job.retry_count, timestamp_ms = tonumber(ARGV[6]),
  }))
  redis.call('HDEL', jobs, id)
  return 'dead:' .. job.retry_count
end
redis.call('HSET', jobs, id, cjson.encode(job))
redis.call('ZADD', delayed, tonumber(ARGV[4]), id)
return 'requeued:' .. job.retry_count
"#;

/// Dead-letter sink entry. Timestamps are epoch millis because the records
/// are written from Lua; converted to FailureRecord on drain.
#[derive(Debug, Serialize, Deserialize)]
struct DeadEntry {
    job_id: Uuid,
    reason: FailureReason,
    attempt: u32,
    timestamp_ms: i64,
}

pub struct RedisQueue {
    client: redis::Client,
    dequeue_script: redis::Script,
    requeue_script: redis::Script,
    max_retries: u32,
}

impl RedisQueue {
    pub fn new(redis_url: &str, max_retries: u32) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            dequeue_script: redis::Script::new(DEQUEUE_SCRIPT),
            requeue_script: redis::Script::new(REQUEUE_SCRIPT),
            max_retries,
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, job: Job) -> Result<Uuid, QueueError> {
        let mut conn = self
            .connection()
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        let job_id = job.job_id;
        let ready_key = match job.priority {
            crate::models::job::Priority::Express => READY_EXPRESS_KEY,
            crate::models::job::Priority::Normal => READY_NORMAL_KEY,
            crate::models::job::Priority::Bulk => READY_BULK_KEY,
        };
        let payload = serde_json::to_string(&job)?;
        redis::pipe()
            .atomic()
            .hset(JOBS_KEY, job_id.to_string(), &payload)
            .ignore()
            .lpush(ready_key, job_id.to_string())
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(job_id)
    }

    async fn dequeue_batch(
        &self,
        max_count: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Job>, QueueError> {
        let mut conn = self.connection().await?;
        let poll_deadline = tokio::time::Instant::now() + POLL_TIMEOUT;
        loop {
            let now = now_ms();
            let deadline = now + visibility_timeout.as_millis() as i64;
            let payloads: Vec<String> = self
                .dequeue_script
                .key(JOBS_KEY)
                .key(IN_FLIGHT_KEY)
                .key(DELAYED_KEY)
                .key(DEAD_LETTER_KEY)
                .key(READY_EXPRESS_KEY)
                .key(READY_NORMAL_KEY)
                .key(READY_BULK_KEY)
                .arg(now)
                .arg(deadline)
                .arg(max_count)
                .arg(self.max_retries)
                .invoke_async(&mut conn)
                .await?;

            if !payloads.is_empty() {
                return payloads
                    .iter()
                    .map(|p| serde_json::from_str(p).map_err(QueueError::Serialize))
                    .collect();
            }
            if tokio::time::Instant::now() + POLL_INTERVAL >= poll_deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        // Removing the envelope also neutralizes any stale id left in a ready
        // list by an earlier visibility expiry: ids without an envelope are
        // skipped at pop time. Idempotent by construction.
        redis::pipe()
            .atomic()
            .zrem(IN_FLIGHT_KEY, job_id.to_string())
            .ignore()
            .zrem(DELAYED_KEY, job_id.to_string())
            .ignore()
            .hdel(JOBS_KEY, job_id.to_string())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn requeue(
        &self,
        job_id: Uuid,
        failure: FailureClass,
        delay: Duration,
    ) -> Result<Disposition, QueueError> {
        let mut conn = self.connection().await?;
        let now = now_ms();
        let ready_at = now + delay.as_millis() as i64;
        let verdict: String = self
            .requeue_script
            .key(JOBS_KEY)
            .key(IN_FLIGHT_KEY)
            .key(DELAYED_KEY)
            .key(DEAD_LETTER_KEY)
            .arg(job_id.to_string())
            .arg(failure.reason.to_string())
            .arg(if failure.terminal { "1" } else { "0" })
            .arg(ready_at)
            .arg(self.max_retries)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;

        match verdict.split_once(':') {
            Some(("dead", attempt)) => Ok(Disposition::DeadLettered {
                reason: failure.reason,
                attempt: attempt.parse().unwrap_or(0),
            }),
            Some(("requeued", count)) => Ok(Disposition::Requeued {
                retry_count: count.parse().unwrap_or(0),
            }),
            _ => Ok(Disposition::NotFound),
        }
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let (express, normal, bulk, delayed): (u64, u64, u64, u64) = redis::pipe()
            .llen(READY_EXPRESS_KEY)
            .llen(READY_NORMAL_KEY)
            .llen(READY_BULK_KEY)
            .zcard(DELAYED_KEY)
            .query_async(&mut conn)
            .await?;
        Ok(express + normal + bulk + delayed)
    }

    async fn drain_dead_letters(&self, max: usize) -> Result<Vec<FailureRecord>, QueueError> {
        let mut conn = self.connection().await?;
        let entries: Vec<String> = conn
            .lpop(DEAD_LETTER_KEY, std::num::NonZeroUsize::new(max))
            .await?;
        entries
            .iter()
            .map(|raw| {
                let entry: DeadEntry = serde_json::from_str(raw)?;
                Ok(FailureRecord {
                    job_id: entry.job_id,
                    reason: entry.reason,
                    attempt: entry.attempt,
                    timestamp: DateTime::from_timestamp_millis(entry.timestamp_ms)
                        .unwrap_or_else(Utc::now),
                })
            })
            .collect()
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}
