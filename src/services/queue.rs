use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::models::payload::DispatchPayload;

const QUEUE_KEY: &str = "grading:jobs";
const DELAYED_KEY: &str = "grading:delayed";
const PAYLOAD_PREFIX: &str = "grading:payload:";

/// Upper bound on ids moved per promotion pass.
const PROMOTE_BATCH: usize = 100;

/// Moves every due member of the delayed set onto the ready list. `ZREM`
/// succeeding is what claims a member, so concurrent promoters never push the
/// same delivery twice.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
local moved = 0
for _, id in ipairs(due) do
  if redis.call('ZREM', KEYS[1], id) == 1 then
    redis.call('LPUSH', KEYS[2], id)
    moved = moved + 1
  end
end
return moved
"#;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueDepth {
    /// Ids waiting on the ready list.
    pub ready: u64,
    /// Ids waiting out a retry backoff.
    pub delayed: u64,
}

/// FIFO hand-off between job creation and the worker, plus the side store of
/// per-job parameters.
///
/// A single `enqueue` (or `readmit`, or promoted `schedule`) yields exactly
/// one delivery.
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    /// Store the payload (with expiry) and append the job id.
    async fn enqueue(&self, job_id: Uuid, payload: &DispatchPayload) -> Result<(), QueueError>;

    /// Append the job id again without touching its payload.
    async fn readmit(&self, job_id: Uuid) -> Result<(), QueueError>;

    /// Make the job id deliverable once `delay` has elapsed.
    async fn schedule(&self, job_id: Uuid, delay: Duration) -> Result<(), QueueError>;

    /// Move scheduled ids whose delay has elapsed onto the ready list.
    /// Returns how many were moved.
    async fn promote_due(&self) -> Result<u64, QueueError>;

    /// Wait up to `wait` for a job id, removing it atomically.
    async fn dequeue(&self, wait: Duration) -> Result<Option<Uuid>, QueueError>;

    async fn get_payload(&self, job_id: Uuid) -> Result<Option<DispatchPayload>, QueueError>;

    async fn clear_payload(&self, job_id: Uuid) -> Result<(), QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Redis-backed dispatch queue.
///
/// Ready ids live on a list (`LPUSH` / `BRPOP`), delayed ids in a sorted set
/// scored by their ready-at time in epoch milliseconds, payloads under
/// expiring string keys.
pub struct RedisDispatchQueue {
    client: redis::Client,
    payload_ttl: Duration,
}

impl RedisDispatchQueue {
    pub fn new(redis_url: &str, payload_ttl: Duration) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client, payload_ttl })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    fn payload_key(job_id: Uuid) -> String {
        format!("{PAYLOAD_PREFIX}{job_id}")
    }
}

#[async_trait]
impl DispatchQueue for RedisDispatchQueue {
    async fn enqueue(&self, job_id: Uuid, payload: &DispatchPayload) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let body = serde_json::to_string(payload).map_err(QueueError::Serialize)?;
        redis::pipe()
            .atomic()
            .set_ex(Self::payload_key(job_id), body, self.payload_ttl.as_secs().max(1))
            .ignore()
            .lpush(QUEUE_KEY, job_id.to_string())
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        tracing::debug!(job_id = %job_id, "Job enqueued");
        Ok(())
    }

    async fn readmit(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, job_id.to_string())
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn schedule(&self, job_id: Uuid, delay: Duration) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let ready_at = chrono::Utc::now().timestamp_millis()
            + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2);
        conn.zadd::<_, _, _, ()>(DELAYED_KEY, job_id.to_string(), ready_at)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn promote_due(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let now = chrono::Utc::now().timestamp_millis();
        let moved: u64 = redis::Script::new(PROMOTE_SCRIPT)
            .key(DELAYED_KEY)
            .key(QUEUE_KEY)
            .arg(now)
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(moved)
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Uuid>, QueueError> {
        let mut conn = self.connection().await?;
        let popped: Option<(String, String)> = conn
            .brpop(QUEUE_KEY, wait.as_secs_f64())
            .await
            .map_err(QueueError::Redis)?;

        match popped {
            Some((_, raw)) => match Uuid::parse_str(&raw) {
                Ok(id) => Ok(Some(id)),
                Err(_) => {
                    tracing::warn!(value = %raw, "Discarding malformed job id from queue");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn get_payload(&self, job_id: Uuid) -> Result<Option<DispatchPayload>, QueueError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .get(Self::payload_key(job_id))
            .await
            .map_err(QueueError::Redis)?;
        raw.map(|body| serde_json::from_str(&body).map_err(QueueError::Serialize))
            .transpose()
    }

    async fn clear_payload(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(Self::payload_key(job_id))
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let mut conn = self.connection().await?;
        let ready: u64 = conn.llen(QUEUE_KEY).await.map_err(QueueError::Redis)?;
        let delayed: u64 = conn.zcard(DELAYED_KEY).await.map_err(QueueError::Redis)?;
        Ok(QueueDepth { ready, delayed })
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

/// In-process dispatch queue with the same delivery semantics as the Redis
/// queue. Used by tests and single-process setups.
pub struct MemoryDispatchQueue {
    state: Mutex<MemoryQueueState>,
    notify: Notify,
    payload_ttl: Duration,
}

#[derive(Default)]
struct MemoryQueueState {
    ready: VecDeque<Uuid>,
    delayed: Vec<(Instant, Uuid)>,
    payloads: HashMap<Uuid, (DispatchPayload, Instant)>,
}

impl MemoryDispatchQueue {
    pub fn new(payload_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryQueueState::default()),
            notify: Notify::new(),
            payload_ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryQueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_ready(&self, job_id: Uuid) {
        self.lock().ready.push_back(job_id);
        self.notify.notify_one();
    }
}

impl Default for MemoryDispatchQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60))
    }
}

#[async_trait]
impl DispatchQueue for MemoryDispatchQueue {
    async fn enqueue(&self, job_id: Uuid, payload: &DispatchPayload) -> Result<(), QueueError> {
        let expires_at = Instant::now() + self.payload_ttl;
        self.lock()
            .payloads
            .insert(job_id, (payload.clone(), expires_at));
        self.push_ready(job_id);
        Ok(())
    }

    async fn readmit(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.push_ready(job_id);
        Ok(())
    }

    async fn schedule(&self, job_id: Uuid, delay: Duration) -> Result<(), QueueError> {
        self.lock().delayed.push((Instant::now() + delay, job_id));
        Ok(())
    }

    async fn promote_due(&self) -> Result<u64, QueueError> {
        let now = Instant::now();
        let mut state = self.lock();
        let mut due: Vec<(Instant, Uuid)> = Vec::new();
        state.delayed.retain(|entry| {
            if entry.0 <= now {
                due.push(*entry);
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(ready_at, _)| *ready_at);
        let moved = due.len() as u64;
        state.ready.extend(due.into_iter().map(|(_, id)| id));
        drop(state);
        for _ in 0..moved {
            self.notify.notify_one();
        }
        Ok(moved)
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Uuid>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(job_id) = self.lock().ready.pop_front() {
                return Ok(Some(job_id));
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn get_payload(&self, job_id: Uuid) -> Result<Option<DispatchPayload>, QueueError> {
        let mut state = self.lock();
        match state.payloads.get(&job_id) {
            Some((payload, expires_at)) if *expires_at > Instant::now() => Ok(Some(payload.clone())),
            Some(_) => {
                state.payloads.remove(&job_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn clear_payload(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.lock().payloads.remove(&job_id);
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let state = self.lock();
        Ok(QueueDepth {
            ready: state.ready.len() as u64,
            delayed: state.delayed.len() as u64,
        })
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_queue_is_fifo_with_single_delivery() {
        let queue = MemoryDispatchQueue::default();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        queue.enqueue(a, &DispatchPayload::default()).await.unwrap();
        queue.enqueue(b, &DispatchPayload::default()).await.unwrap();

        let wait = Duration::from_millis(10);
        assert_eq!(queue.dequeue(wait).await.unwrap(), Some(a));
        assert_eq!(queue.dequeue(wait).await.unwrap(), Some(b));
        assert_eq!(queue.dequeue(wait).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_id_not_delivered_before_delay() {
        let queue = MemoryDispatchQueue::default();
        let id = Uuid::new_v4();
        queue.schedule(id, Duration::from_secs(5)).await.unwrap();

        assert_eq!(queue.promote_due().await.unwrap(), 0);
        assert_eq!(queue.depth().await.unwrap(), QueueDepth { ready: 0, delayed: 1 });

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(queue.promote_due().await.unwrap(), 1);
        assert_eq!(queue.dequeue(Duration::ZERO).await.unwrap(), Some(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_expires() {
        let queue = MemoryDispatchQueue::new(Duration::from_secs(60));
        let id = Uuid::new_v4();
        queue.enqueue(id, &DispatchPayload::default()).await.unwrap();
        assert!(queue.get_payload(id).await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(queue.get_payload(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(MemoryDispatchQueue::default());
        let id = Uuid::new_v4();
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        queue.readmit(id).await.unwrap();
        assert_eq!(consumer.await.unwrap().unwrap(), Some(id));
    }
}
