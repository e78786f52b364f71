use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

const QUEUE_KEY: &str = "listing_prep:jobs";
const PROCESSING_KEY: &str = "listing_prep:processing";
const DELAYED_KEY: &str = "listing_prep:delayed";

/// Job-start message serialized into Redis. Delivery is at-least-once;
/// the orchestrator's checkpoint makes redelivery idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareMessage {
    pub job_id: Uuid,
    pub listing_id: Uuid,
    pub owner_id: Uuid,
    pub priority: i32,
}

/// Redis-backed job queue with a processing list for in-flight messages
/// and a delayed set for negative-ack redelivery backoff.
pub struct JobQueue {
    client: redis::Client,
}

impl JobQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }

    /// Enqueue a job-start message.
    pub async fn enqueue(&self, msg: &PrepareMessage) -> Result<(), QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(msg).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Dequeue the next message, promoting any delayed messages that are
    /// due. The message stays on the processing list until acked.
    pub async fn dequeue(&self) -> Result<Option<PrepareMessage>, QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;

        self.promote_due(&mut conn).await?;

        let result: Option<String> = conn
            .rpoplpush(QUEUE_KEY, PROCESSING_KEY)
            .await
            .map_err(QueueError::Redis)?;

        match result {
            Some(payload) => {
                let msg: PrepareMessage =
                    serde_json::from_str(&payload).map_err(QueueError::Serialize)?;
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    /// Acknowledge a message (remove from the processing list).
    pub async fn complete(&self, msg: &PrepareMessage) -> Result<(), QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(msg).map_err(QueueError::Serialize)?;
        conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Negatively acknowledge a message: schedule redelivery after
    /// `delay` and drop it from the processing list.
    pub async fn nack(&self, msg: &PrepareMessage, delay: Duration) -> Result<(), QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(msg).map_err(QueueError::Serialize)?;
        let due_at = now_millis() + delay.as_millis() as f64;
        conn.zadd::<_, _, _, ()>(DELAYED_KEY, &payload, due_at)
            .await
            .map_err(QueueError::Redis)?;
        conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Get the current queue depth (pending jobs, excluding delayed).
    pub async fn queue_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        let depth: u64 = conn.llen(QUEUE_KEY).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }

    /// Move delayed messages whose due time has passed onto the main list.
    async fn promote_due(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<(), QueueError> {
        let due: Vec<String> = conn
            .zrangebyscore_limit(DELAYED_KEY, "-inf", now_millis(), 0, 32)
            .await
            .map_err(QueueError::Redis)?;

        for payload in due {
            let removed: i64 = conn
                .zrem(DELAYED_KEY, &payload)
                .await
                .map_err(QueueError::Redis)?;
            // Another worker may have promoted it first.
            if removed > 0 {
                conn.lpush::<_, _, ()>(QUEUE_KEY, &payload)
                    .await
                    .map_err(QueueError::Redis)?;
            }
        }
        Ok(())
    }
}

fn now_millis() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0)
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
