//! Task queue: a Redis list. `LPUSH` enqueues; consumers `BLMOVE` each task
//! into their own processing list and `LREM` it once the job is recorded.
//!
//! A consumer that dies mid-task leaves the payload in its processing list.
//! The next consumer created for the same slot pushes it back onto the queue,
//! so the job runs again instead of staying PENDING forever. Terminal writes
//! are guarded, so a rerun never overwrites a finished job.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::pipeline::Task;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Malformed task payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// What travels on the queue. `task_id` is also the job id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub task: Task,
}

/// One item taken off the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Task(TaskEnvelope),
    /// The payload did not decode. `task_id` is set when at least that much
    /// could be read, so the job can be failed.
    Malformed {
        task_id: Option<Uuid>,
        reason: String,
    },
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, envelope: &TaskEnvelope) -> Result<(), QueueError>;

    /// A consumer with its own connection for worker `slot`. Tasks left
    /// in flight by a previous consumer of the same slot are requeued.
    async fn consumer(&self, slot: usize) -> Result<Box<dyn TaskConsumer>, QueueError>;
}

#[async_trait]
pub trait TaskConsumer: Send {
    /// Waits up to `wait` for the next task. `None` on timeout.
    async fn next(&mut self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Drops the last delivery from the in-flight list.
    async fn ack(&mut self) -> Result<(), QueueError>;
}

pub struct RedisQueue {
    client: redis::Client,
    producer: MultiplexedConnection,
    key: String,
    worker_id: String,
}

impl RedisQueue {
    pub async fn connect(
        client: redis::Client,
        key: impl Into<String>,
        worker_id: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let producer = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            client,
            producer,
            key: key.into(),
            worker_id: worker_id.into(),
        })
    }

    fn processing_key(&self, slot: usize) -> String {
        format!("{}:processing:{}:{slot}", self.key, self.worker_id)
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    async fn enqueue(&self, envelope: &TaskEnvelope) -> Result<(), QueueError> {
        let payload = serde_json::to_string(envelope)?;
        let mut conn = self.producer.clone();
        redis::cmd("LPUSH")
            .arg(&self.key)
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await?;
        debug!("Enqueued task {} on {}", envelope.task_id, self.key);
        Ok(())
    }

    async fn consumer(&self, slot: usize) -> Result<Box<dyn TaskConsumer>, QueueError> {
        // BLMOVE blocks its connection, so every consumer gets a dedicated one.
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let processing = self.processing_key(slot);

        // The consumer pops from the right, so requeued tasks go back on the right.
        let mut requeued = 0usize;
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&processing)
                .arg(&self.key)
                .arg("RIGHT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if moved.is_none() {
                break;
            }
            requeued += 1;
        }
        if requeued > 0 {
            info!("Requeued {requeued} interrupted task(s) from {processing}");
        }

        Ok(Box::new(RedisConsumer {
            conn,
            key: self.key.clone(),
            processing,
            in_flight: None,
        }))
    }
}

struct RedisConsumer {
    conn: MultiplexedConnection,
    key: String,
    processing: String,
    in_flight: Option<String>,
}

#[async_trait]
impl TaskConsumer for RedisConsumer {
    async fn next(&mut self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let moved: Option<String> = redis::cmd("BLMOVE")
            .arg(&self.key)
            .arg(&self.processing)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(wait.as_secs().max(1))
            .query_async(&mut self.conn)
            .await?;
        Ok(moved.map(|payload| {
            let delivery = decode(&payload);
            self.in_flight = Some(payload);
            delivery
        }))
    }

    async fn ack(&mut self) -> Result<(), QueueError> {
        if let Some(payload) = self.in_flight.take() {
            redis::cmd("LREM")
                .arg(&self.processing)
                .arg(1)
                .arg(payload)
                .query_async::<_, ()>(&mut self.conn)
                .await?;
        }
        Ok(())
    }
}

/// Just enough of an envelope to identify its job.
#[derive(Deserialize)]
struct EnvelopeHeader {
    task_id: Uuid,
}

pub(crate) fn decode(payload: &str) -> Delivery {
    match serde_json::from_str::<TaskEnvelope>(payload) {
        Ok(envelope) => Delivery::Task(envelope),
        Err(e) => Delivery::Malformed {
            task_id: serde_json::from_str::<EnvelopeHeader>(payload)
                .ok()
                .map(|header| header.task_id),
            reason: e.to_string(),
        },
    }
}
