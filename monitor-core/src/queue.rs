//! At-least-once hand-off of execution messages from scheduler to workers.

use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use std::collections::VecDeque;
use tokio::sync::Mutex;

use crate::{config::RedisConfig, error::Result, models::ExecutionMessage};

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, message: &ExecutionMessage) -> Result<()>;

    /// Pops the oldest message, or `None` when the queue is empty.
    async fn dequeue(&self) -> Result<Option<ExecutionMessage>>;
}

/// Redis list used as a FIFO: producers `LPUSH`, consumers `RPOP`.
#[derive(Clone)]
pub struct RedisWorkQueue {
    connection: MultiplexedConnection,
    key: String,
}

impl RedisWorkQueue {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            connection,
            key: config.queue_key.clone(),
        })
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn enqueue(&self, message: &ExecutionMessage) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let mut connection = self.connection.clone();
        let _: i64 = connection.lpush(&self.key, payload).await?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<ExecutionMessage>> {
        let mut connection = self.connection.clone();
        let payload: Option<String> = connection.rpop(&self.key, None).await?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryWorkQueue {
    messages: Mutex<VecDeque<ExecutionMessage>>,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.lock().await.is_empty()
    }

    pub async fn drain(&self) -> Vec<ExecutionMessage> {
        self.messages.lock().await.drain(..).collect()
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, message: &ExecutionMessage) -> Result<()> {
        self.messages.lock().await.push_back(message.clone());
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<ExecutionMessage>> {
        Ok(self.messages.lock().await.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn message() -> ExecutionMessage {
        ExecutionMessage {
            monitor_id: Uuid::new_v4(),
            claim_token: Uuid::new_v4(),
            enqueued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn in_memory_queue_is_fifo() {
        let queue = InMemoryWorkQueue::new();
        let first = message();
        let second = message();
        queue.enqueue(&first).await.unwrap();
        queue.enqueue(&second).await.unwrap();

        assert_eq!(queue.len().await, 2);
        assert_eq!(queue.dequeue().await.unwrap(), Some(first));
        assert_eq!(queue.dequeue().await.unwrap(), Some(second));
        assert_eq!(queue.dequeue().await.unwrap(), None);
    }

    #[test]
    fn message_wire_format() {
        let msg = message();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["monitor_id"], serde_json::json!(msg.monitor_id));
        assert_eq!(json["claim_token"], serde_json::json!(msg.claim_token));
        assert!(json.get("enqueued_at").is_some());
    }
}
