//! Notification channels for workflow events

use crate::error::Result;
use crate::workflow_event::NotificationMessage;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client;
use tokio::sync::broadcast;
use tracing::{debug, info};

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: &NotificationMessage) -> Result<()>;
}

/// Appends each message to a Redis stream as `message` and `attributes` fields
pub struct RedisStreamPublisher {
    conn: MultiplexedConnection,
    stream: String,
    max_len: Option<usize>,
}

impl RedisStreamPublisher {
    pub async fn connect(url: &str, stream: impl Into<String>) -> Result<Self> {
        let stream = stream.into();
        info!("Connecting notification publisher to {} (stream {})", url, stream);

        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;

        Ok(Self {
            conn,
            stream,
            max_len: None,
        })
    }

    /// Trim the stream to roughly `max_len` entries on every append
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }
}

#[async_trait]
impl Publisher for RedisStreamPublisher {
    async fn publish(&self, message: &NotificationMessage) -> Result<()> {
        let attributes = serde_json::to_string(&message.attributes)?;

        // XADD stream [MAXLEN ~ n] * message <body> attributes <json>
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream);
        if let Some(max_len) = self.max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*")
            .arg("message")
            .arg(&message.body)
            .arg("attributes")
            .arg(attributes);

        let mut conn = self.conn.clone();
        let id: String = cmd.query_async(&mut conn).await?;
        debug!(stream = %self.stream, id = %id, "Published workflow event");
        Ok(())
    }
}

/// In-process fan-out for subscribers living in the same process
#[derive(Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<NotificationMessage>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationMessage> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl Publisher for BroadcastPublisher {
    async fn publish(&self, message: &NotificationMessage) -> Result<()> {
        // No subscribers is not a failure
        if self.sender.send(message.clone()).is_err() {
            debug!("No subscribers for workflow event");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn message(body: &str) -> NotificationMessage {
        NotificationMessage {
            body: body.to_string(),
            attributes: BTreeMap::from([("event_type".to_string(), "FAILED".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let publisher = BroadcastPublisher::new(8);
        let mut rx = publisher.subscribe();

        publisher.publish(&message("{}")).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received, message("{}"));
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_succeeds() {
        let publisher = BroadcastPublisher::default();
        assert!(publisher.publish(&message("{}")).await.is_ok());
    }
}
