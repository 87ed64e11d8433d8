//! Narrow pub/sub interface and the in-process implementation.
//!
//! The reconciler publishes backend and download events here; external
//! transports implement the same trait. The in-process bus fans out over a
//! single tokio broadcast channel; subscribers filter by topic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

/// Topic carrying backend status changes.
pub const TOPIC_BACKEND_STATE: &str = "runtime.backend_state";
/// Topic carrying model download progress.
pub const TOPIC_MODEL_DOWNLOAD: &str = "runtime.model_download";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("publish failed: {0}")]
    Publish(String),
}

/// One published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub topic: String,
    pub payload: Value,
    pub published_at: DateTime<Utc>,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), BusError>;
    /// Subscribe to all topics; callers filter on [`BusEvent::topic`].
    fn subscribe(&self) -> broadcast::Receiver<BusEvent>;
}

/// In-process broadcast bus.
pub struct BroadcastBus {
    sender: broadcast::Sender<BusEvent>,
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::with_capacity(256)
    }
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

#[async_trait]
impl EventBus for BroadcastBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), BusError> {
        let event = BusEvent {
            topic: topic.to_string(),
            payload,
            published_at: Utc::now(),
        };
        // A send error only means nobody is listening right now.
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = BroadcastBus::new();
        let mut rx = bus.subscribe();
        bus.publish(TOPIC_BACKEND_STATE, json!({"backend": "b1"}))
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic, TOPIC_BACKEND_STATE);
        assert_eq!(event.payload["backend"], "b1");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = BroadcastBus::new();
        assert!(bus.publish("t", json!({})).await.is_ok());
    }
}
