use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use crate::model::now_rfc3339;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    StreamStart,
    StreamStop,
    RecordingStart,
    RecordingStop,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::StreamStart => "stream:start",
            Topic::StreamStop => "stream:stop",
            Topic::RecordingStart => "recording:start",
            Topic::RecordingStop => "recording:stop",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub topic: &'static str,
    pub payload: serde_json::Value,
    pub at: String,
}

/// Fire-and-forget publication to downstream consumers.
pub trait NotificationBus: Send + Sync + 'static {
    fn publish(&self, topic: Topic, payload: serde_json::Value);
}

/// In-process bus fanned out over a broadcast channel (the websocket
/// endpoint is one subscriber). Publishing with no subscribers is fine.
pub struct BroadcastBus {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl NotificationBus for BroadcastBus {
    fn publish(&self, topic: Topic, payload: serde_json::Value) {
        info!(topic = topic.as_str(), %payload, "publish");
        let _ = self.tx.send(Notification {
            topic: topic.as_str(),
            payload,
            at: now_rfc3339(),
        });
    }
}
