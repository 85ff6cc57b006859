//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Message handlers invoked by the subscriber for every inbound message, plus the
// envelope the queue server wraps around published events.
//--------------------------------------------------------------------------------------------------

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::mpsc;
use tracing::info;

/// Processes one raw inbound message.
///
/// The subscriber calls `handle` exactly once per non-empty message and waits for it
/// to finish before receiving the next one. Returned errors (and panics) are logged by
/// the subscriber and never stop the receive loop.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &str) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(&str) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, message: &str) -> anyhow::Result<()> {
        self(message)
    }
}

/// Logs every message it receives and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, message: &str) -> anyhow::Result<()> {
        match QueueMessage::decode(message) {
            Ok(envelope) => info!(
                event = %envelope.event,
                retry = envelope.retry,
                published_at = ?envelope.published_at(),
                "Received message from queue: {}",
                envelope.data
            ),
            Err(_) => info!("Received message from queue: {}", message),
        }
        Ok(())
    }
}

/// Hands every message to an in-process channel.
///
/// This is where a host application plugs in its own event bus or job queue. A full
/// channel applies backpressure to the subscriber; a dropped receiver is a handler
/// failure.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    sender: mpsc::Sender<String>,
}

impl ChannelHandler {
    pub fn new(sender: mpsc::Sender<String>) -> Self {
        Self { sender }
    }

    /// Creates a handler together with the receiving end of its channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self::new(sender), receiver)
    }
}

#[async_trait]
impl MessageHandler for ChannelHandler {
    async fn handle(&self, message: &str) -> anyhow::Result<()> {
        self.sender
            .send(message.to_owned())
            .await
            .map_err(|_| anyhow::anyhow!("message channel receiver was dropped"))
    }
}

/// Envelope the queue server pushes to websocket subscribers.
///
/// `data` is the text-serialized payload exactly as it was published; decode it with
/// [`QueueMessage::payload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub event: String,
    pub data: String,
    #[serde(default)]
    pub retry: u32,
    /// Unix seconds at which the server accepted the event.
    #[serde(default)]
    pub timestamp: i64,
}

impl QueueMessage {
    pub fn decode(raw: &str) -> Result<QueueMessage, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.data)
    }

    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        if self.timestamp <= 0 {
            return None;
        }
        Utc.timestamp_opt(self.timestamp, 0).single()
    }
}
