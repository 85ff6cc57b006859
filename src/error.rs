use thiserror::Error;
use wsqueue::WsQueueError;

/// +----------------------------------------------------------+
/// | STRUCTS | TRAITS | ENUMS | FUNCTIONS                     |
/// +----------+-------+-------+------------------------------+
/// | Enums:                                                   |
/// |   - BridgeError                                          |
/// | Types:                                                   |
/// |   - BridgeResult                                         |
/// +----------------------------------------------------------+

/// Errors surfaced by the subscriber, the publisher and their configuration.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The configuration is missing a value or holds an invalid one.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The socket connection could not be established, or it broke.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Reconnecting failed too many times in a row; the subscriber gave up.
    #[error("Subscription lost after {attempts} consecutive reconnect attempts")]
    SubscriptionLost { attempts: u32 },

    /// A single publish attempt was not accepted by the queue server.
    #[error("Failed to publish '{event}': {reason}")]
    Publish { event: String, reason: String },

    /// The payload could not be encoded. This is a caller bug and is never retried.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl From<WsQueueError> for BridgeError {
    fn from(err: WsQueueError) -> Self {
        BridgeError::Connection(err.to_string())
    }
}

impl BridgeError {
    /// Whether a retry by the caller can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::Connection(_) | BridgeError::Publish { .. })
    }
}
