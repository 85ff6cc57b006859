// Expose the modules
pub mod backoff;
pub mod config;
pub mod error;
pub mod handler;
pub mod publisher;
pub mod subscriber;

// Re-export key types for easier usage
pub use backoff::{BackoffSchedule, BackoffState};
pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use handler::{ChannelHandler, LoggingHandler, MessageHandler, QueueMessage};
pub use publisher::{Publisher, encode_payload};
pub use subscriber::{
    Connection, Connector, Subscriber, SubscriberState, SubscriberStats, WebSocketConnector,
};

// Cancellation handle accepted by `Subscriber::run`
pub use tokio_util::sync::CancellationToken;
