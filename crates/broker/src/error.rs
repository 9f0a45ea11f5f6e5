use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in the broker client layer.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Dial or channel open failed. Recovered by the reconnect loop.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("topology declaration failed: {0}")]
    Topology(String),

    #[error("serialization error: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[source] serde_json::Error),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("acknowledgement failed: {0}")]
    Ack(String),

    /// A delivery handler rejected the message.
    #[error("handler error: {0}")]
    Handler(String),
}

impl BrokerError {
    /// Whether the error means the connection itself is unusable.
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        Self::Connection(err.to_string())
    }
}
