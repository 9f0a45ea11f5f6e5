use thiserror::Error;
use watchrabbit_broker::BrokerError;

/// Failures of the event chain that must reach the subscriber's ack decision.
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: BrokerError,
    },

    #[error("failed to publish {kind}: {source}")]
    Publish {
        kind: &'static str,
        #[source]
        source: BrokerError,
    },
}

impl From<ChainError> for BrokerError {
    fn from(err: ChainError) -> Self {
        BrokerError::Handler(err.to_string())
    }
}

/// Lifecycle failures of a long-running worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("{0}")]
    Other(String),
}
