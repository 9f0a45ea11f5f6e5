//! Queue consumers that decode a delivery and hand it to the [`EventChain`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use watchrabbit_broker::{decode_body, BrokerError, DeliveryHandler};
use watchrabbit_core::{AnalysisRequested, Event, FileDetected};

use crate::chain::EventChain;
use crate::error::ChainError;

/// Consumes the `file.detected` queue.
pub struct FileDetectedHandler {
    chain: Arc<EventChain>,
}

impl FileDetectedHandler {
    pub fn new(chain: Arc<EventChain>) -> Self {
        Self { chain }
    }
}

#[async_trait]
impl DeliveryHandler for FileDetectedHandler {
    async fn handle(&self, body: &[u8]) -> Result<(), BrokerError> {
        let event: FileDetected = decode(body, "file.detected")?;
        self.chain.on_file_detected(&event).await?;
        Ok(())
    }
}

/// Consumes the `analysis.requested` queue.
pub struct AnalysisRequestedHandler {
    chain: Arc<EventChain>,
}

impl AnalysisRequestedHandler {
    pub fn new(chain: Arc<EventChain>) -> Self {
        Self { chain }
    }
}

#[async_trait]
impl DeliveryHandler for AnalysisRequestedHandler {
    async fn handle(&self, body: &[u8]) -> Result<(), BrokerError> {
        let request: AnalysisRequested = decode(body, "analysis.requested")?;
        self.chain.on_analysis_requested(&request).await?;
        Ok(())
    }
}

fn decode<T: Event>(body: &[u8], kind: &'static str) -> Result<T, ChainError> {
    decode_body::<T>(body).map_err(|source| {
        warn!(kind, error = %source, "malformed payload");
        ChainError::Malformed { kind, source }
    })
}
