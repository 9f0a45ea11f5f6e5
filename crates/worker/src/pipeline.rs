use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use watchrabbit_broker::{ConnectionManager, RedeliveryPolicy};
use watchrabbit_core::EventKind;

use crate::chain::EventChain;
use crate::error::WorkerError;
use crate::handlers::{AnalysisRequestedHandler, FileDetectedHandler};
use crate::worker::Worker;

/// Subscribes the event chain to `file.detected` and `analysis.requested`.
pub struct PipelineWorker {
    manager: Arc<ConnectionManager>,
    chain: Arc<EventChain>,
    policy: RedeliveryPolicy,
}

impl PipelineWorker {
    pub fn new(
        manager: Arc<ConnectionManager>,
        chain: Arc<EventChain>,
        policy: RedeliveryPolicy,
    ) -> Self {
        Self {
            manager,
            chain,
            policy,
        }
    }
}

#[async_trait]
impl Worker for PipelineWorker {
    async fn start(&self) -> Result<(), WorkerError> {
        self.manager
            .subscribe(
                EventKind::FileDetected.queue_name(),
                Arc::new(FileDetectedHandler::new(self.chain.clone())),
                self.policy,
            )
            .await?;
        self.manager
            .subscribe(
                EventKind::AnalysisRequested.queue_name(),
                Arc::new(AnalysisRequestedHandler::new(self.chain.clone())),
                self.policy,
            )
            .await?;
        info!(policy = ?self.policy, "pipeline subscriptions armed");
        Ok(())
    }

    async fn stop(&self) -> Result<(), WorkerError> {
        // Subscriptions are torn down by ConnectionManager::close.
        Ok(())
    }

    fn name(&self) -> &str {
        "watchrabbit-worker"
    }
}
