//! FileDetected → AnalysisRequested → AnalysisCompleted.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use watchrabbit_analysis::{AnalysisRunner, TaskOutcome};
use watchrabbit_broker::EventPublisher;
use watchrabbit_core::file_type::normalize_extension;
use watchrabbit_core::{
    AnalysisCompleted, AnalysisRequested, AnalysisStatus, FileDetected, SupportedFileTypes,
};
use watchrabbit_records::{RecordStore, ResultRecord, RESULT_REPORT};
use watchrabbit_storage::{ArtifactMetadata, ArtifactStore, StoredArtifact};

use crate::error::ChainError;

/// Reacts to one message kind at a time and publishes the next event.
///
/// Record-store calls are best-effort. Publish failures are returned so the
/// subscriber nacks and the message is retried.
pub struct EventChain {
    publisher: Arc<dyn EventPublisher>,
    runner: Arc<dyn AnalysisRunner>,
    artifacts: Arc<dyn ArtifactStore>,
    records: Option<Arc<dyn RecordStore>>,
    supported: SupportedFileTypes,
    exchange_prefix: String,
    retain_output: bool,
}

impl EventChain {
    pub fn new(
        publisher: Arc<dyn EventPublisher>,
        runner: Arc<dyn AnalysisRunner>,
        artifacts: Arc<dyn ArtifactStore>,
        supported: SupportedFileTypes,
        exchange_prefix: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            runner,
            artifacts,
            records: None,
            supported,
            exchange_prefix: exchange_prefix.into(),
            retain_output: true,
        }
    }

    pub fn with_records(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    /// Delete the local artifact once it is stored.
    pub fn discard_output(mut self, discard: bool) -> Self {
        self.retain_output = !discard;
        self
    }

    /// Publish an `AnalysisRequested` for a supported file. Unsupported types
    /// are dropped and `None` is returned.
    #[instrument(skip_all, fields(file = %event.file_path, file_type = %event.file_type))]
    pub async fn on_file_detected(
        &self,
        event: &FileDetected,
    ) -> Result<Option<AnalysisRequested>, ChainError> {
        let file_type = normalize_extension(&event.file_type);
        if !self.supported.contains(&file_type) {
            debug!("unsupported file type, dropping");
            return Ok(None);
        }

        if let Some(records) = &self.records {
            if let Err(e) = records.record_file(Path::new(&event.file_path), event.size).await {
                warn!(error = %e, "failed to record file");
            }
        }

        let request = AnalysisRequested::from_detection(event);
        self.publisher
            .publish_event(&self.exchange_prefix, &request)
            .await
            .map_err(|source| ChainError::Publish {
                kind: "analysis.requested",
                source,
            })?;

        info!("analysis requested");
        Ok(Some(request))
    }

    /// Run the analysis, store its artifact and publish exactly one
    /// `AnalysisCompleted`.
    #[instrument(skip_all, fields(file = %request.file_path, file_type = %request.file_type))]
    pub async fn on_analysis_requested(
        &self,
        request: &AnalysisRequested,
    ) -> Result<AnalysisCompleted, ChainError> {
        let analysis_type = self.runner.analysis_type().to_string();
        let record_id = self.record_start(&request.file_path, &analysis_type).await;

        let outcome = self
            .runner
            .run(&request.file_path, &request.file_type)
            .await;
        let (completion, stored) = self.complete(request, &analysis_type, &outcome).await;

        if let Some(id) = record_id {
            self.record_status(id, &completion).await;
            if let Some(stored) = &stored {
                self.record_result(id, stored).await;
            }
        }

        self.publisher
            .publish_event(&self.exchange_prefix, &completion)
            .await
            .map_err(|source| ChainError::Publish {
                kind: "analysis.completed",
                source,
            })?;

        info!(
            status = %completion.status,
            processing_time_ms = completion.processing_time_ms,
            result_key = %completion.result_key,
            "analysis completed"
        );
        Ok(completion)
    }

    async fn complete(
        &self,
        request: &AnalysisRequested,
        analysis_type: &str,
        outcome: &TaskOutcome,
    ) -> (AnalysisCompleted, Option<StoredArtifact>) {
        let invocation_id = Some(outcome.invocation_id);
        let Some(output) = outcome.output() else {
            let error = outcome.error().unwrap_or("analysis failed");
            let completion = AnalysisCompleted::failure(
                request,
                analysis_type,
                invocation_id,
                outcome.analysis_status(),
                error,
            );
            return (completion, None);
        };

        let mut metadata =
            ArtifactMetadata::html(&outcome.file_type, analysis_type, outcome.invocation_id);
        if let Some(script) = outcome.metadata.get("script") {
            metadata = metadata.with_script(script.clone());
        }

        match self.artifacts.store(output, &metadata).await {
            Ok(stored) if !stored.key.is_empty() => {
                if !self.retain_output {
                    if let Err(e) = tokio::fs::remove_file(output).await {
                        warn!(path = %output.display(), error = %e, "failed to remove local artifact");
                    }
                }
                let completion = AnalysisCompleted::success(
                    request,
                    analysis_type,
                    invocation_id,
                    stored.key.clone(),
                );
                (completion, Some(stored))
            }
            Ok(_) => {
                let completion = AnalysisCompleted::failure(
                    request,
                    analysis_type,
                    invocation_id,
                    AnalysisStatus::Failed,
                    "artifact store returned an empty key",
                );
                (completion, None)
            }
            Err(e) => {
                warn!(error = %e, output = %output.display(), "failed to store artifact");
                let completion = AnalysisCompleted::failure(
                    request,
                    analysis_type,
                    invocation_id,
                    AnalysisStatus::Failed,
                    format!("failed to store result: {e}"),
                );
                (completion, None)
            }
        }
    }

    async fn record_start(&self, file_path: &str, analysis_type: &str) -> Option<Uuid> {
        let records = self.records.as_ref()?;
        match records.record_analysis_start(file_path, analysis_type).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "failed to record analysis start");
                None
            }
        }
    }

    async fn record_status(&self, id: Uuid, completion: &AnalysisCompleted) {
        let Some(records) = &self.records else {
            return;
        };
        if let Err(e) = records
            .record_analysis_status(id, completion.status, completion.error_message.as_deref())
            .await
        {
            warn!(analysis_id = %id, error = %e, "failed to record analysis status");
        }
    }

    async fn record_result(&self, id: Uuid, stored: &StoredArtifact) {
        let Some(records) = &self.records else {
            return;
        };
        let result = ResultRecord {
            result_type: RESULT_REPORT.to_string(),
            storage_type: stored.storage_type.clone(),
            storage_key: stored.key.clone(),
            content_type: stored.content_type.clone(),
            size_bytes: stored.size_bytes,
        };
        if let Err(e) = records.record_result(id, &result).await {
            warn!(analysis_id = %id, error = %e, "failed to record analysis result");
        }
    }
}
