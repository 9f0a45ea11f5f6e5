//! Bookkeeping of detected files, analysis runs and their stored results.
//!
//! The pipeline treats every call here as best-effort: callers log failures
//! and carry on.

pub mod error;
pub mod postgres;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;
use watchrabbit_core::AnalysisStatus;

pub use error::RecordError;
pub use postgres::PgRecordStore;

/// Status written when an analysis starts.
pub const STATUS_RUNNING: &str = "running";

/// `result_type` of the HTML report an analysis produces.
pub const RESULT_REPORT: &str = "report";

/// One stored artifact of an analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    pub result_type: String,
    pub storage_type: String,
    pub storage_key: String,
    pub content_type: String,
    pub size_bytes: u64,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Upsert a file row keyed by path and return its id.
    async fn record_file(&self, path: &Path, size: u64) -> Result<i64, RecordError>;

    /// Open an analysis row in the running state and return its id.
    async fn record_analysis_start(
        &self,
        file_path: &str,
        analysis_type: &str,
    ) -> Result<Uuid, RecordError>;

    /// Close an analysis row with its terminal status.
    async fn record_analysis_status(
        &self,
        analysis_id: Uuid,
        status: AnalysisStatus,
        error: Option<&str>,
    ) -> Result<(), RecordError>;

    /// Attach a stored result to an analysis row and return the result id.
    async fn record_result(
        &self,
        analysis_id: Uuid,
        result: &ResultRecord,
    ) -> Result<i64, RecordError>;
}

#[async_trait]
impl<T: RecordStore + ?Sized> RecordStore for Arc<T> {
    async fn record_file(&self, path: &Path, size: u64) -> Result<i64, RecordError> {
        (**self).record_file(path, size).await
    }

    async fn record_analysis_start(
        &self,
        file_path: &str,
        analysis_type: &str,
    ) -> Result<Uuid, RecordError> {
        (**self).record_analysis_start(file_path, analysis_type).await
    }

    async fn record_analysis_status(
        &self,
        analysis_id: Uuid,
        status: AnalysisStatus,
        error: Option<&str>,
    ) -> Result<(), RecordError> {
        (**self)
            .record_analysis_status(analysis_id, status, error)
            .await
    }

    async fn record_result(
        &self,
        analysis_id: Uuid,
        result: &ResultRecord,
    ) -> Result<i64, RecordError> {
        (**self).record_result(analysis_id, result).await
    }
}
