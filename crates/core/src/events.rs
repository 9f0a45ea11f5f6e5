//! Event payloads carried through the broker.
//!
//! Every payload is serialized as camelCase JSON and carries a UTC `timestamp`.
//! The routing key of an event is derived from its [`EventKind`] and file type,
//! e.g. `analysis.requested.csv`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::file_type::{normalize_extension, routing_segment};

// ── Kinds ────────────────────────────────────────────────────────────

/// The three payload kinds flowing through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    FileDetected,
    AnalysisRequested,
    AnalysisCompleted,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [
        EventKind::FileDetected,
        EventKind::AnalysisRequested,
        EventKind::AnalysisCompleted,
    ];

    /// Dotted schema name, also used as the queue name and routing-key prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileDetected => "file.detected",
            Self::AnalysisRequested => "analysis.requested",
            Self::AnalysisCompleted => "analysis.completed",
        }
    }

    /// Suffix of the topic exchange this kind is published to.
    pub fn exchange_suffix(&self) -> &'static str {
        match self {
            Self::FileDetected => "file.events",
            Self::AnalysisRequested => "analysis.events",
            Self::AnalysisCompleted => "result.events",
        }
    }

    /// Full exchange name under the given prefix, e.g. `biomarker.analysis.events`.
    pub fn exchange_name(&self, prefix: &str) -> String {
        format!("{prefix}.{}", self.exchange_suffix())
    }

    pub fn queue_name(&self) -> &'static str {
        self.as_str()
    }

    /// Binding pattern matching every file type of this kind.
    pub fn binding_pattern(&self) -> String {
        format!("{}.*", self.as_str())
    }

    pub fn routing_key(&self, file_type: &str) -> String {
        format!("{}.{}", self.as_str(), routing_segment(file_type))
    }

    pub fn from_schema(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed payload with a fixed kind and a file type to route on.
pub trait Event: Serialize + DeserializeOwned + Send + Sync {
    const KIND: EventKind;

    fn file_type(&self) -> &str;

    fn routing_key(&self) -> String {
        Self::KIND.routing_key(self.file_type())
    }
}

// ── Payloads ─────────────────────────────────────────────────────────

/// Emitted by the detector when a new or modified file appears.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDetected {
    pub file_path: String,
    /// Extension including the leading dot, e.g. `.csv`.
    pub file_type: String,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
}

impl FileDetected {
    pub fn new(file_path: impl Into<String>, file_type: &str, size: u64) -> Self {
        Self {
            file_path: file_path.into(),
            file_type: normalize_extension(file_type),
            size,
            timestamp: Utc::now(),
        }
    }
}

impl Event for FileDetected {
    const KIND: EventKind = EventKind::FileDetected;

    fn file_type(&self) -> &str {
        &self.file_type
    }
}

/// Asks a worker to run the analysis for a detected file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequested {
    pub file_path: String,
    pub file_type: String,
    /// When the request was made. `processingTime` on completion is measured from here.
    pub timestamp: DateTime<Utc>,
}

impl AnalysisRequested {
    /// Build the request that follows a detection, stamped now.
    pub fn from_detection(detected: &FileDetected) -> Self {
        Self {
            file_path: detected.file_path.clone(),
            file_type: normalize_extension(&detected.file_type),
            timestamp: Utc::now(),
        }
    }
}

impl Event for AnalysisRequested {
    const KIND: EventKind = EventKind::AnalysisRequested;

    fn file_type(&self) -> &str {
        &self.file_type
    }
}

/// Terminal status of one analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Success,
    Failed,
    Timeout,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reports the end of an analysis, successful or not.
///
/// `result_key` is non-empty exactly when `status` is [`AnalysisStatus::Success`];
/// build values with [`AnalysisCompleted::success`] or [`AnalysisCompleted::failure`]
/// to keep that true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisCompleted {
    pub file_path: String,
    pub file_type: String,
    #[serde(default)]
    pub result_key: String,
    pub analysis_type: String,
    #[serde(default)]
    pub analysis_id: Option<Uuid>,
    /// Milliseconds elapsed since the originating request's timestamp.
    #[serde(rename = "processingTime")]
    pub processing_time_ms: u64,
    pub status: AnalysisStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AnalysisCompleted {
    pub fn success(
        request: &AnalysisRequested,
        analysis_type: impl Into<String>,
        analysis_id: Option<Uuid>,
        result_key: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            file_path: request.file_path.clone(),
            file_type: request.file_type.clone(),
            result_key: result_key.into(),
            analysis_type: analysis_type.into(),
            analysis_id,
            processing_time_ms: elapsed_ms(request.timestamp, now),
            status: AnalysisStatus::Success,
            error_message: None,
            timestamp: now,
        }
    }

    /// A failed or timed-out completion. `status` must not be `Success`;
    /// if it is, it is downgraded to `Failed` since there is no result key.
    pub fn failure(
        request: &AnalysisRequested,
        analysis_type: impl Into<String>,
        analysis_id: Option<Uuid>,
        status: AnalysisStatus,
        error: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let status = match status {
            AnalysisStatus::Success => AnalysisStatus::Failed,
            other => other,
        };
        Self {
            file_path: request.file_path.clone(),
            file_type: request.file_type.clone(),
            result_key: String::new(),
            analysis_type: analysis_type.into(),
            analysis_id,
            processing_time_ms: elapsed_ms(request.timestamp, now),
            status,
            error_message: Some(error.into()),
            timestamp: now,
        }
    }
}

impl Event for AnalysisCompleted {
    const KIND: EventKind = EventKind::AnalysisCompleted;

    fn file_type(&self) -> &str {
        &self.file_type
    }
}

/// Non-negative milliseconds between two instants (clock skew clamps to zero).
fn elapsed_ms(since: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (now - since).num_milliseconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn routing_keys_follow_kind_and_type() {
        assert_eq!(EventKind::FileDetected.routing_key(".csv"), "file.detected.csv");
        assert_eq!(
            EventKind::AnalysisRequested.routing_key(".sas7bdat"),
            "analysis.requested.sas7bdat"
        );
        assert_eq!(
            EventKind::AnalysisCompleted.routing_key("csv"),
            "analysis.completed.csv"
        );
    }

    #[test]
    fn exchange_names_use_prefix() {
        assert_eq!(EventKind::FileDetected.exchange_name("biomarker"), "biomarker.file.events");
        assert_eq!(
            EventKind::AnalysisRequested.exchange_name("biomarker"),
            "biomarker.analysis.events"
        );
        assert_eq!(
            EventKind::AnalysisCompleted.exchange_name("biomarker"),
            "biomarker.result.events"
        );
    }

    #[test]
    fn schema_names_parse_back() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_schema(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::from_schema("nope"), None);
    }

    #[test]
    fn file_detected_json_is_camel_case() {
        let event = FileDetected::new("/data/a.csv", "CSV", 120);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["filePath"], "/data/a.csv");
        assert_eq!(json["fileType"], ".csv");
        assert_eq!(json["size"], 120);
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn request_inherits_path_and_type() {
        let detected = FileDetected::new("/data/a.csv", ".csv", 120);
        let request = AnalysisRequested::from_detection(&detected);
        assert_eq!(request.file_path, "/data/a.csv");
        assert_eq!(request.routing_key(), "analysis.requested.csv");
    }

    #[test]
    fn processing_time_measured_from_request() {
        let request = AnalysisRequested {
            file_path: "/data/a.csv".into(),
            file_type: ".csv".into(),
            timestamp: Utc::now() - Duration::seconds(3),
        };
        let done = AnalysisCompleted::success(&request, "descriptive", None, "results/x.html");
        assert!(done.processing_time_ms >= 3000);
        assert_eq!(done.status, AnalysisStatus::Success);
        assert!(!done.result_key.is_empty());
        assert!(done.error_message.is_none());
    }

    #[test]
    fn failure_never_carries_result_key() {
        let request = AnalysisRequested {
            file_path: "/data/a.csv".into(),
            file_type: ".csv".into(),
            timestamp: Utc::now(),
        };
        let done = AnalysisCompleted::failure(
            &request,
            "descriptive",
            None,
            AnalysisStatus::Success,
            "no output",
        );
        assert_eq!(done.status, AnalysisStatus::Failed);
        assert!(done.result_key.is_empty());

        let json = serde_json::to_value(&done).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["errorMessage"], "no output");
        assert!(json.get("processingTime").is_some());
    }

    #[test]
    fn future_request_timestamp_clamps_to_zero() {
        let request = AnalysisRequested {
            file_path: "/data/a.csv".into(),
            file_type: ".csv".into(),
            timestamp: Utc::now() + Duration::seconds(60),
        };
        let done =
            AnalysisCompleted::failure(&request, "descriptive", None, AnalysisStatus::Timeout, "t");
        assert_eq!(done.processing_time_ms, 0);
        assert_eq!(done.status, AnalysisStatus::Timeout);
    }
}
