use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;
use watchrabbit_core::AnalysisStatus;

/// Terminal state of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded { output: PathBuf, stdout: String },
    Failed { error: String },
    TimedOut { error: String },
}

/// Result of one supervised run, handed to the orchestrator and then dropped.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub invocation_id: Uuid,
    pub file_path: String,
    pub file_type: String,
    #[serde(flatten)]
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub metadata: BTreeMap<String, String>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, TaskStatus::Succeeded { .. })
    }

    pub fn output(&self) -> Option<&Path> {
        match &self.status {
            TaskStatus::Succeeded { output, .. } => Some(output),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.status {
            TaskStatus::Failed { error } | TaskStatus::TimedOut { error } => Some(error),
            TaskStatus::Succeeded { .. } => None,
        }
    }

    /// The wire status this outcome maps to.
    pub fn analysis_status(&self) -> AnalysisStatus {
        match self.status {
            TaskStatus::Succeeded { .. } => AnalysisStatus::Success,
            TaskStatus::Failed { .. } => AnalysisStatus::Failed,
            TaskStatus::TimedOut { .. } => AnalysisStatus::Timeout,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
