use std::path::PathBuf;

use thiserror::Error;
use watchrabbit_core::ConfigError;

/// Startup faults of the task supervisor. Per-run failures are not errors;
/// they are reported as a [`crate::TaskOutcome`].
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("analysis executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("scripts directory not found: {}", .0.display())]
    ScriptsDirMissing(PathBuf),
}
