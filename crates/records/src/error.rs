use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("analysis {0} not found")]
    AnalysisNotFound(Uuid),

    #[error("invalid record: {0}")]
    Invalid(String),
}
