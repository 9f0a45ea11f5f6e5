use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use watchrabbit_core::config::PostgresConfig;
use watchrabbit_core::file_type::extension_of;
use watchrabbit_core::AnalysisStatus;

use crate::error::RecordError;
use crate::{RecordStore, ResultRecord, STATUS_RUNNING};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// [`RecordStore`] over the `biomarker` schema.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Connect and apply migrations.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, RecordError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(&config.connection_string())
            .await?;
        info!("PostgreSQL connected: {}:{}/{}", config.host, config.port, config.database);

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Record store migrations applied");
        Ok(Self { pool })
    }

    /// `None` when no credentials are configured or the database is unreachable.
    pub async fn init(config: &PostgresConfig) -> Option<Self> {
        if !config.is_configured() {
            warn!("PG_USERNAME not set; analysis records disabled");
            return None;
        }
        match Self::connect(config).await {
            Ok(store) => Some(store),
            Err(e) => {
                warn!("Failed to initialise record store: {}; analysis records disabled", e);
                None
            }
        }
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Find or create the file row without touching an existing size.
    async fn ensure_file(&self, file_path: &str) -> Result<i64, RecordError> {
        let (name, file_type) = file_columns(Path::new(file_path))?;
        let file_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO biomarker.files (file_path, file_name, file_type)
             VALUES ($1, $2, $3)
             ON CONFLICT (file_path) DO UPDATE SET file_path = EXCLUDED.file_path
             RETURNING file_id",
        )
        .bind(file_path)
        .bind(name)
        .bind(file_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(file_id)
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn record_file(&self, path: &Path, size: u64) -> Result<i64, RecordError> {
        let (name, file_type) = file_columns(path)?;
        let size = i64::try_from(size)
            .map_err(|_| RecordError::Invalid(format!("file size {size} out of range")))?;

        let file_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO biomarker.files (file_path, file_name, file_type, file_size)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (file_path) DO UPDATE
                 SET file_size = EXCLUDED.file_size, last_modified = now()
             RETURNING file_id",
        )
        .bind(path.to_string_lossy().into_owned())
        .bind(name)
        .bind(file_type)
        .bind(size)
        .fetch_one(&self.pool)
        .await?;

        debug!(file_id, path = %path.display(), "file recorded");
        Ok(file_id)
    }

    async fn record_analysis_start(
        &self,
        file_path: &str,
        analysis_type: &str,
    ) -> Result<Uuid, RecordError> {
        let file_id = self.ensure_file(file_path).await?;
        let analysis_id = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO biomarker.analyses
                 (analysis_uuid, file_id, analysis_type, status, started_at)
             VALUES ($1, $2, $3, $4, now())",
        )
        .bind(analysis_id)
        .bind(file_id)
        .bind(analysis_type)
        .bind(STATUS_RUNNING)
        .execute(&self.pool)
        .await?;

        debug!(%analysis_id, file_id, analysis_type, "analysis recorded");
        Ok(analysis_id)
    }

    async fn record_analysis_status(
        &self,
        analysis_id: Uuid,
        status: AnalysisStatus,
        error: Option<&str>,
    ) -> Result<(), RecordError> {
        let result = sqlx::query(
            "UPDATE biomarker.analyses
             SET status = $2,
                 error_message = $3,
                 completed_at = now(),
                 duration_ms = (EXTRACT(EPOCH FROM (now() - started_at)) * 1000)::bigint
             WHERE analysis_uuid = $1",
        )
        .bind(analysis_id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RecordError::AnalysisNotFound(analysis_id));
        }
        debug!(%analysis_id, %status, "analysis status recorded");
        Ok(())
    }

    async fn record_result(
        &self,
        analysis_id: Uuid,
        result: &ResultRecord,
    ) -> Result<i64, RecordError> {
        let size = i64::try_from(result.size_bytes).map_err(|_| {
            RecordError::Invalid(format!("result size {} out of range", result.size_bytes))
        })?;

        let result_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO biomarker.results
                 (analysis_id, result_type, storage_type, storage_key, content_type, size_bytes)
             SELECT analysis_id, $2, $3, $4, $5, $6
             FROM biomarker.analyses
             WHERE analysis_uuid = $1
             RETURNING result_id",
        )
        .bind(analysis_id)
        .bind(&result.result_type)
        .bind(&result.storage_type)
        .bind(&result.storage_key)
        .bind(&result.content_type)
        .bind(size)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(RecordError::AnalysisNotFound(analysis_id))?;

        debug!(result_id, %analysis_id, key = %result.storage_key, "result recorded");
        Ok(result_id)
    }
}

/// `file_name` and `file_type` columns for a path.
fn file_columns(path: &Path) -> Result<(String, String), RecordError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| RecordError::Invalid(format!("no file name in {}", path.display())))?;
    let file_type = extension_of(path).unwrap_or_default();
    Ok((name.to_string(), file_type))
}
