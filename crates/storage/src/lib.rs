pub mod backend;
pub mod error;

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::{Attribute, Attributes, ObjectStore, PutOptions, PutPayload};
use tracing::{info, instrument};
use uuid::Uuid;

pub use backend::{LocalBackend, S3Backend, StorageBackend};
pub use error::StorageError;

pub const HTML_CONTENT_TYPE: &str = "text/html";
pub const STORAGE_LOCAL: &str = "local";
pub const STORAGE_S3: &str = "s3";

/// Descriptive attributes stored next to an artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactMetadata {
    pub content_type: String,
    pub file_type: String,
    pub analysis_type: String,
    pub invocation_id: Uuid,
    pub script: Option<String>,
}

impl ArtifactMetadata {
    pub fn html(file_type: &str, analysis_type: &str, invocation_id: Uuid) -> Self {
        Self {
            content_type: HTML_CONTENT_TYPE.to_string(),
            file_type: file_type.to_string(),
            analysis_type: analysis_type.to_string(),
            invocation_id,
            script: None,
        }
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    /// User metadata as S3 stores it (`x-amz-meta-*`).
    pub fn user_metadata(&self) -> BTreeMap<&'static str, String> {
        let mut meta = BTreeMap::new();
        meta.insert("filetype", self.file_type.clone());
        meta.insert("analysistype", self.analysis_type.clone());
        meta.insert("invocationid", self.invocation_id.to_string());
        if let Some(script) = &self.script {
            meta.insert("script", script.clone());
        }
        meta
    }
}

/// Where an artifact ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub key: String,
    /// `local` or `s3`.
    pub storage_type: String,
    pub content_type: String,
    pub size_bytes: u64,
}

/// Durable home for analysis artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Upload the file at `local` and report the key it was stored under.
    async fn store(
        &self,
        local: &Path,
        metadata: &ArtifactMetadata,
    ) -> Result<StoredArtifact, StorageError>;
}

#[async_trait]
impl<T: ArtifactStore + ?Sized> ArtifactStore for Arc<T> {
    async fn store(
        &self,
        local: &Path,
        metadata: &ArtifactMetadata,
    ) -> Result<StoredArtifact, StorageError> {
        (**self).store(local, metadata).await
    }
}

/// Builds `<prefix>/results/<YYYYMMDD-HHMMSS>/<file name>`.
pub fn artifact_key(prefix: &str, file_name: &str, at: DateTime<Utc>) -> String {
    let stamp = at.format("%Y%m%d-%H%M%S");
    if prefix.is_empty() {
        format!("results/{stamp}/{file_name}")
    } else {
        format!("{prefix}/results/{stamp}/{file_name}")
    }
}

/// [`ArtifactStore`] over an `object_store` backend.
pub struct ObjectArtifactStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    /// `LocalFileSystem` rejects puts that carry attributes.
    attach_attributes: bool,
    location: String,
    storage_type: &'static str,
}

impl ObjectArtifactStore {
    pub fn new(backend: StorageBackend) -> Self {
        Self {
            store: backend.store_arc(),
            prefix: backend.prefix().to_string(),
            attach_attributes: backend.is_remote(),
            location: backend.describe(),
            storage_type: backend.kind(),
        }
    }

    /// Wrap an arbitrary store, e.g. `InMemory` in tests. A store that takes
    /// attributes is treated as S3-compatible.
    pub fn with_store(store: Arc<dyn ObjectStore>, prefix: &str, attach_attributes: bool) -> Self {
        Self {
            location: store.to_string(),
            store,
            prefix: prefix.trim_matches('/').to_string(),
            attach_attributes,
            storage_type: if attach_attributes { STORAGE_S3 } else { STORAGE_LOCAL },
        }
    }

    /// S3 when a bucket is configured, otherwise the local results directory.
    pub fn from_config(config: &watchrabbit_core::Config) -> Result<Self, StorageError> {
        let backend = if config.aws.is_configured() {
            StorageBackend::S3(S3Backend::new(&config.aws)?)
        } else {
            StorageBackend::Local(LocalBackend::new(&config.storage.results_dir)?)
        };
        Ok(Self::new(backend))
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn storage_type(&self) -> &'static str {
        self.storage_type
    }

    /// Read a stored artifact back.
    pub async fn fetch(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = object_store::path::Path::from(key);
        Ok(self.store.get(&path).await?.bytes().await?)
    }

    fn put_options(&self, metadata: &ArtifactMetadata) -> PutOptions {
        if !self.attach_attributes {
            return PutOptions::default();
        }
        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, metadata.content_type.clone().into());
        for (key, value) in metadata.user_metadata() {
            attributes.insert(Attribute::Metadata(Cow::Borrowed(key)), value.into());
        }
        PutOptions {
            attributes,
            ..PutOptions::default()
        }
    }
}

#[async_trait]
impl ArtifactStore for ObjectArtifactStore {
    #[instrument(skip_all, fields(local = %local.display(), invocation_id = %metadata.invocation_id))]
    async fn store(
        &self,
        local: &Path,
        metadata: &ArtifactMetadata,
    ) -> Result<StoredArtifact, StorageError> {
        let file_name = local
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                StorageError::InvalidArtifact(format!("no file name in {}", local.display()))
            })?;

        let data = tokio::fs::read(local).await?;
        let size = data.len();
        let key = artifact_key(&self.prefix, file_name, Utc::now());
        let path = object_store::path::Path::from(key.as_str());

        self.store
            .put_opts(&path, PutPayload::from(data), self.put_options(metadata))
            .await?;

        info!(key = %key, bytes = size, location = %self.location, "artifact stored");
        Ok(StoredArtifact {
            key,
            storage_type: self.storage_type.to_string(),
            content_type: metadata.content_type.clone(),
            size_bytes: size as u64,
        })
    }
}
