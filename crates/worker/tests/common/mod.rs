//! Recording doubles for the worker's collaborators.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use watchrabbit_analysis::{AnalysisRunner, TaskOutcome, TaskStatus};
use watchrabbit_broker::{BrokerError, Envelope, EventPublisher};
use watchrabbit_core::AnalysisStatus;
use watchrabbit_records::{RecordError, RecordStore, ResultRecord};
use watchrabbit_storage::{ArtifactMetadata, ArtifactStore, StorageError, StoredArtifact};

// ── Publisher ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub envelope: Envelope,
}

#[derive(Default)]
pub struct MockPublisher {
    messages: Mutex<Vec<Published>>,
    fail: AtomicBool,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<Published> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for MockPublisher {
    async fn publish_envelope(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), BrokerError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish("broker unavailable".into()));
        }
        self.messages.lock().unwrap().push(Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            envelope,
        });
        Ok(())
    }
}

// ── Runner ───────────────────────────────────────────────────────────

pub enum Scripted {
    /// Write an HTML artifact into this directory and succeed.
    Succeed(PathBuf),
    Fail(String),
    TimeOut,
}

pub struct MockRunner {
    scripted: Scripted,
    calls: AtomicU32,
}

impl MockRunner {
    pub fn new(scripted: Scripted) -> Self {
        Self {
            scripted,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalysisRunner for MockRunner {
    async fn run(&self, file_path: &str, file_type: &str) -> TaskOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let invocation_id = Uuid::new_v4();
        let started_at = Utc::now();

        let status = match &self.scripted {
            Scripted::Succeed(dir) => {
                std::fs::create_dir_all(dir).unwrap();
                let output = dir.join(format!("analysis_{}.html", &invocation_id.to_string()[..8]));
                std::fs::write(&output, "<html>report</html>").unwrap();
                TaskStatus::Succeeded {
                    output,
                    stdout: String::new(),
                }
            }
            Scripted::Fail(error) => TaskStatus::Failed {
                error: error.clone(),
            },
            Scripted::TimeOut => TaskStatus::TimedOut {
                error: "analysis timed out after 1s".into(),
            },
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("script".to_string(), "mock.R".to_string());
        TaskOutcome {
            invocation_id,
            file_path: file_path.to_string(),
            file_type: file_type.to_string(),
            status,
            started_at,
            finished_at: Utc::now(),
            duration: Duration::from_millis(1),
            metadata,
        }
    }

    fn analysis_type(&self) -> &str {
        "descriptive"
    }
}

// ── Artifact store ───────────────────────────────────────────────────

#[derive(Default)]
pub struct MockArtifacts {
    stored: Mutex<Vec<(PathBuf, ArtifactMetadata)>>,
    fail: AtomicBool,
}

impl MockArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let store = Self::default();
        store.fail.store(true, Ordering::SeqCst);
        store
    }

    pub fn stored(&self) -> Vec<(PathBuf, ArtifactMetadata)> {
        self.stored.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactStore for MockArtifacts {
    async fn store(
        &self,
        local: &Path,
        metadata: &ArtifactMetadata,
    ) -> Result<StoredArtifact, StorageError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::NotConfigured("bucket unreachable".into()));
        }
        self.stored
            .lock()
            .unwrap()
            .push((local.to_path_buf(), metadata.clone()));
        let name = local.file_name().unwrap().to_string_lossy();
        Ok(StoredArtifact {
            key: format!("results/20240101-000000/{name}"),
            storage_type: "s3".into(),
            content_type: metadata.content_type.clone(),
            size_bytes: std::fs::metadata(local).map(|m| m.len()).unwrap_or(0),
        })
    }
}

// ── Record store ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum RecordCall {
    File(PathBuf, u64),
    Start(String, String),
    Status(Uuid, AnalysisStatus, Option<String>),
    Result(Uuid, ResultRecord),
}

#[derive(Default)]
pub struct MockRecords {
    calls: Mutex<Vec<RecordCall>>,
    fail: AtomicBool,
}

impl MockRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let records = Self::default();
        records.fail.store(true, Ordering::SeqCst);
        records
    }

    pub fn calls(&self) -> Vec<RecordCall> {
        self.calls.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), RecordError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(RecordError::Invalid("database down".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RecordStore for MockRecords {
    async fn record_file(&self, path: &Path, size: u64) -> Result<i64, RecordError> {
        self.calls
            .lock()
            .unwrap()
            .push(RecordCall::File(path.to_path_buf(), size));
        self.check()?;
        Ok(1)
    }

    async fn record_analysis_start(
        &self,
        file_path: &str,
        analysis_type: &str,
    ) -> Result<Uuid, RecordError> {
        self.calls.lock().unwrap().push(RecordCall::Start(
            file_path.to_string(),
            analysis_type.to_string(),
        ));
        self.check()?;
        Ok(Uuid::new_v4())
    }

    async fn record_analysis_status(
        &self,
        analysis_id: Uuid,
        status: AnalysisStatus,
        error: Option<&str>,
    ) -> Result<(), RecordError> {
        self.calls.lock().unwrap().push(RecordCall::Status(
            analysis_id,
            status,
            error.map(str::to_string),
        ));
        self.check()
    }

    async fn record_result(
        &self,
        analysis_id: Uuid,
        result: &ResultRecord,
    ) -> Result<i64, RecordError> {
        self.calls
            .lock()
            .unwrap()
            .push(RecordCall::Result(analysis_id, result.clone()));
        self.check()?;
        Ok(1)
    }
}
