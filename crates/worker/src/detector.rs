//! Filesystem watcher that publishes `FileDetected` for new or changed files.
//!
//! Raw notify events are coalesced per path: a path is published once it has
//! been quiet for the debounce window, so a file written in several chunks
//! yields one detection.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use watchrabbit_broker::{BrokerError, EventPublisher};
use watchrabbit_core::config::WatcherConfig;
use watchrabbit_core::file_type::extension_of;
use watchrabbit_core::{FileDetected, SupportedFileTypes};

use crate::error::WorkerError;
use crate::worker::Worker;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Whether a notify event can signal new file content.
pub fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(CreateKind::File | CreateKind::Any)
            | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any)
            | EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Both))
    )
}

/// Publishes detections for one set of supported types.
struct Detection {
    supported: SupportedFileTypes,
    publisher: Arc<dyn EventPublisher>,
    exchange_prefix: String,
}

impl Detection {
    /// Normalised extension of `path` when it is a supported, non-hidden file name.
    fn candidate(&self, path: &Path) -> Option<String> {
        let name = path.file_name()?.to_str()?;
        if name.starts_with('.') {
            return None;
        }
        extension_of(path).filter(|ext| self.supported.contains(ext))
    }

    async fn detect(&self, path: &Path) -> Result<Option<FileDetected>, BrokerError> {
        let Some(file_type) = self.candidate(path) else {
            return Ok(None);
        };
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(None),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "file vanished before detection");
                return Ok(None);
            }
        };

        let event = FileDetected::new(path.to_string_lossy(), &file_type, meta.len());
        self.publisher
            .publish_event(&self.exchange_prefix, &event)
            .await?;
        info!(path = %path.display(), size = meta.len(), "file detected");
        Ok(Some(event))
    }
}

struct Running {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

/// Watches directories (non-recursively) and publishes to `<prefix>.file.events`.
pub struct FileDetector {
    directories: Vec<PathBuf>,
    debounce: Duration,
    detection: Arc<Detection>,
    running: Mutex<Option<Running>>,
}

impl FileDetector {
    pub fn new(
        config: &WatcherConfig,
        publisher: Arc<dyn EventPublisher>,
        exchange_prefix: impl Into<String>,
    ) -> Self {
        Self {
            directories: config.directories.clone(),
            debounce: DEFAULT_DEBOUNCE,
            detection: Arc::new(Detection {
                supported: config.supported.clone(),
                publisher,
                exchange_prefix: exchange_prefix.into(),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Inspect one path and publish a detection if it qualifies.
    pub async fn detect(&self, path: &Path) -> Result<Option<FileDetected>, BrokerError> {
        self.detection.detect(path).await
    }
}

#[async_trait]
impl Worker for FileDetector {
    async fn start(&self) -> Result<(), WorkerError> {
        let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) if is_relevant(&event.kind) => {
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "filesystem watcher error"),
            }
        })?;

        for dir in &self.directories {
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
            info!(path = %dir.display(), "watching directory");
        }

        let task = tokio::spawn(debounce_loop(rx, self.detection.clone(), self.debounce));
        let previous = self
            .running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(Running {
                _watcher: watcher,
                task,
            });
        if let Some(previous) = previous {
            previous.task.abort();
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), WorkerError> {
        let running = self.running.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(running) = running {
            running.task.abort();
            info!("file watcher stopped");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "watchrabbit-watcher"
    }
}

async fn debounce_loop(
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
    detection: Arc<Detection>,
    debounce: Duration,
) {
    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
    let mut ticker = tokio::time::interval((debounce / 2).max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(path) => {
                    if detection.candidate(&path).is_some() {
                        pending.insert(path, Instant::now());
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                let ready: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, seen)| seen.elapsed() >= debounce)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in ready {
                    pending.remove(&path);
                    if let Err(e) = detection.detect(&path).await {
                        warn!(path = %path.display(), error = %e, "failed to publish file detection");
                    }
                }
            }
        }
    }
}
