//! Runs one analysis invocation under a wall-clock timeout.
//!
//! The external process is called as `<executable> <script> <input> <output>`.
//! Its exit code alone is not trusted: a zero exit only counts as success when
//! the expected output file exists afterwards.
//!
//! On unix the process leads its own process group, so a timeout kills
//! everything it spawned along with it.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use watchrabbit_core::config::AnalysisConfig;
use watchrabbit_core::file_type::normalize_extension;
use watchrabbit_core::SupportedFileTypes;

use crate::error::AnalysisError;
use crate::outcome::{TaskOutcome, TaskStatus};

/// Only the tail of each captured stream is kept.
const MAX_CAPTURE_BYTES: usize = 16 * 1024;
/// How long to wait for output readers after the process is gone.
const READER_GRACE: Duration = Duration::from_secs(1);

/// Anything that can turn a file into a [`TaskOutcome`].
#[async_trait]
pub trait AnalysisRunner: Send + Sync {
    async fn run(&self, file_path: &str, file_type: &str) -> TaskOutcome;

    /// Label carried as `analysisType` on completion events.
    fn analysis_type(&self) -> &str;
}

/// Resolve the configured executable: a path must exist, a bare name is looked
/// up on `PATH`. Nothing is guessed.
pub fn resolve_executable(configured: &str) -> Result<PathBuf, AnalysisError> {
    let candidate = Path::new(configured);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return if candidate.is_file() {
            Ok(candidate.to_path_buf())
        } else {
            Err(AnalysisError::ExecutableNotFound(configured.to_string()))
        };
    }

    env::var_os("PATH")
        .into_iter()
        .flat_map(|paths| env::split_paths(&paths).collect::<Vec<_>>())
        .map(|dir| dir.join(configured))
        .find(|path| path.is_file())
        .ok_or_else(|| AnalysisError::ExecutableNotFound(configured.to_string()))
}

#[derive(Debug)]
pub struct TaskSupervisor {
    executable: PathBuf,
    script: PathBuf,
    output_dir: PathBuf,
    timeout: Duration,
    supported: SupportedFileTypes,
    analysis_type: String,
}

impl TaskSupervisor {
    /// Validate configuration and build a supervisor. A missing executable or
    /// scripts directory is fatal.
    pub fn new(config: &AnalysisConfig, supported: SupportedFileTypes) -> Result<Self, AnalysisError> {
        config.validate()?;
        let configured = config
            .executable
            .as_deref()
            .ok_or(watchrabbit_core::ConfigError::Missing("ANALYSIS_EXECUTABLE"))?;
        let executable = resolve_executable(configured)?;

        if !config.scripts_dir.is_dir() {
            return Err(AnalysisError::ScriptsDirMissing(config.scripts_dir.clone()));
        }

        info!(
            executable = %executable.display(),
            scripts_dir = %config.scripts_dir.display(),
            timeout_secs = config.timeout_secs,
            "task supervisor ready"
        );

        Ok(Self {
            executable,
            script: config.script_path(),
            output_dir: config.output_dir.clone(),
            timeout: config.timeout(),
            supported,
            analysis_type: config.analysis_type.clone(),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `<output_dir>/<YYYYMMDD>/analysis_<stem>_<id8>.html`
    pub fn output_path(&self, file_path: &str, invocation_id: &Uuid, now: DateTime<Utc>) -> PathBuf {
        let stem = Path::new(file_path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("input");
        let short_id: String = invocation_id.simple().to_string().chars().take(8).collect();
        self.output_dir
            .join(now.format("%Y%m%d").to_string())
            .join(format!("analysis_{stem}_{short_id}.html"))
    }

    async fn execute(&self, input: &str, output: &Path) -> Execution {
        if let Some(dir) = output.parent() {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                return Execution::Failed(format!("failed to create output directory: {e}"));
            }
        }
        if !self.script.is_file() {
            return Execution::Failed(format!("analysis script not found: {}", self.script.display()));
        }

        let mut command = Command::new(&self.executable);
        command
            .arg(&self.script)
            .arg(input)
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return Execution::Failed(format!("failed to start analysis process: {e}")),
        };

        let pid = child.id();
        let mut group = ProcessGroup::new(pid);
        debug!(?pid, "analysis process started");
        let stdout = child.stdout.take().map(capture);
        let stderr = child.stderr.take().map(capture);

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = tokio::time::sleep(self.timeout) => None,
        };

        match waited {
            None => {
                warn!(?pid, timeout = ?self.timeout, "analysis timed out, killing process group");
                group.kill();
                if let Err(e) = child.kill().await {
                    warn!(?pid, error = %e, "failed to kill analysis process");
                }
                let _ = collect(stdout).await;
                let _ = collect(stderr).await;
                Execution::TimedOut
            }
            Some(Err(e)) => Execution::Failed(format!("failed waiting for analysis process: {e}")),
            Some(Ok(status)) => {
                group.disarm();
                Execution::Exited {
                    status,
                    stdout: collect(stdout).await,
                    stderr: collect(stderr).await,
                }
            }
        }
    }
}

/// The process group led by the analysis process. Killed on timeout, and on
/// drop while still armed, so a cancelled run leaves nothing behind.
struct ProcessGroup {
    leader: Option<u32>,
}

impl ProcessGroup {
    fn new(leader: Option<u32>) -> Self {
        Self { leader }
    }

    /// The leader exited on its own; leave the group alone.
    fn disarm(&mut self) {
        self.leader = None;
    }

    #[cfg(unix)]
    fn kill(&mut self) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(leader) = self.leader.take() else {
            return;
        };
        let Ok(raw) = i32::try_from(leader) else {
            return;
        };
        match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) => debug!(pgid = raw, "analysis process group killed"),
            Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => warn!(pgid = raw, error = %e, "failed to kill analysis process group"),
        }
    }

    #[cfg(not(unix))]
    fn kill(&mut self) {
        self.leader = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

enum Execution {
    Exited {
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },
    Failed(String),
    TimedOut,
}

fn capture<R: AsyncRead + Unpin + Send + 'static>(mut reader: R) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf).await;
        let start = buf.len().saturating_sub(MAX_CAPTURE_BYTES);
        String::from_utf8_lossy(&buf[start..]).into_owned()
    })
}

/// Join a reader task, giving up if a leftover grandchild holds the pipe open.
async fn collect(handle: Option<JoinHandle<String>>) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(READER_GRACE, &mut handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            handle.abort();
            String::new()
        }
    }
}

#[async_trait]
impl AnalysisRunner for TaskSupervisor {
    #[instrument(skip(self), fields(invocation_id = tracing::field::Empty))]
    async fn run(&self, file_path: &str, file_type: &str) -> TaskOutcome {
        let invocation_id = Uuid::new_v4();
        tracing::Span::current().record("invocation_id", tracing::field::display(&invocation_id));
        let file_type = normalize_extension(file_type);
        let started_at = Utc::now();
        let clock = Instant::now();

        let mut metadata = BTreeMap::new();
        metadata.insert("fileType".to_string(), file_type.clone());
        metadata.insert("analysisType".to_string(), self.analysis_type.clone());

        let status = if !self.supported.contains(&file_type) {
            warn!(file_type = %file_type, "unsupported file type, not running analysis");
            TaskStatus::Failed {
                error: format!("unsupported file type: {file_type}"),
            }
        } else {
            let output = self.output_path(file_path, &invocation_id, started_at);
            if let Some(script) = self.script.file_name().and_then(|s| s.to_str()) {
                metadata.insert("script".to_string(), script.to_string());
            }
            info!(output = %output.display(), "running analysis");

            match self.execute(file_path, &output).await {
                Execution::TimedOut => TaskStatus::TimedOut {
                    error: format!("analysis timed out after {}s", self.timeout.as_secs()),
                },
                Execution::Failed(error) => TaskStatus::Failed { error },
                Execution::Exited { status, stderr, .. } if !status.success() => TaskStatus::Failed {
                    error: format!("analysis exited with {status}: {}", stderr.trim()),
                },
                Execution::Exited { stdout, .. } => {
                    if tokio::fs::metadata(&output).await.is_ok() {
                        TaskStatus::Succeeded { output, stdout }
                    } else {
                        TaskStatus::Failed {
                            error: format!(
                                "analysis exited successfully but produced no output at {}",
                                output.display()
                            ),
                        }
                    }
                }
            }
        };

        let outcome = TaskOutcome {
            invocation_id,
            file_path: file_path.to_string(),
            file_type,
            status,
            started_at,
            finished_at: Utc::now(),
            duration: clock.elapsed(),
            metadata,
        };

        match &outcome.status {
            TaskStatus::Succeeded { output, .. } => info!(
                duration_ms = outcome.duration.as_millis() as u64,
                output = %output.display(),
                "analysis succeeded"
            ),
            TaskStatus::Failed { error } => warn!(error = %error, "analysis failed"),
            TaskStatus::TimedOut { error } => warn!(error = %error, "analysis timed out"),
        }
        outcome
    }

    fn analysis_type(&self) -> &str {
        &self.analysis_type
    }
}
