//! Worker trait and lifecycle management.
//!
//! [`WorkerRunner`] starts a [`Worker`], then waits for SIGINT/SIGTERM, a
//! programmatic shutdown, or the broker connection giving up for good. On
//! the way out the worker is stopped and the connection closed
//! intentionally, both bounded by a shutdown timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use watchrabbit_broker::{ConnectionManager, ConnectionState};

use crate::error::WorkerError;

/// A long-running process attached to the broker.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Called once after the broker connection is up.
    async fn start(&self) -> Result<(), WorkerError>;

    /// Called once during shutdown, before the connection is closed.
    async fn stop(&self) -> Result<(), WorkerError>;

    fn name(&self) -> &str;
}

/// Why [`WorkerRunner::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// OS signal or programmatic shutdown.
    Shutdown,
    /// The connection manager exhausted its reconnect budget.
    BrokerFailed,
}

pub struct WorkerRunner;

impl WorkerRunner {
    pub async fn run(
        worker: Arc<dyn Worker>,
        manager: Arc<ConnectionManager>,
        shutdown_timeout: Duration,
        shutdown_notify: Option<Arc<Notify>>,
    ) -> Result<Exit, WorkerError> {
        let name = worker.name().to_string();
        info!(worker = %name, "starting worker");
        if let Err(e) = worker.start().await {
            manager.close().await;
            return Err(e);
        }
        info!(worker = %name, "worker started");

        let exit = tokio::select! {
            _ = Self::wait_for_shutdown(shutdown_notify) => {
                info!(worker = %name, "shutdown signal received");
                Exit::Shutdown
            }
            _ = Self::wait_for_failure(&manager) => {
                error!(worker = %name, "broker connection failed permanently");
                Exit::BrokerFailed
            }
        };

        info!(worker = %name, timeout = ?shutdown_timeout, "stopping worker");
        match tokio::time::timeout(shutdown_timeout, worker.stop()).await {
            Ok(Ok(())) => info!(worker = %name, "worker stopped gracefully"),
            Ok(Err(e)) => warn!(worker = %name, error = %e, "worker stop returned error"),
            Err(_) => warn!(worker = %name, "worker stop timed out, forcing shutdown"),
        }

        if tokio::time::timeout(shutdown_timeout, manager.close()).await.is_err() {
            warn!(worker = %name, "broker close timed out");
        }

        info!(worker = %name, ?exit, "worker shutdown complete");
        Ok(exit)
    }

    async fn wait_for_failure(manager: &ConnectionManager) {
        let mut state = manager.watch_state();
        if state
            .wait_for(|s| *s == ConnectionState::Failed)
            .await
            .is_err()
        {
            // Sender lives as long as the manager; never resolve.
            std::future::pending::<()>().await;
        }
    }

    /// Wait for either an OS shutdown signal or a programmatic notification.
    async fn wait_for_shutdown(external: Option<Arc<Notify>>) {
        match external {
            Some(notify) => {
                tokio::select! {
                    _ = Self::os_signal() => {}
                    _ = notify.notified() => {}
                }
            }
            None => Self::os_signal().await,
        }
    }

    /// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C (cross-platform fallback).
    async fn os_signal() {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
            let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to listen for ctrl_c");
        }
    }
}
