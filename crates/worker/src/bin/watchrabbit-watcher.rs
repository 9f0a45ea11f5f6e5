//! watchrabbit-watcher — publishes `FileDetected` for files landing in the
//! configured directories.
//!
//! Publishes to `<prefix>.file.events` with routing key `file.detected.<ext>`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use watchrabbit_broker::{AmqpConnector, ConnectionManager, Publisher, ReconnectPolicy, Topology};
use watchrabbit_core::config::load_dotenv;
use watchrabbit_core::Config;
use watchrabbit_worker::detector::DEFAULT_DEBOUNCE;
use watchrabbit_worker::{Exit, FileDetector, WorkerRunner};

/// Directory watcher for the biomarker pipeline.
#[derive(Parser, Debug)]
#[command(name = "watchrabbit-watcher", version, about)]
struct Cli {
    /// Configuration profile; `PROD` makes `PROD_<KEY>` override `<KEY>`.
    #[arg(long, env = "WATCHRABBIT_PROFILE", default_value = "")]
    profile: String,

    /// Quiet period in milliseconds before a changed file is published.
    #[arg(long, env = "FILEWATCHER_DEBOUNCE_MS", default_value_t = DEFAULT_DEBOUNCE.as_millis() as u64)]
    debounce_ms: u64,

    /// Shutdown timeout in seconds.
    #[arg(long, env = "WATCHER_SHUTDOWN_TIMEOUT", default_value_t = 5)]
    shutdown_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::for_profile(&cli.profile).context("invalid configuration")?;
    config.broker.validate().context("invalid broker configuration")?;
    config.watcher.validate().context("invalid watcher configuration")?;
    config.log_summary();

    let broker = &config.broker;
    let manager = ConnectionManager::new(
        Arc::new(AmqpConnector::new(broker.uri.clone(), broker.prefetch)),
        Topology::standard(&broker.exchange_prefix, broker.dead_letter),
        ReconnectPolicy::from_config(broker),
        broker.declare_timeout(),
    );
    manager
        .start()
        .await
        .with_context(|| format!("failed to connect to {}", broker.redacted_uri()))?;

    let publisher = Arc::new(Publisher::new(manager.clone(), broker.publish_timeout()));
    let detector = FileDetector::new(&config.watcher, publisher, broker.exchange_prefix.clone())
        .with_debounce(Duration::from_millis(cli.debounce_ms));

    let exit = WorkerRunner::run(
        Arc::new(detector),
        manager,
        Duration::from_secs(cli.shutdown_timeout),
        None,
    )
    .await?;

    if exit == Exit::BrokerFailed {
        anyhow::bail!("broker connection could not be re-established");
    }
    info!("watchrabbit-watcher exited cleanly");
    Ok(())
}
