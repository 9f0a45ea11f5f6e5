//! watchrabbit-worker — runs the analysis event chain.
//!
//! Consumes:
//! - `file.detected` — turns supported detections into analysis requests
//! - `analysis.requested` — runs the analysis, stores the report, publishes the completion
//!
//! Publishes to `<prefix>.analysis.events` and `<prefix>.result.events`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use watchrabbit_analysis::TaskSupervisor;
use watchrabbit_broker::{
    AmqpConnector, ConnectionManager, Publisher, ReconnectPolicy, RedeliveryPolicy, Topology,
};
use watchrabbit_core::config::load_dotenv;
use watchrabbit_core::Config;
use watchrabbit_records::PgRecordStore;
use watchrabbit_storage::ObjectArtifactStore;
use watchrabbit_worker::{EventChain, Exit, PipelineWorker, WorkerRunner};

/// Analysis worker for the biomarker pipeline.
#[derive(Parser, Debug)]
#[command(name = "watchrabbit-worker", version, about)]
struct Cli {
    /// Configuration profile; `PROD` makes `PROD_<KEY>` override `<KEY>`.
    #[arg(long, env = "WATCHRABBIT_PROFILE", default_value = "")]
    profile: String,

    /// Shutdown timeout in seconds.
    #[arg(long, env = "WORKER_SHUTDOWN_TIMEOUT", default_value_t = 10)]
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
    config.validate().context("invalid configuration")?;
    config.log_summary();

    let supervisor = TaskSupervisor::new(&config.analysis, config.watcher.supported.clone())
        .context("failed to initialise analysis supervisor")?;
    let artifacts =
        ObjectArtifactStore::from_config(&config).context("failed to initialise artifact storage")?;
    info!(location = %artifacts.location(), "artifact storage ready");
    let records = PgRecordStore::init(&config.postgres).await;

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
    let mut chain = EventChain::new(
        publisher,
        Arc::new(supervisor),
        Arc::new(artifacts),
        config.watcher.supported.clone(),
        broker.exchange_prefix.clone(),
    )
    .discard_output(!config.analysis.retain_output);
    if let Some(records) = records {
        chain = chain.with_records(Arc::new(records));
    }

    let policy = if broker.dead_letter {
        RedeliveryPolicy::capped(broker.max_redeliveries)
    } else {
        RedeliveryPolicy::unbounded()
    };
    let worker = Arc::new(PipelineWorker::new(manager.clone(), Arc::new(chain), policy));

    let exit = WorkerRunner::run(
        worker,
        manager,
        Duration::from_secs(cli.shutdown_timeout),
        None,
    )
    .await?;

    if exit == Exit::BrokerFailed {
        anyhow::bail!("broker connection could not be re-established");
    }
    info!("watchrabbit-worker exited cleanly");
    Ok(())
}
