//! The fixed set of exchanges, queues and bindings the pipeline needs.
//!
//! Declaration is idempotent: re-declaring with identical parameters is a
//! no-op on the broker, so [`declare`] runs after every (re)connect.

use std::time::Duration;

use tracing::{debug, info};
use watchrabbit_core::EventKind;

use crate::channel::BrokerChannel;
use crate::error::BrokerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeSpec {
    /// A durable topic exchange.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    /// Set as the `x-dead-letter-exchange` argument.
    pub dead_letter_exchange: Option<String>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
            exclusive: false,
            dead_letter_exchange: None,
        }
    }

    pub fn with_dead_letter(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<BindingSpec>,
}

impl Topology {
    /// Exchanges, queues and bindings for the three event kinds.
    ///
    /// With `dead_letter`, every work queue also gets `<queue>.dead`, fed by
    /// the `<prefix>.dead.letter` exchange with the original routing keys.
    pub fn standard(prefix: &str, dead_letter: bool) -> Self {
        let dlx = dead_letter_exchange(prefix);
        let mut topology = Topology::default();

        if dead_letter {
            topology.exchanges.push(ExchangeSpec::topic(&dlx));
        }

        for kind in EventKind::ALL {
            let exchange = kind.exchange_name(prefix);
            let queue = kind.queue_name();

            topology.exchanges.push(ExchangeSpec::topic(&exchange));

            let mut spec = QueueSpec::durable(queue);
            if dead_letter {
                spec = spec.with_dead_letter(&dlx);
            }
            topology.queues.push(spec);
            topology.bindings.push(BindingSpec {
                queue: queue.to_string(),
                exchange,
                pattern: kind.binding_pattern(),
            });

            if dead_letter {
                let dead = dead_letter_queue(queue);
                topology.queues.push(QueueSpec::durable(&dead));
                topology.bindings.push(BindingSpec {
                    queue: dead,
                    exchange: dlx.clone(),
                    pattern: kind.binding_pattern(),
                });
            }
        }

        topology
    }

    pub fn queue(&self, name: &str) -> Option<&QueueSpec> {
        self.queues.iter().find(|q| q.name == name)
    }
}

pub fn dead_letter_exchange(prefix: &str) -> String {
    format!("{prefix}.dead.letter")
}

pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}.dead")
}

/// Declare exchanges, then queues, then bindings, all within `deadline`.
///
/// Stops at the first failure. A partially declared topology is never usable;
/// callers must not consume until this returns `Ok`.
pub async fn declare(
    channel: &dyn BrokerChannel,
    topology: &Topology,
    deadline: Duration,
) -> Result<(), BrokerError> {
    tokio::time::timeout(deadline, declare_all(channel, topology))
        .await
        .map_err(|_| BrokerError::Timeout(deadline))?
}

async fn declare_all(channel: &dyn BrokerChannel, topology: &Topology) -> Result<(), BrokerError> {
    for exchange in &topology.exchanges {
        channel.declare_exchange(exchange).await?;
        debug!(exchange = %exchange.name, "exchange declared");
    }
    for queue in &topology.queues {
        channel.declare_queue(queue).await?;
        debug!(queue = %queue.name, "queue declared");
    }
    for binding in &topology.bindings {
        channel.bind_queue(binding).await?;
        debug!(
            queue = %binding.queue,
            exchange = %binding.exchange,
            pattern = %binding.pattern,
            "queue bound"
        );
    }
    info!(
        exchanges = topology.exchanges.len(),
        queues = topology.queues.len(),
        bindings = topology.bindings.len(),
        "topology declared"
    );
    Ok(())
}
