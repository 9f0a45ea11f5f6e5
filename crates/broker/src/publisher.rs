use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use watchrabbit_core::Event;

use crate::connection::ConnectionManager;
use crate::error::BrokerError;
use crate::message::Envelope;

/// Hands envelopes to a named exchange.
///
/// Publishes are never retried here: a failure is returned to the caller,
/// which decides whether resending is safe.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_envelope(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), BrokerError>;

    /// Serialize `event` and publish it to an explicit exchange and key.
    async fn publish<E: Event + 'static>(
        &self,
        exchange: &str,
        routing_key: &str,
        event: &E,
    ) -> Result<(), BrokerError>
    where
        Self: Sized,
    {
        let envelope = Envelope::encode(event)?;
        self.publish_envelope(exchange, routing_key, envelope).await
    }

    /// Publish `event` to its kind's exchange under `prefix`, keyed by its routing key.
    async fn publish_event<E: Event + 'static>(&self, prefix: &str, event: &E) -> Result<(), BrokerError>
    where
        Self: Sized,
    {
        let exchange = E::KIND.exchange_name(prefix);
        let routing_key = event.routing_key();
        self.publish(&exchange, &routing_key, event).await
    }
}

/// Blanket implementation so `Arc<dyn EventPublisher>` can be used directly.
#[async_trait]
impl<T: EventPublisher + ?Sized> EventPublisher for Arc<T> {
    async fn publish_envelope(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), BrokerError> {
        (**self).publish_envelope(exchange, routing_key, envelope).await
    }
}

/// Publishes through whatever channel the [`ConnectionManager`] currently holds.
///
/// The channel handle is read once per call, so a publish racing a reconnect
/// either completes on the old channel or fails cleanly.
pub struct Publisher {
    manager: Arc<ConnectionManager>,
    deadline: Duration,
}

impl Publisher {
    pub fn new(manager: Arc<ConnectionManager>, deadline: Duration) -> Self {
        Self { manager, deadline }
    }
}

#[async_trait]
impl EventPublisher for Publisher {
    async fn publish_envelope(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), BrokerError> {
        let channel = self.manager.channel().ok_or_else(|| {
            BrokerError::Publish(format!("not connected (state: {})", self.manager.state()))
        })?;

        match tokio::time::timeout(self.deadline, channel.publish(exchange, routing_key, &envelope)).await {
            Ok(Ok(())) => {
                debug!(
                    exchange,
                    routing_key,
                    kind = %envelope.kind,
                    message_id = %envelope.message_id,
                    "published"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(exchange, routing_key, error = %e, "publish failed");
                if !channel.is_open() {
                    self.manager.report_fault("publish on closed channel");
                }
                Err(e)
            }
            Err(_) => {
                warn!(exchange, routing_key, deadline = ?self.deadline, "publish timed out");
                Err(BrokerError::Timeout(self.deadline))
            }
        }
    }
}
