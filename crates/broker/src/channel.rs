//! Transport seam between the connection manager and a concrete broker.
//!
//! [`Connector`] dials a fresh [`Session`]; the [`BrokerChannel`] inside it is
//! the only handle the rest of the crate talks to. The AMQP implementation
//! lives in [`crate::amqp`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::oneshot;

use crate::error::BrokerError;
use crate::message::Envelope;
use crate::topology::{BindingSpec, ExchangeSpec, QueueSpec};

/// Stream of deliveries from one consumer. Ends when the channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// One open channel on a live connection.
///
/// Implementations must be safe to share between the publisher, the topology
/// declarer and every delivery loop at once.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError>;

    async fn bind_queue(&self, spec: &BindingSpec) -> Result<(), BrokerError>;

    /// Publish and wait for the broker to confirm the message.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), BrokerError>;

    /// Open a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;
}

/// Settles one delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Negative acknowledgement. With `requeue = false` the broker routes the
    /// message to the queue's dead-letter exchange, if it has one.
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A message handed to a consumer, not yet settled.
pub struct Delivery {
    pub body: Vec<u8>,
    /// Schema name from the `type` property, when the publisher set one.
    pub kind: Option<String>,
    pub message_id: Option<String>,
    pub routing_key: String,
    pub redelivered: bool,
    /// Broker-maintained `x-delivery-count` (quorum queues only).
    pub delivery_count: Option<u32>,
    pub acker: Box<dyn Acknowledger>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("message_id", &self.message_id)
            .field("redelivered", &self.redelivered)
            .field("delivery_count", &self.delivery_count)
            .field("bytes", &self.body.len())
            .finish()
    }
}

/// A freshly dialled connection and its channel.
pub struct Session {
    pub channel: Arc<dyn BrokerChannel>,
    /// Resolves once when the underlying connection closes, with the reason.
    /// A dropped sender also counts as a closure.
    pub closed: oneshot::Receiver<String>,
}

/// Dials the broker. Called once at startup and again on every reconnect.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Session, BrokerError>;
}
