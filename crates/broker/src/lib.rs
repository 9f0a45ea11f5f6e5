//! Resilient broker client: connection lifecycle, topology, publish and
//! manual-ack consumption over AMQP.

pub mod amqp;
pub mod backoff;
pub mod channel;
pub mod connection;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod message;
pub mod publisher;
pub mod subscriber;
pub mod topology;

pub use amqp::AmqpConnector;
pub use backoff::ReconnectPolicy;
pub use channel::{Acknowledger, BrokerChannel, Connector, Delivery, DeliveryStream, Session};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::BrokerError;
pub use message::{decode_body, Envelope, CONTENT_TYPE_JSON};
pub use publisher::{EventPublisher, Publisher};
pub use subscriber::{AttemptTracker, DeliveryHandler, FnHandler, RedeliveryPolicy};
pub use topology::{BindingSpec, ExchangeSpec, QueueSpec, Topology};
