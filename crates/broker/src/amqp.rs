//! AMQP 0-9-1 transport backed by `lapin`.
//!
//! One connection and one confirm-mode channel per [`Session`]. The
//! connection's error callback feeds the session's close notification.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery as LapinDelivery;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::channel::{Acknowledger, BrokerChannel, Connector, Delivery, DeliveryStream, Session};
use crate::error::BrokerError;
use crate::message::Envelope;
use crate::topology::{BindingSpec, ExchangeSpec, QueueSpec};

const DELIVERY_MODE_PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Dials a RabbitMQ URI.
pub struct AmqpConnector {
    uri: String,
    prefetch: u16,
}

impl AmqpConnector {
    pub fn new(uri: impl Into<String>, prefetch: u16) -> Self {
        Self {
            uri: uri.into(),
            prefetch,
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    #[instrument(skip_all)]
    async fn connect(&self) -> Result<Session, BrokerError> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("dial failed: {e}")))?;

        let (closed_tx, closed_rx) = oneshot::channel();
        let mut closed_tx = Some(closed_tx);
        connection.on_error(move |err| {
            if let Some(tx) = closed_tx.take() {
                let _ = tx.send(err.to_string());
            }
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("channel open failed: {e}")))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("confirm mode failed: {e}")))?;
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("qos failed: {e}")))?;

        info!(channel_id = channel.id(), prefetch = self.prefetch, "AMQP channel open");

        Ok(Session {
            channel: Arc::new(AmqpChannel {
                connection,
                channel,
            }),
            closed: closed_rx,
        })
    }
}

pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                &spec.name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    auto_delete: spec.auto_delete,
                    internal: false,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("exchange {}: {e}", spec.name)))
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        let mut args = FieldTable::default();
        if let Some(dlx) = &spec.dead_letter_exchange {
            args.insert(
                ShortString::from("x-dead-letter-exchange"),
                AMQPValue::LongString(LongString::from(dlx.as_str())),
            );
        }
        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    auto_delete: spec.auto_delete,
                    exclusive: spec.exclusive,
                    nowait: false,
                    passive: false,
                },
                args,
            )
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Topology(format!("queue {}: {e}", spec.name)))
    }

    async fn bind_queue(&self, spec: &BindingSpec) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                &spec.queue,
                &spec.exchange,
                &spec.pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BrokerError::Topology(format!(
                    "bind {} -> {} ({}): {e}",
                    spec.queue, spec.exchange, spec.pattern
                ))
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), BrokerError> {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(envelope.content_type.as_str()))
            .with_kind(ShortString::from(envelope.kind.as_str()))
            .with_message_id(ShortString::from(envelope.message_id.to_string()))
            .with_timestamp(envelope.timestamp.timestamp().max(0) as u64);
        if envelope.persistent {
            properties = properties.with_delivery_mode(DELIVERY_MODE_PERSISTENT);
        }

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &envelope.payload,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        let confirmation = confirm
            .await
            .map_err(|e| BrokerError::Publish(format!("confirm failed: {e}")))?;
        if confirmation.is_nack() {
            return Err(BrokerError::Publish("broker nacked the message".into()));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Subscribe(format!("{queue}: {e}")))?;

        debug!(queue, consumer_tag, "consumer opened");
        let stream = consumer.map(|item| {
            item.map(into_delivery)
                .map_err(|e| BrokerError::Connection(format!("consumer error: {e}")))
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.channel.status().connected() {
            self.channel
                .close(REPLY_SUCCESS, "shutdown")
                .await
                .map_err(|e| BrokerError::Connection(e.to_string()))?;
        }
        if self.connection.status().connected() {
            self.connection
                .close(REPLY_SUCCESS, "shutdown")
                .await
                .map_err(|e| BrokerError::Connection(e.to_string()))?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

fn into_delivery(d: LapinDelivery) -> Delivery {
    let kind = d.properties.kind().as_ref().map(|s| s.as_str().to_string());
    let message_id = d
        .properties
        .message_id()
        .as_ref()
        .map(|s| s.as_str().to_string());
    let delivery_count = d
        .properties
        .headers()
        .as_ref()
        .and_then(|h| h.inner().get(&ShortString::from("x-delivery-count")))
        .and_then(amqp_u32);

    Delivery {
        body: d.data,
        kind,
        message_id,
        routing_key: d.routing_key.as_str().to_string(),
        redelivered: d.redelivered,
        delivery_count,
        acker: Box::new(AmqpAcker(d.acker)),
    }
}

fn amqp_u32(value: &AMQPValue) -> Option<u32> {
    let n: i64 = match value {
        AMQPValue::ShortShortInt(v) => (*v).into(),
        AMQPValue::ShortShortUInt(v) => (*v).into(),
        AMQPValue::ShortInt(v) => (*v).into(),
        AMQPValue::ShortUInt(v) => (*v).into(),
        AMQPValue::LongInt(v) => (*v).into(),
        AMQPValue::LongUInt(v) => (*v).into(),
        AMQPValue::LongLongInt(v) => *v,
        _ => {
            warn!(?value, "unexpected x-delivery-count type");
            return None;
        }
    };
    u32::try_from(n).ok()
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}
