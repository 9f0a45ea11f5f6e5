//! Per-queue delivery loops with manual acknowledgement.
//!
//! A handler returning `Ok` acks the message. An error nacks it with requeue,
//! unless the message has already been redelivered more often than the
//! [`RedeliveryPolicy`] allows, in which case it is rejected without requeue
//! and the broker moves it to the dead-letter queue.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, Weak};

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::channel::{Delivery, DeliveryStream};
use crate::connection::ConnectionManager;
use crate::error::BrokerError;

/// Tracked messages beyond this count are forgotten wholesale.
const MAX_TRACKED: usize = 10_000;

/// Processes one delivery body. The result decides ack vs. nack.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, body: &[u8]) -> Result<(), BrokerError>;
}

/// Adapts an async closure into a [`DeliveryHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> DeliveryHandler for FnHandler<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BrokerError>> + Send,
{
    async fn handle(&self, body: &[u8]) -> Result<(), BrokerError> {
        (self.0)(body.to_vec()).await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    /// `None` requeues failing messages forever.
    pub max_redeliveries: Option<u32>,
}

impl RedeliveryPolicy {
    pub fn unbounded() -> Self {
        Self {
            max_redeliveries: None,
        }
    }

    pub fn capped(max_redeliveries: u32) -> Self {
        Self {
            max_redeliveries: Some(max_redeliveries),
        }
    }

    /// Whether a message that just failed on `attempt` (1-based) should be
    /// dead-lettered rather than requeued.
    pub fn exhausted(&self, attempt: u32) -> bool {
        match self.max_redeliveries {
            Some(max) => attempt > max,
            None => false,
        }
    }
}

/// Counts delivery attempts per message.
///
/// Classic queues only expose a `redelivered` flag, so attempts are also
/// counted in process and the larger of both counts wins.
#[derive(Debug, Default)]
pub struct AttemptTracker {
    seen: Mutex<HashMap<String, u32>>,
}

impl AttemptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivery and return its 1-based attempt number.
    pub fn observe(&self, delivery: &Delivery) -> u32 {
        let key = tracking_key(delivery);
        let local = {
            let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
            if seen.len() >= MAX_TRACKED && !seen.contains_key(&key) {
                warn!(tracked = seen.len(), "attempt tracker full, resetting");
                seen.clear();
            }
            let count = seen.entry(key).or_insert(0);
            *count += 1;
            *count
        };
        let from_broker = delivery.delivery_count.map(|c| c.saturating_add(1)).unwrap_or(1);
        local.max(from_broker)
    }

    pub fn forget(&self, delivery: &Delivery) {
        let key = tracking_key(delivery);
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&key);
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn tracking_key(delivery: &Delivery) -> String {
    match &delivery.message_id {
        Some(id) => id.clone(),
        None => {
            let mut hasher = DefaultHasher::new();
            delivery.routing_key.hash(&mut hasher);
            delivery.body.hash(&mut hasher);
            format!("body:{:016x}", hasher.finish())
        }
    }
}

/// Run the handler for one delivery and settle it.
pub async fn process_delivery(
    queue: &str,
    delivery: Delivery,
    handler: &dyn DeliveryHandler,
    policy: RedeliveryPolicy,
    tracker: &AttemptTracker,
) {
    let attempt = tracker.observe(&delivery);
    debug!(
        queue,
        routing_key = %delivery.routing_key,
        attempt,
        redelivered = delivery.redelivered,
        "delivery received"
    );

    match handler.handle(&delivery.body).await {
        Ok(()) => {
            tracker.forget(&delivery);
            if let Err(e) = delivery.acker.ack().await {
                warn!(queue, error = %e, "ack failed; message will be redelivered");
            }
        }
        Err(e) if policy.exhausted(attempt) => {
            tracker.forget(&delivery);
            error!(
                queue,
                routing_key = %delivery.routing_key,
                attempt,
                error = %e,
                "handler failed too often, dead-lettering message"
            );
            if let Err(e) = delivery.acker.nack(false).await {
                warn!(queue, error = %e, "reject failed");
            }
        }
        Err(e) => {
            warn!(
                queue,
                routing_key = %delivery.routing_key,
                attempt,
                error = %e,
                "handler failed, requeueing message"
            );
            if let Err(e) = delivery.acker.nack(true).await {
                warn!(queue, error = %e, "nack failed");
            }
        }
    }
}

/// Drain one consumer stream until it ends, then report the loss to the manager.
pub(crate) async fn delivery_loop(
    queue: String,
    mut stream: DeliveryStream,
    handler: std::sync::Arc<dyn DeliveryHandler>,
    policy: RedeliveryPolicy,
    tracker: std::sync::Arc<AttemptTracker>,
    manager: Weak<ConnectionManager>,
    generation: u64,
) {
    info!(queue = %queue, "delivery loop started");
    while let Some(item) = stream.next().await {
        match item {
            Ok(delivery) => {
                process_delivery(&queue, delivery, &*handler, policy, &tracker).await;
            }
            Err(e) => {
                warn!(queue = %queue, error = %e, "consumer stream failed");
                break;
            }
        }
    }
    info!(queue = %queue, "delivery loop ended");
    if let Some(manager) = manager.upgrade() {
        manager.consumer_ended(&queue, generation);
    }
}
