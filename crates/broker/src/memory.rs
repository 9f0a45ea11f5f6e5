//! In-process broker with AMQP topic semantics, for tests.
//!
//! Exchanges, queues and bindings live in one [`MemoryBroker`] that outlives
//! individual connections, like a real broker. [`MemoryConnector`] dials
//! sessions against it and can sever them to simulate network failure.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{oneshot, watch, Notify};
use tracing::debug;

use crate::channel::{Acknowledger, BrokerChannel, Connector, Delivery, DeliveryStream, Session};
use crate::error::BrokerError;
use crate::message::Envelope;
use crate::topology::{BindingSpec, ExchangeSpec, QueueSpec};

/// AMQP topic match: `*` is exactly one word, `#` is zero or more.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&k, key_rest)) => (word == "*" || word == k) && match_words(rest, key_rest),
            None => false,
        },
    }
}

#[derive(Debug, Clone)]
struct Stored {
    envelope: Envelope,
    routing_key: String,
    redelivered: bool,
}

struct MemQueue {
    spec: QueueSpec,
    ready: VecDeque<Stored>,
    /// tag -> (owning channel, message)
    unacked: HashMap<u64, (u64, Stored)>,
    notify: Arc<Notify>,
    /// Bumped to end every consumer on the queue while channels stay open.
    cancel: watch::Sender<u64>,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, MemQueue>,
    bindings: BTreeSet<BindingSpec>,
}

/// Shared broker state.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    next_tag: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Messages waiting in `queue` (not counting unacked ones).
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.unacked.len()).unwrap_or(0)
    }

    pub fn binding_count(&self) -> usize {
        self.lock().bindings.len()
    }

    pub fn exchange_count(&self) -> usize {
        self.lock().exchanges.len()
    }

    pub fn queue_count(&self) -> usize {
        self.lock().queues.len()
    }

    /// Remove and return every ready message in `queue`, oldest first.
    pub fn drain(&self, queue: &str) -> Vec<(String, Envelope)> {
        let mut state = self.lock();
        match state.queues.get_mut(queue) {
            Some(q) => q
                .ready
                .drain(..)
                .map(|m| (m.routing_key, m.envelope))
                .collect(),
            None => Vec::new(),
        }
    }

    fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        let mut state = self.lock();
        match state.exchanges.get(&spec.name) {
            Some(existing) if existing != spec => Err(BrokerError::Topology(format!(
                "PRECONDITION_FAILED - inequivalent arg for exchange '{}'",
                spec.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        let mut state = self.lock();
        match state.queues.get(&spec.name) {
            Some(existing) if &existing.spec != spec => Err(BrokerError::Topology(format!(
                "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                spec.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    spec.name.clone(),
                    MemQueue {
                        spec: spec.clone(),
                        ready: VecDeque::new(),
                        unacked: HashMap::new(),
                        notify: Arc::new(Notify::new()),
                        cancel: watch::channel(0).0,
                    },
                );
                Ok(())
            }
        }
    }

    fn bind(&self, spec: &BindingSpec) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if !state.exchanges.contains_key(&spec.exchange) {
            return Err(BrokerError::Topology(format!(
                "NOT_FOUND - no exchange '{}'",
                spec.exchange
            )));
        }
        if !state.queues.contains_key(&spec.queue) {
            return Err(BrokerError::Topology(format!("NOT_FOUND - no queue '{}'", spec.queue)));
        }
        state.bindings.insert(spec.clone());
        Ok(())
    }

    fn route(state: &mut State, exchange: &str, routing_key: &str, message: Stored) -> usize {
        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
            .map(|b| b.queue.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        for name in &targets {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.ready.push_back(Stored {
                    routing_key: routing_key.to_string(),
                    ..message.clone()
                });
                queue.notify.notify_waiters();
            }
        }
        targets.len()
    }

    fn publish(&self, exchange: &str, routing_key: &str, envelope: &Envelope) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::Publish(format!("NOT_FOUND - no exchange '{exchange}'")));
        }
        let stored = Stored {
            envelope: envelope.clone(),
            routing_key: routing_key.to_string(),
            redelivered: false,
        };
        let routed = Self::route(&mut state, exchange, routing_key, stored);
        if routed == 0 {
            debug!(exchange, routing_key, "message unroutable, dropped");
        }
        Ok(())
    }

    fn take_next(self: &Arc<Self>, queue: &str, channel: &Arc<ChannelInner>) -> Option<Delivery> {
        let mut state = self.lock();
        let q = state.queues.get_mut(queue)?;
        let message = q.ready.pop_front()?;
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        q.unacked.insert(tag, (channel.id, message.clone()));

        Some(Delivery {
            body: message.envelope.payload.clone(),
            kind: Some(message.envelope.kind.clone()),
            message_id: Some(message.envelope.message_id.to_string()),
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
            delivery_count: None,
            acker: Box::new(MemoryAcker {
                broker: self.clone(),
                channel: channel.clone(),
                queue: queue.to_string(),
                tag,
            }),
        })
    }

    fn settle(&self, queue: &str, tag: u64, outcome: Settle) {
        let mut state = self.lock();
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        let Some((_, mut message)) = q.unacked.remove(&tag) else {
            return;
        };
        match outcome {
            Settle::Ack => {}
            Settle::Requeue => {
                message.redelivered = true;
                q.ready.push_front(message);
                q.notify.notify_waiters();
            }
            Settle::DeadLetter => {
                let dlx = q.spec.dead_letter_exchange.clone();
                if let Some(dlx) = dlx {
                    let key = message.routing_key.clone();
                    message.redelivered = false;
                    Self::route(&mut state, &dlx, &key, message);
                }
            }
        }
    }

    /// Requeue everything a closed channel still held.
    fn release_channel(&self, channel_id: u64) {
        let mut state = self.lock();
        for q in state.queues.values_mut() {
            let tags: Vec<u64> = q
                .unacked
                .iter()
                .filter(|(_, (owner, _))| *owner == channel_id)
                .map(|(tag, _)| *tag)
                .collect();
            if tags.is_empty() {
                continue;
            }
            let mut returned: Vec<(u64, Stored)> = tags
                .into_iter()
                .filter_map(|tag| q.unacked.remove(&tag).map(|(_, m)| (tag, m)))
                .collect();
            returned.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
            for (_, mut message) in returned {
                message.redelivered = true;
                q.ready.push_front(message);
            }
            q.notify.notify_waiters();
        }
    }

    fn queue_handles(&self, queue: &str) -> Option<(Arc<Notify>, watch::Receiver<u64>)> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| (q.notify.clone(), q.cancel.subscribe()))
    }

    /// Cancel every consumer on `queue` without closing their channels, as a
    /// broker does when a queue is deleted or a consumer is cancelled.
    pub fn cancel_consumers(&self, queue: &str) {
        if let Some(q) = self.lock().queues.get(queue) {
            q.cancel.send_modify(|epoch| *epoch += 1);
        }
    }
}

enum Settle {
    Ack,
    Requeue,
    DeadLetter,
}

struct ChannelInner {
    id: u64,
    open: AtomicBool,
    closed_tx: watch::Sender<bool>,
    notify_close: Mutex<Option<oneshot::Sender<String>>>,
}

impl ChannelInner {
    /// Mark closed, wake consumers and fire the connection-closed notification.
    fn shut(&self, reason: &str) -> bool {
        if !self.open.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.closed_tx.send_replace(true);
        if let Some(tx) = self
            .notify_close
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            let _ = tx.send(reason.to_string());
        }
        true
    }
}

/// One session's channel onto a [`MemoryBroker`].
pub struct MemoryChannel {
    broker: Arc<MemoryBroker>,
    inner: Arc<ChannelInner>,
    stall_publishes: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.inner.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Connection("channel is closed".into()))
        }
    }

    fn shut(&self, reason: &str) {
        if self.inner.shut(reason) {
            self.broker.release_channel(self.inner.id);
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.declare_exchange(spec)
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.declare_queue(spec)
    }

    async fn bind_queue(&self, spec: &BindingSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.bind(spec)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), BrokerError> {
        if self.stall_publishes.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        self.ensure_open()
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        self.broker.publish(exchange, routing_key, envelope)
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let (notify, cancel) = self
            .broker
            .queue_handles(queue)
            .ok_or_else(|| BrokerError::Subscribe(format!("NOT_FOUND - no queue '{queue}'")))?;

        let broker = self.broker.clone();
        let channel = self.inner.clone();
        let closed = channel.closed_tx.subscribe();
        let queue = queue.to_string();

        let stream = futures::stream::unfold(
            (broker, channel, closed, cancel, notify, queue),
            |(broker, channel, mut closed, mut cancel, notify, queue)| async move {
                loop {
                    let notify_handle = notify.clone();
                    let notified = notify_handle.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    if *closed.borrow() || cancel.has_changed().unwrap_or(true) {
                        return None;
                    }
                    if let Some(delivery) = broker.take_next(&queue, &channel) {
                        return Some((
                            Ok::<Delivery, BrokerError>(delivery),
                            (broker, channel, closed, cancel, notify, queue),
                        ));
                    }
                    tokio::select! {
                        _ = &mut notified => {}
                        changed = closed.changed() => {
                            if changed.is_err() {
                                return None;
                            }
                        }
                        _ = cancel.changed() => return None,
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shut("closed by client");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }
}

struct MemoryAcker {
    broker: Arc<MemoryBroker>,
    channel: Arc<ChannelInner>,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, outcome: Settle) -> Result<(), BrokerError> {
        if !self.channel.open.load(Ordering::SeqCst) {
            return Err(BrokerError::Ack("channel is closed".into()));
        }
        self.broker.settle(&self.queue, self.tag, outcome);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(if requeue { Settle::Requeue } else { Settle::DeadLetter })
    }
}

/// Dials [`MemoryChannel`] sessions and injects faults.
pub struct MemoryConnector {
    broker: Arc<MemoryBroker>,
    fail_next: AtomicU32,
    connects: AtomicU32,
    next_channel: AtomicU64,
    stall_publishes: Arc<AtomicBool>,
    live: Mutex<Vec<Arc<MemoryChannel>>>,
}

impl MemoryConnector {
    pub fn new(broker: Arc<MemoryBroker>) -> Arc<Self> {
        Arc::new(Self {
            broker,
            fail_next: AtomicU32::new(0),
            connects: AtomicU32::new(0),
            next_channel: AtomicU64::new(1),
            stall_publishes: Arc::new(AtomicBool::new(false)),
            live: Mutex::new(Vec::new()),
        })
    }

    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }

    /// Make the next `n` dials fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Successful dials so far.
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Publishes on every channel hang until released.
    pub fn stall_publishes(&self, stall: bool) {
        self.stall_publishes.store(stall, Ordering::SeqCst);
    }

    /// Drop every live session as if the network went away.
    pub fn sever_all(&self) {
        let live: Vec<Arc<MemoryChannel>> = self
            .live
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for channel in live {
            channel.shut("connection reset by peer");
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Session, BrokerError> {
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BrokerError::Connection("connection refused".into()));
        }

        let (closed_tx, _) = watch::channel(false);
        let (notify_tx, notify_rx) = oneshot::channel();
        let channel = Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            inner: Arc::new(ChannelInner {
                id: self.next_channel.fetch_add(1, Ordering::SeqCst),
                open: AtomicBool::new(true),
                closed_tx,
                notify_close: Mutex::new(Some(notify_tx)),
            }),
            stall_publishes: self.stall_publishes.clone(),
        });

        {
            let mut live = self.live.lock().unwrap_or_else(|p| p.into_inner());
            live.retain(|c| c.is_open());
            live.push(channel.clone());
        }
        self.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Session {
            channel,
            closed: notify_rx,
        })
    }
}
