//! Connection lifecycle: initial dial, closure detection and reconnection.
//!
//! [`ConnectionManager`] owns exactly one live session at a time. Every
//! (re)connect re-declares the [`Topology`] and re-arms all registered
//! subscriptions before the new channel is handed out, so nothing is published
//! to an exchange the new channel has not declared.
//!
//! Units of concurrency:
//! 1. **Close watcher**, one per session, waits for the close notification
//! 2. **Reconnect loop**, one per manager, driven by a single-slot signal
//! 3. **Delivery loops**, one per subscribed queue (see [`crate::subscriber`])

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::ReconnectPolicy;
use crate::channel::{BrokerChannel, Connector, Session};
use crate::error::BrokerError;
use crate::subscriber::{delivery_loop, AttemptTracker, DeliveryHandler, RedeliveryPolicy};
use crate::topology::{self, Topology};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Intentional shutdown in progress. Closures seen now are expected.
    Closing,
    Closed,
    /// Reconnect attempts exhausted. Terminal.
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closing | Self::Closed | Self::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A queue consumer that survives reconnects. The handler is kept across
/// sessions; only the delivery loop task is replaced.
struct Subscription {
    queue: String,
    handler: Arc<dyn DeliveryHandler>,
    policy: RedeliveryPolicy,
    tracker: Arc<AttemptTracker>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    topology: Topology,
    policy: ReconnectPolicy,
    declare_timeout: Duration,
    state: watch::Sender<ConnectionState>,
    channel: watch::Sender<Option<Arc<dyn BrokerChannel>>>,
    /// Incremented per established session; closures from older sessions are ignored.
    generation: AtomicU64,
    reconnect_tx: mpsc::Sender<()>,
    reconnect_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
    /// Held for the whole of `establish` so subscriptions are armed exactly once per session.
    subscriptions: Mutex<Vec<Subscription>>,
    reconnect_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        topology: Topology,
        policy: ReconnectPolicy,
        declare_timeout: Duration,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (channel, _) = watch::channel(None);
        // Capacity one: closures arriving before the loop drains collapse into one attempt.
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        Arc::new(Self {
            connector,
            topology,
            policy,
            declare_timeout,
            state,
            channel,
            generation: AtomicU64::new(0),
            reconnect_tx,
            reconnect_rx: std::sync::Mutex::new(Some(reconnect_rx)),
            subscriptions: Mutex::new(Vec::new()),
            reconnect_task: std::sync::Mutex::new(None),
        })
    }

    /// Connect, declare topology and spawn the reconnect loop.
    ///
    /// A failure here is fatal to startup; nothing is retried.
    pub async fn start(self: &Arc<Self>) -> Result<(), BrokerError> {
        self.connect().await?;

        let rx = self
            .reconnect_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        match rx {
            Some(rx) => {
                let manager = self.clone();
                let handle = tokio::spawn(async move { manager.reconnect_loop(rx).await });
                *self.reconnect_task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
            }
            None => debug!("reconnect loop already running"),
        }
        Ok(())
    }

    /// Dial once and return the ready channel.
    pub async fn connect(self: &Arc<Self>) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        self.establish().await?;
        self.channel()
            .ok_or_else(|| BrokerError::Connection("channel closed during connect".into()))
    }

    /// The current channel, if connected.
    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.channel.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Wait until the manager reaches `Connected`, or a terminal state.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), BrokerError> {
        let mut rx = self.watch_state();
        let reached = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| *s == ConnectionState::Connected || s.is_terminal()),
        )
        .await
        .map_err(|_| BrokerError::Timeout(timeout))?
        .map_err(|_| BrokerError::Connection("manager dropped".into()))?;
        match *reached {
            ConnectionState::Connected => Ok(()),
            other => Err(BrokerError::Connection(format!("manager is {other}"))),
        }
    }

    /// Register a consumer on `queue`. It is armed immediately when connected
    /// and re-armed after every reconnect.
    pub async fn subscribe(
        self: &Arc<Self>,
        queue: impl Into<String>,
        handler: Arc<dyn DeliveryHandler>,
        policy: RedeliveryPolicy,
    ) -> Result<(), BrokerError> {
        let queue = queue.into();
        let mut subs = self.subscriptions.lock().await;
        if subs.iter().any(|s| s.queue == queue) {
            return Err(BrokerError::Subscribe(format!("{queue} already has a subscriber")));
        }

        let mut sub = Subscription {
            queue,
            handler,
            policy,
            tracker: Arc::new(AttemptTracker::new()),
            task: None,
        };

        if self.state() == ConnectionState::Connected {
            if let Some(channel) = self.channel() {
                let generation = self.generation.load(Ordering::SeqCst);
                self.arm(&mut sub, &channel, generation).await?;
            }
        }
        info!(queue = %sub.queue, "subscription registered");
        subs.push(sub);
        Ok(())
    }

    /// Shut down intentionally. The state moves to `Closing` before anything is
    /// torn down, so the resulting closure does not trigger a reconnect.
    ///
    /// A manager that already reached `Failed` is torn down but stays `Failed`.
    pub async fn close(&self) {
        let mut previous = ConnectionState::Closed;
        self.state.send_if_modified(|s| {
            previous = *s;
            match *s {
                ConnectionState::Closed | ConnectionState::Failed => false,
                _ => {
                    *s = ConnectionState::Closing;
                    true
                }
            }
        });
        if previous == ConnectionState::Closed {
            return;
        }
        info!(previous = %previous, "closing broker connection");

        if let Some(task) = self
            .reconnect_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            task.abort();
        }

        {
            let mut subs = self.subscriptions.lock().await;
            for sub in subs.iter_mut() {
                sub.stop();
            }
        }

        if let Some(channel) = self.channel.send_replace(None) {
            if let Err(e) = channel.close().await {
                warn!(error = %e, "error while closing channel");
            }
        }

        if previous != ConnectionState::Failed {
            self.state.send_replace(ConnectionState::Closed);
        }
        info!(state = %self.state(), "broker connection closed");
    }

    /// Called by publishers and delivery loops when an operation failed.
    /// Triggers a reconnect only if the current channel is actually gone.
    pub fn report_fault(&self, reason: &str) {
        let Some(channel) = self.channel() else {
            return;
        };
        if channel.is_open() {
            warn!(reason, "fault reported but channel is still open");
            return;
        }
        let generation = self.generation.load(Ordering::SeqCst);
        self.handle_closure(generation, reason);
    }

    /// A delivery loop of session `generation` ran out. A closed channel is a
    /// connection fault; an open one means the broker cancelled the consumer,
    /// so that subscription alone is re-armed after the initial backoff delay.
    pub(crate) fn consumer_ended(self: &Arc<Self>, queue: &str, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation
            || self.state() != ConnectionState::Connected
        {
            return;
        }
        let Some(channel) = self.channel() else {
            return;
        };
        if !channel.is_open() {
            self.handle_closure(generation, &format!("consumer on {queue} ended"));
            return;
        }

        warn!(queue, "consumer cancelled by broker, re-subscribing");
        let manager = self.clone();
        let queue = queue.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(manager.policy.initial).await;
            manager.rearm(&queue, generation).await;
        });
    }

    // ── Internals ────────────────────────────────────────────────────

    /// Re-arm one subscription on the live channel of session `generation`.
    async fn rearm(self: &Arc<Self>, queue: &str, generation: u64) {
        let mut subs = self.subscriptions.lock().await;
        // A newer session has already armed everything.
        if self.generation.load(Ordering::SeqCst) != generation
            || self.state() != ConnectionState::Connected
        {
            return;
        }
        let Some(channel) = self.channel() else {
            return;
        };
        let Some(sub) = subs.iter_mut().find(|s| s.queue == queue) else {
            return;
        };
        match self.arm(sub, &channel, generation).await {
            Ok(()) => info!(queue, "subscription re-armed"),
            Err(e) => {
                warn!(queue, error = %e, "failed to re-arm subscription");
                drop(subs);
                self.report_fault(&format!("re-subscribing {queue} failed"));
            }
        }
    }

    /// Dial, declare topology, re-arm subscriptions, then publish the new channel.
    async fn establish(self: &Arc<Self>) -> Result<(), BrokerError> {
        let mut subs = self.subscriptions.lock().await;

        let entered = self.state.send_if_modified(|s| {
            if s.is_terminal() {
                false
            } else {
                *s = ConnectionState::Connecting;
                true
            }
        });
        if !entered {
            return Err(BrokerError::Connection(format!("manager is {}", self.state())));
        }

        let Session { channel, closed } = match self.connector.connect().await {
            Ok(session) => session,
            Err(e) => {
                self.set_disconnected();
                return Err(e);
            }
        };
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        if let Err(e) = self.prepare(&channel, &mut subs, generation).await {
            for sub in subs.iter_mut() {
                sub.stop();
            }
            if let Err(close_err) = channel.close().await {
                debug!(error = %close_err, "closing half-prepared channel failed");
            }
            self.set_disconnected();
            return Err(e);
        }

        if self.state().is_terminal() {
            // close() ran while we were dialling.
            for sub in subs.iter_mut() {
                sub.stop();
            }
            let _ = channel.close().await;
            return Err(BrokerError::Connection("closed during connect".into()));
        }

        self.channel.send_replace(Some(channel.clone()));
        self.state.send_replace(ConnectionState::Connected);
        info!(generation, subscriptions = subs.len(), "broker connected");

        // A closure delivered before we were Connected is still queued in `closed`.
        self.spawn_close_watcher(generation, closed);
        if !channel.is_open() {
            self.handle_closure(generation, "channel closed during setup");
        }
        Ok(())
    }

    async fn prepare(
        self: &Arc<Self>,
        channel: &Arc<dyn BrokerChannel>,
        subs: &mut [Subscription],
        generation: u64,
    ) -> Result<(), BrokerError> {
        topology::declare(&**channel, &self.topology, self.declare_timeout).await?;
        for sub in subs.iter_mut() {
            self.arm(sub, channel, generation).await?;
        }
        Ok(())
    }

    async fn arm(
        self: &Arc<Self>,
        sub: &mut Subscription,
        channel: &Arc<dyn BrokerChannel>,
        generation: u64,
    ) -> Result<(), BrokerError> {
        sub.stop();
        let tag = format!("{}.{}", sub.queue, generation);
        let stream = channel
            .consume(&sub.queue, &tag)
            .await
            .map_err(|e| BrokerError::Subscribe(format!("{}: {e}", sub.queue)))?;

        let task = tokio::spawn(delivery_loop(
            sub.queue.clone(),
            stream,
            sub.handler.clone(),
            sub.policy,
            sub.tracker.clone(),
            Arc::downgrade(self),
            generation,
        ));
        sub.task = Some(task);
        debug!(queue = %sub.queue, consumer_tag = %tag, "subscription armed");
        Ok(())
    }

    fn spawn_close_watcher(self: &Arc<Self>, generation: u64, closed: oneshot::Receiver<String>) {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let reason = closed
                .await
                .unwrap_or_else(|_| "connection dropped".to_string());
            if let Some(manager) = manager.upgrade() {
                manager.handle_closure(generation, &reason);
            }
        });
    }

    /// React to a closure of session `generation`. Only a closure of the live
    /// session while `Connected` signals the reconnect loop.
    fn handle_closure(&self, generation: u64, reason: &str) {
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(generation, reason, "ignoring closure of a stale session");
            return;
        }

        let was_connected = self.state.send_if_modified(|s| {
            if *s == ConnectionState::Connected {
                *s = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
        if !was_connected {
            debug!(state = %self.state(), reason, "closure ignored");
            return;
        }

        self.channel.send_replace(None);
        warn!(generation, reason, "broker connection lost");
        if self.reconnect_tx.try_send(()).is_err() {
            debug!("reconnect already pending");
        }
    }

    fn set_disconnected(&self) {
        self.state.send_if_modified(|s| {
            if s.is_terminal() {
                false
            } else {
                *s = ConnectionState::Disconnected;
                true
            }
        });
    }

    async fn reconnect_loop(self: Arc<Self>, mut signal: mpsc::Receiver<()>) {
        let mut state_rx = self.watch_state();

        while signal.recv().await.is_some() {
            if self.state().is_terminal() {
                break;
            }
            if self.state() == ConnectionState::Connected {
                debug!("reconnect signal while connected, skipping");
                continue;
            }

            let mut attempt: u32 = 0;
            loop {
                if self.state().is_terminal() {
                    info!("manager closing, reconnect loop exiting");
                    return;
                }
                match self.establish().await {
                    Ok(()) => {
                        info!(attempts = attempt + 1, "reconnected to broker");
                        break;
                    }
                    Err(e) => {
                        let Some(delay) = self.policy.delay(attempt) else {
                            error!(attempts = attempt + 1, error = %e, "giving up on broker reconnection");
                            self.state.send_if_modified(|s| {
                                if s.is_terminal() {
                                    false
                                } else {
                                    *s = ConnectionState::Failed;
                                    true
                                }
                            });
                            return;
                        };
                        warn!(
                            attempt = attempt + 1,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "reconnect attempt failed"
                        );
                        attempt = attempt.saturating_add(1);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = state_rx.wait_for(|s| s.is_terminal()) => {
                                info!("manager closing during backoff");
                                return;
                            }
                        }
                    }
                }
            }
        }
        debug!("reconnect loop finished");
    }
}
