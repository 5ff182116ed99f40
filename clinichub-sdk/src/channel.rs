//! EventChannel: the single connection to one hub endpoint.
//!
//! Owns the link returned by a [`HubConnector`], pumps inbound events to
//! the registered handlers in arrival order, and runs the reconnect task
//! when the link drops. One instance exists per hub endpoint and feature:
//! create it on mount, call [`EventChannel::destroy`] on unmount.
//!
//! ## Connect semantics
//!
//! - `connect` while `Connected` returns immediately.
//! - Concurrent `connect` calls share the single in-flight handshake.
//! - A `disconnect` racing a connect makes the connect resolve `Ok(())`.
//! - A genuine failure is returned to the caller and a reconnect is
//!   scheduled; after the policy gives up the state settles in `Failed`.
//! - The state turns `Connected` only after every observer's
//!   [`LifecycleObserver::on_ready`] has finished, so callers waiting on
//!   `connect` or the state watch never overtake the group replay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{HubError, Result};
use crate::reconnect::{
    is_transient_teardown, ReconnectConfig, ReconnectPolicy, RetryContext, TeardownSignal, TeardownToken,
};
use crate::transport::{HubConnector, HubInvoker, HubLink, Inbound};

/// Lifecycle of the connection, observable by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted; only an explicit `connect` recovers.
    Failed,
}

/// Handler for a named push event. One per event name.
pub type EventHandler = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Components that must react to the channel becoming ready or being torn down.
pub trait LifecycleObserver: Send + Sync {
    /// Runs after every successful handshake, while the state is still
    /// `Connecting` or `Reconnecting`. `link` is the only way to reach the
    /// hub until the future completes.
    fn on_ready(self: Arc<Self>, link: ReadyLink) -> BoxFuture<'static, ()>;

    /// Runs right after the state turns `Connected`, before `connect` resolves.
    fn on_connected(self: Arc<Self>) -> BoxFuture<'static, ()> {
        futures::future::ready(()).boxed()
    }

    /// Runs on an explicit `disconnect`.
    fn on_teardown(&self);
}

/// A freshly handshaken link, handed to observers before the channel
/// reports `Connected`.
#[derive(Clone)]
pub struct ReadyLink {
    channel: String,
    invoker: Arc<dyn HubInvoker>,
}

impl ReadyLink {
    pub async fn invoke(&self, procedure: &str, args: Vec<Value>) -> Result<Value> {
        tracing::debug!(channel = %self.channel, %procedure, "invoke during replay");
        self.invoker.invoke(procedure.to_string(), args).await
    }
}

/// Reconnect and handshake tuning for one channel.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub policy: ReconnectPolicy,
    pub handshake_timeout: Duration,
    pub jitter: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ChannelOptions {
    fn from(c: &ReconnectConfig) -> Self {
        Self {
            policy: ReconnectPolicy::from(c),
            handshake_timeout: Duration::from_millis(c.handshake_timeout_ms),
            jitter: Duration::from_millis(c.jitter_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttemptOutcome {
    Connected,
    TornDown,
    Failed(String),
}

type AttemptFuture = Shared<BoxFuture<'static, AttemptOutcome>>;

struct Live {
    id: u64,
    invoker: Arc<dyn HubInvoker>,
    pump: JoinHandle<()>,
}

struct Inner {
    name: String,
    connector: Arc<dyn HubConnector>,
    options: ChannelOptions,
    state_tx: watch::Sender<ConnectionState>,
    teardown: TeardownSignal,
    handlers: Mutex<HashMap<String, EventHandler>>,
    observers: Mutex<Vec<Weak<dyn LifecycleObserver>>>,
    credential: Mutex<Option<String>>,
    live: Mutex<Option<Live>>,
    in_flight: Mutex<Option<(u64, AttemptFuture)>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

/// Handle to a hub connection. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl EventChannel {
    /// Create a disconnected channel. `name` labels log lines ("chat", "payments").
    pub fn new(name: impl Into<String>, connector: Arc<dyn HubConnector>, options: ChannelOptions) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                connector,
                options,
                state_tx,
                teardown: TeardownSignal::new(),
                handlers: Mutex::new(HashMap::new()),
                observers: Mutex::new(Vec::new()),
                credential: Mutex::new(None),
                live: Mutex::new(None),
                in_flight: Mutex::new(None),
                reconnect: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.inner.options
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch state transitions (e.g. to render a "reconnecting" banner).
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the channel is `Connected`.
    ///
    /// Fails once automatic reconnection has given up, or if the channel
    /// is (or becomes) explicitly disconnected.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.subscribe_state();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Failed => {
                    return Err(HubError::RetryExhausted {
                        attempts: self.inner.options.policy.max_attempts(),
                    });
                }
                ConnectionState::Disconnected => return Err(HubError::NotConnected { state }),
                ConnectionState::Connecting | ConnectionState::Reconnecting => {}
            }
            if rx.changed().await.is_err() {
                return Err(HubError::NotConnected { state });
            }
        }
    }

    /// Connect to the hub, or join the handshake already in flight.
    pub async fn connect(&self, credential: &str) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        if self.inner.in_flight.lock().is_none() {
            *self.inner.credential.lock() = Some(credential.to_string());
        }
        let attempt = Inner::begin_attempt(&self.inner, Origin::Manual);
        match attempt.await {
            AttemptOutcome::Connected | AttemptOutcome::TornDown => Ok(()),
            AttemptOutcome::Failed(message) => Err(HubError::Handshake(message)),
        }
    }

    /// Tear the connection down. Always safe, including when never connected.
    ///
    /// Cancels any pending reconnect, makes an in-flight connect resolve
    /// quietly, and clears membership bookkeeping through the observers.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.teardown.fire();
        let reconnect = inner.reconnect.lock().take();
        if let Some(task) = reconnect {
            task.abort();
        }
        inner.in_flight.lock().take();
        let live = inner.live.lock().take();
        inner.set_state(ConnectionState::Disconnected);

        for observer in inner.live_observers() {
            observer.on_teardown();
        }
        if let Some(live) = live {
            live.pump.abort();
            live.invoker.close().await;
            tracing::info!(channel = %inner.name, "hub connection closed");
        }
    }

    /// Disconnect and forget every handler and observer.
    pub async fn destroy(&self) {
        self.disconnect().await;
        self.inner.handlers.lock().clear();
        self.inner.observers.lock().clear();
    }

    /// Invoke a remote procedure. Rejected unless `Connected`; never queued.
    pub async fn invoke(&self, procedure: &str, args: Vec<Value>) -> Result<Value> {
        let invoker = {
            let live = self.inner.live.lock();
            let state = self.state();
            match live.as_ref() {
                Some(live) if state == ConnectionState::Connected => live.invoker.clone(),
                _ => return Err(HubError::NotConnected { state }),
            }
        };
        tracing::debug!(channel = %self.inner.name, %procedure, "invoke");
        invoker.invoke(procedure.to_string(), args).await
    }

    /// Register the handler for `event`, replacing any previous one.
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .lock()
            .insert(event.to_string(), Arc::new(handler));
    }

    /// Remove the handler for `event`. Returns whether one was registered.
    pub fn off(&self, event: &str) -> bool {
        self.inner.handlers.lock().remove(event).is_some()
    }

    pub fn has_handler(&self, event: &str) -> bool {
        self.inner.handlers.lock().contains_key(event)
    }

    /// Attach a lifecycle observer. Held weakly; dropped observers are pruned.
    pub fn observe(&self, observer: Weak<dyn LifecycleObserver>) {
        self.inner.observers.lock().push(observer);
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            tracing::info!(channel = %self.name, ?state, "hub connection state");
        }
    }

    fn live_observers(&self) -> Vec<Arc<dyn LifecycleObserver>> {
        let mut observers = self.observers.lock();
        observers.retain(|o| o.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    /// Return the in-flight attempt, starting one if there is none.
    fn begin_attempt(inner: &Arc<Inner>, origin: Origin) -> AttemptFuture {
        let mut slot = inner.in_flight.lock();
        if let Some((_, attempt)) = slot.as_ref() {
            return attempt.clone();
        }
        if *inner.state_tx.borrow() == ConnectionState::Connected {
            return futures::future::ready(AttemptOutcome::Connected).boxed().shared();
        }
        if origin == Origin::Manual {
            // An explicit connect replaces any scheduled retry.
            let reconnect = inner.reconnect.lock().take();
            if let Some(task) = reconnect {
                task.abort();
            }
            inner.set_state(ConnectionState::Connecting);
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = inner.teardown.token();
        let task = tokio::spawn(Inner::attempt(inner.clone(), id, token, origin));
        let attempt = async move {
            task.await
                .unwrap_or_else(|e| AttemptOutcome::Failed(format!("connect task failed: {e}")))
        }
        .boxed()
        .shared();
        *slot = Some((id, attempt.clone()));
        attempt
    }

    async fn attempt(inner: Arc<Inner>, id: u64, mut token: TeardownToken, origin: Origin) -> AttemptOutcome {
        let credential = inner.credential.lock().clone().unwrap_or_default();
        let timeout = inner.options.handshake_timeout;
        tracing::debug!(channel = %inner.name, attempt_id = id, ?origin, "hub handshake");

        let opened = tokio::select! {
            _ = token.cancelled() => Err(HubError::Teardown),
            result = tokio::time::timeout(timeout, inner.connector.open(credential)) => match result {
                Ok(result) => result,
                Err(_) => Err(HubError::Handshake(format!("handshake timed out after {timeout:?}"))),
            },
        };

        let outcome = match opened {
            Ok(link) => Inner::install(&inner, link, id, &token).await,
            Err(e) if is_transient_teardown(&e) || token.is_cancelled() => {
                tracing::debug!(channel = %inner.name, "connect aborted by teardown");
                AttemptOutcome::TornDown
            }
            Err(e) => {
                tracing::warn!(channel = %inner.name, error = %e, "hub connect failed");
                AttemptOutcome::Failed(match e {
                    HubError::Handshake(message) => message,
                    other => other.to_string(),
                })
            }
        };

        {
            let mut slot = inner.in_flight.lock();
            if slot.as_ref().is_some_and(|(current, _)| *current == id) {
                *slot = None;
            }
        }
        // a link lost during replay has already scheduled its own retry
        let retrying = inner.reconnect.lock().is_some();
        let failed = matches!(outcome, AttemptOutcome::Failed(_));
        if failed && origin == Origin::Manual && !token.is_cancelled() && !retrying {
            // The failed manual attempt counts as the first retry.
            Inner::spawn_reconnect(&inner, 1, token);
        }
        outcome
    }

    async fn install(inner: &Arc<Inner>, link: HubLink, id: u64, token: &TeardownToken) -> AttemptOutcome {
        let HubLink { invoker, inbound } = link;
        let (rejected, replaced) = {
            let mut live = inner.live.lock();
            if token.is_cancelled() {
                (Some(invoker.clone()), None)
            } else {
                let pump = tokio::spawn(Inner::pump(Arc::downgrade(inner), id, inbound, token.clone()));
                let replaced = live.replace(Live {
                    id,
                    invoker: invoker.clone(),
                    pump,
                });
                (None, replaced)
            }
        };
        if let Some(invoker) = rejected {
            invoker.close().await;
            return AttemptOutcome::TornDown;
        }
        if let Some(old) = replaced {
            old.pump.abort();
            old.invoker.close().await;
        }

        tracing::info!(channel = %inner.name, "hub link established");
        let ready = ReadyLink {
            channel: inner.name.clone(),
            invoker,
        };
        let observers = inner.live_observers();
        for observer in &observers {
            observer.clone().on_ready(ready.clone()).await;
        }

        let published = {
            let live = inner.live.lock();
            let current = live.as_ref().is_some_and(|l| l.id == id);
            if current && !token.is_cancelled() {
                inner.set_state(ConnectionState::Connected);
            }
            current
        };
        if token.is_cancelled() {
            return AttemptOutcome::TornDown;
        }
        if !published {
            // link_lost already scheduled the next attempt
            return AttemptOutcome::Failed("hub link lost during replay".to_string());
        }
        tracing::info!(channel = %inner.name, "connected to hub");
        for observer in observers {
            observer.on_connected().await;
        }
        AttemptOutcome::Connected
    }

    /// Deliver inbound events in arrival order until the link dies.
    async fn pump(inner: Weak<Inner>, id: u64, mut inbound: mpsc::Receiver<Inbound>, token: TeardownToken) {
        let reason = loop {
            match inbound.recv().await {
                Some(Inbound::Event { name, args }) => {
                    let Some(inner) = inner.upgrade() else { return };
                    let handler = inner.handlers.lock().get(&name).cloned();
                    match handler {
                        Some(handler) => handler(args),
                        None => tracing::debug!(channel = %inner.name, event = %name, "no handler for hub event"),
                    }
                }
                Some(Inbound::Closed { reason }) => break reason,
                None => break "link closed".to_string(),
            }
        };
        if let Some(inner) = inner.upgrade() {
            Inner::link_lost(&inner, id, &reason, token);
        }
    }

    fn link_lost(inner: &Arc<Inner>, id: u64, reason: &str, token: TeardownToken) {
        if token.is_cancelled() {
            return;
        }
        let lost = {
            let mut live = inner.live.lock();
            if live.as_ref().is_some_and(|l| l.id == id) {
                live.take();
                inner.set_state(ConnectionState::Reconnecting);
                true
            } else {
                false
            }
        };
        if lost {
            tracing::warn!(channel = %inner.name, %reason, "hub link lost");
            Inner::spawn_reconnect(inner, 0, token);
        }
    }

    fn spawn_reconnect(inner: &Arc<Inner>, start: u32, token: TeardownToken) {
        inner.set_state(ConnectionState::Reconnecting);
        let task = tokio::spawn(Inner::reconnect_loop(Arc::downgrade(inner), start, token));
        if let Some(previous) = inner.reconnect.lock().replace(task) {
            previous.abort();
        }
    }

    /// Owns the retry counter; asks the policy for each delay.
    async fn reconnect_loop(inner: Weak<Inner>, start: u32, mut token: TeardownToken) {
        let mut retry = RetryContext { attempt_count: start };
        loop {
            let Some(this) = inner.upgrade() else { return };
            if token.is_cancelled() {
                return;
            }
            let Some(delay) = this.options.policy.decide(retry) else {
                tracing::error!(
                    channel = %this.name,
                    attempts = retry.attempt_count,
                    "hub reconnect attempts exhausted"
                );
                this.set_state(ConnectionState::Failed);
                return;
            };
            let delay = delay + jitter(this.options.jitter);
            tracing::info!(
                channel = %this.name,
                attempt = retry.attempt_count,
                delay_ms = delay.as_millis() as u64,
                "scheduling hub reconnect"
            );
            this.set_state(ConnectionState::Reconnecting);
            drop(this);

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let Some(this) = inner.upgrade() else { return };
            let attempt = Inner::begin_attempt(&this, Origin::Scheduled);
            drop(this);
            match attempt.await {
                AttemptOutcome::TornDown => return,
                AttemptOutcome::Connected => {
                    // We may have joined an attempt whose link died during replay.
                    let Some(this) = inner.upgrade() else { return };
                    if *this.state_tx.borrow() == ConnectionState::Connected {
                        return;
                    }
                }
                AttemptOutcome::Failed(_) => retry.attempt_count += 1,
            }
        }
    }
}

fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let ms = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
    Duration::from_millis(ms)
}
