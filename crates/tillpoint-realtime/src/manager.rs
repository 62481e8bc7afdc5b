//! The channel connection manager.
//!
//! One background task owns the realtime channel and the subscription
//! registry. The public [`ChannelConnectionManager`] handle talks to it over
//! a command channel, so the task is the only mutator of either.

use std::future::pending;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use tillpoint_client::{ChannelHandle, RealtimeTransport};
use tillpoint_proto::{ChangeBinding, ChannelMessage, ChannelStatus, SubscriptionId};

use crate::backoff::ReconnectPolicy;
use crate::clock::{Clock, TokioClock};
use crate::config::RealtimeConfig;
use crate::connectivity::{ConnectivityObserver, ManualConnectivity, NetworkState};
use crate::error::{Error, Result};
use crate::state::{ConnectionPhase, ConnectionState};
use crate::subscription::{ChangeCallback, SubscriptionRegistry, SubscriptionSpec};

enum Command {
    Subscribe {
        binding: ChangeBinding,
        callback: ChangeCallback,
        reply: oneshot::Sender<()>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct ManagerInner {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    next_id: AtomicU64,
    config: RealtimeConfig,
    clock: Arc<dyn Clock>,
    connectivity: Arc<dyn ConnectivityObserver>,
}

/// Handle to the process-wide realtime connection.
///
/// Create one per process in the composition root and pass clones to the
/// features that need change events. All subscriptions share a single
/// channel; the manager reconnects it on failure and re-attaches every
/// registered subscription.
#[derive(Clone)]
pub struct ChannelConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ChannelConnectionManager {
    /// Start a manager on the tokio clock with connectivity assumed online.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(transport: Arc<dyn RealtimeTransport>, config: RealtimeConfig) -> Result<Self> {
        Self::start_with(
            transport,
            config,
            Arc::new(TokioClock),
            Arc::new(ManualConnectivity::online()),
        )
    }

    /// Start a manager with an explicit clock and connectivity observer.
    pub fn start_with(
        transport: Arc<dyn RealtimeTransport>,
        config: RealtimeConfig,
        clock: Arc<dyn Clock>,
        connectivity: Arc<dyn ConnectivityObserver>,
    ) -> Result<Self> {
        config.validate()?;

        let network = connectivity.watch();
        let online = network.borrow().is_online();
        let state = ConnectionState::new(online);
        let (state_tx, state_rx) = watch::channel(state.clone());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let task = ConnectionTask {
            transport,
            policy: ReconnectPolicy::from_config(&config),
            config: config.clone(),
            clock: clock.clone(),
            registry: SubscriptionRegistry::new(),
            channel: None,
            state,
            state_tx,
            network,
            network_closed: false,
            retry_at: None,
            teardown_at: None,
            last_failure_at: None,
        };
        tokio::spawn(task.run(commands_rx));

        tracing::info!(
            channel = %config.channel_name,
            online,
            max_attempts = config.max_reconnect_attempts,
            "realtime manager started"
        );

        Ok(Self {
            inner: Arc::new(ManagerInner {
                commands: commands_tx,
                state: state_rx,
                next_id: AtomicU64::new(1),
                config,
                clock,
                connectivity,
            }),
        })
    }

    /// Register a subscription.
    ///
    /// The subscription is in the registry when this returns and receives
    /// events as soon as the channel is subscribed. Connection failures are
    /// not reported here; watch [`ChannelConnectionManager::watch_state`]
    /// instead. Fails only on an invalid filter or a stopped manager.
    pub async fn subscribe(&self, spec: SubscriptionSpec) -> Result<SubscriptionId> {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let (binding, callback) = spec.into_parts(id, &self.inner.config.schema)?;

        let live = self.inner.state.borrow().subscriptions;
        if live >= self.inner.config.subscription_ceiling {
            tracing::debug!(
                live,
                ceiling = self.inner.config.subscription_ceiling,
                "subscription ceiling reached, pausing"
            );
            self.inner
                .clock
                .sleep(self.inner.config.backpressure_pause)
                .await;
        }

        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Subscribe {
                binding,
                callback,
                reply,
            })
            .map_err(|_| Error::ManagerStopped)?;
        rx.await.map_err(|_| Error::ManagerStopped)?;
        Ok(id)
    }

    /// Remove a subscription. Returns whether it was registered.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .inner
            .commands
            .send(Command::Unsubscribe { id, reply })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Watch connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }

    /// Watch host network transitions.
    pub fn watch_network(&self) -> watch::Receiver<NetworkState> {
        self.inner.connectivity.watch()
    }

    /// The clock this manager schedules on.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.inner.clock.clone()
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    /// Tear down the channel, drop every subscription and stop the task.
    ///
    /// Later calls on any clone fail with [`Error::ManagerStopped`].
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.inner.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

impl std::fmt::Debug for ChannelConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("ChannelConnectionManager")
            .field("channel", &self.inner.config.channel_name)
            .field("phase", &state.phase)
            .field("subscriptions", &state.subscriptions)
            .finish()
    }
}

/// The live channel and its message stream.
struct ActiveChannel {
    handle: Box<dyn ChannelHandle>,
    messages: mpsc::UnboundedReceiver<ChannelMessage>,
    /// Set until the server acknowledges the subscription.
    setup_deadline: Option<Instant>,
}

struct ConnectionTask {
    transport: Arc<dyn RealtimeTransport>,
    config: RealtimeConfig,
    policy: ReconnectPolicy,
    clock: Arc<dyn Clock>,
    registry: SubscriptionRegistry,
    /// At most one channel exists at a time.
    channel: Option<ActiveChannel>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    network: watch::Receiver<NetworkState>,
    network_closed: bool,
    retry_at: Option<Instant>,
    teardown_at: Option<Instant>,
    last_failure_at: Option<Instant>,
}

impl ConnectionTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let timer = self.timer();

            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.stop();
                        break;
                    }
                },

                changed = self.network.changed(), if !self.network_closed => {
                    if changed.is_err() {
                        tracing::debug!("connectivity observer dropped");
                        self.network_closed = true;
                    } else {
                        let network = *self.network.borrow_and_update();
                        self.on_network(network);
                    }
                }

                message = next_message(&mut self.channel) => match message {
                    Some(message) => self.on_message(message),
                    None => self.on_failure("channel stream ended".to_string()),
                },

                _ = timer => self.on_timer(),
            }

            self.publish_state();
        }

        tracing::info!(channel = %self.config.channel_name, "realtime manager stopped");
    }

    fn timer(&self) -> BoxFuture<'static, ()> {
        let deadline = [
            self.channel.as_ref().and_then(|c| c.setup_deadline),
            self.retry_at,
            self.teardown_at,
        ]
        .into_iter()
        .flatten()
        .min();

        match deadline {
            Some(deadline) => self.clock.sleep_until(deadline),
            None => pending::<()>().boxed(),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                binding,
                callback,
                reply,
            } => {
                self.add_subscription(binding, callback);
                self.publish_state();
                let _ = reply.send(());
            }
            Command::Unsubscribe { id, reply } => {
                let removed = self.remove_subscription(id);
                self.publish_state();
                let _ = reply.send(removed);
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn add_subscription(&mut self, binding: ChangeBinding, callback: ChangeCallback) {
        tracing::debug!(
            subscription_id = %binding.id,
            table = %binding.table,
            event = ?binding.event,
            filter = ?binding.filter.as_ref().map(|f| f.to_string()),
            "subscription registered"
        );

        self.registry
            .insert(binding.clone(), callback, self.clock.now());
        self.teardown_at = None;

        if self.state.retries_exhausted {
            self.state.retries_exhausted = false;
            self.state.reconnect_attempts = 0;
            self.last_failure_at = None;
        }

        if let Some(channel) = self.channel.as_mut() {
            channel.handle.on(binding);
        } else if self.retry_at.is_none() && self.state.online {
            self.connect();
        }
    }

    fn remove_subscription(&mut self, id: SubscriptionId) -> bool {
        let Some(entry) = self.registry.remove(id) else {
            return false;
        };
        if let Some(channel) = self.channel.as_mut() {
            channel.handle.off(id);
        }

        tracing::debug!(
            subscription_id = %id,
            table = %entry.binding.table,
            events_delivered = entry.events_delivered,
            age_ms = self.clock.now().duration_since(entry.created_at).as_millis() as u64,
            "subscription removed"
        );

        if self.registry.is_empty() {
            self.teardown_at = Some(self.clock.now() + self.config.teardown_grace);
        }
        true
    }

    /// Open a fresh channel carrying every registered binding.
    fn connect(&mut self) {
        self.close_channel();
        self.retry_at = None;

        let mut handle = self.transport.open_channel(&self.config.channel_name);
        for binding in self.registry.bindings() {
            handle.on(binding);
        }
        let messages = handle.subscribe();

        self.channel = Some(ActiveChannel {
            handle,
            messages,
            setup_deadline: Some(self.clock.now() + self.config.setup_timeout),
        });
        self.state.phase = if self.state.reconnect_attempts == 0 {
            ConnectionPhase::Connecting
        } else {
            ConnectionPhase::Reconnecting
        };

        tracing::info!(
            channel = %self.config.channel_name,
            attempt = self.state.reconnect_attempts,
            subscriptions = self.registry.len(),
            "opening realtime channel"
        );
    }

    fn close_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.handle.unsubscribe();
        }
    }

    fn on_message(&mut self, message: ChannelMessage) {
        match message {
            ChannelMessage::Change(change) => {
                let delivered = self.registry.dispatch(&change);
                tracing::trace!(
                    table = %change.table,
                    change_type = ?change.change_type,
                    delivered,
                    "change dispatched"
                );
            }
            ChannelMessage::Status {
                status: ChannelStatus::Subscribed,
                ..
            } => self.on_subscribed(),
            ChannelMessage::Status { status, error } => {
                if status.is_terminal() {
                    let reason = error.unwrap_or_else(|| format!("channel status {:?}", status));
                    self.on_failure(reason);
                }
            }
        }
    }

    fn on_subscribed(&mut self) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        if channel.setup_deadline.take().is_none() {
            return;
        }

        // The channel object changed; arm every binding against it.
        for binding in self.registry.bindings() {
            channel.handle.on(binding);
        }

        let recovered = self.state.reconnect_attempts;
        self.state.phase = ConnectionPhase::Connected;
        self.state.reconnect_attempts = 0;
        self.state.resource_constrained = false;
        self.state.last_error = None;
        self.state.last_connected_at = Some(self.clock.now());
        self.last_failure_at = None;

        tracing::info!(
            channel = %self.config.channel_name,
            subscriptions = self.registry.len(),
            after_attempts = recovered,
            "realtime channel subscribed"
        );
    }

    fn on_failure(&mut self, reason: String) {
        let now = self.clock.now();
        self.close_channel();
        self.state.last_error = Some(reason.clone());

        if self.registry.is_empty() || !self.state.online {
            tracing::debug!(%reason, "channel failed with nothing to reconnect");
            self.retry_at = None;
            self.state.phase = ConnectionPhase::Disconnected;
            return;
        }

        if let Some(last) = self.last_failure_at {
            if now.duration_since(last) > self.config.attempt_reset_after {
                self.state.reconnect_attempts = 0;
            }
        }
        self.last_failure_at = Some(now);
        self.state.reconnect_attempts += 1;
        let attempts = self.state.reconnect_attempts;

        if self.policy.exhausted(attempts) {
            tracing::error!(
                %reason,
                attempts,
                subscriptions = self.registry.len(),
                "max reconnect attempts reached, giving up"
            );
            self.retry_at = None;
            self.state.phase = ConnectionPhase::Disconnected;
            self.state.retries_exhausted = true;
            return;
        }

        let since_connected = self
            .state
            .last_connected_at
            .map(|at| now.duration_since(at));
        let plan = self
            .policy
            .plan(attempts - 1, Some(&reason), since_connected, rand::random::<f64>());

        self.state.resource_constrained = plan.resource_constrained;
        self.state.phase = ConnectionPhase::Reconnecting;
        self.retry_at = Some(now + plan.delay);

        tracing::warn!(
            %reason,
            attempt = attempts,
            max_attempts = self.policy.max_attempts(),
            delay_ms = plan.delay.as_millis() as u64,
            resource_constrained = plan.resource_constrained,
            "realtime channel failed, scheduling reconnect"
        );
    }

    fn on_timer(&mut self) {
        let now = self.clock.now();

        let setup_expired = self
            .channel
            .as_ref()
            .and_then(|c| c.setup_deadline)
            .is_some_and(|deadline| deadline <= now);
        if setup_expired {
            self.on_failure(format!(
                "channel setup timed out after {:?}",
                self.config.setup_timeout
            ));
        }

        if self.retry_at.is_some_and(|at| at <= now) {
            self.retry_at = None;
            if self.state.online && !self.registry.is_empty() {
                self.connect();
            }
        }

        if self.teardown_at.is_some_and(|at| at <= now) {
            self.teardown_at = None;
            if self.registry.is_empty() {
                self.teardown();
            }
        }
    }

    /// Release the channel once nothing is subscribed.
    fn teardown(&mut self) {
        self.close_channel();
        self.retry_at = None;
        self.last_failure_at = None;
        self.state.phase = ConnectionPhase::Disconnected;
        self.state.reconnect_attempts = 0;
        self.state.resource_constrained = false;
        self.state.retries_exhausted = false;
        tracing::info!(channel = %self.config.channel_name, "idle realtime channel torn down");
    }

    fn on_network(&mut self, network: NetworkState) {
        match network {
            NetworkState::Offline => {
                if !self.state.online {
                    return;
                }
                self.state.online = false;
                self.close_channel();
                self.retry_at = None;
                self.state.phase = ConnectionPhase::Disconnected;
                tracing::warn!(
                    subscriptions = self.registry.len(),
                    "network offline, realtime channel closed"
                );
            }
            NetworkState::Online => {
                if self.state.online {
                    return;
                }
                self.state.online = true;
                self.state.reconnect_attempts = 0;
                self.state.retries_exhausted = false;
                self.state.resource_constrained = false;
                self.last_failure_at = None;
                tracing::info!(
                    subscriptions = self.registry.len(),
                    "network online"
                );
                if !self.registry.is_empty() && self.channel.is_none() {
                    self.connect();
                }
            }
        }
    }

    fn stop(&mut self) {
        self.close_channel();
        self.retry_at = None;
        self.teardown_at = None;
        self.registry = SubscriptionRegistry::new();
        self.state.phase = ConnectionPhase::Disconnected;
        self.publish_state();
    }

    fn publish_state(&mut self) {
        self.state.subscriptions = self.registry.len();
        let current = &self.state;
        self.state_tx.send_if_modified(|published| {
            if published != current {
                *published = current.clone();
                true
            } else {
                false
            }
        });
    }
}

async fn next_message(channel: &mut Option<ActiveChannel>) -> Option<ChannelMessage> {
    match channel {
        Some(channel) => channel.messages.recv().await,
        None => pending().await,
    }
}
