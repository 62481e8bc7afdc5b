//! The background task behind one order stream.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;

use tillpoint_proto::{
    ChangeNotification, ChangeType, EventKind, Order, OrderRow, OrderStatus, RowFilter,
    SubscriptionId, TypedChange,
};

use super::gate::StatusHistory;
use super::hydrate::Hydrator;
use super::staleness::StalenessFilter;
use super::{ListenerState, OrderStreamHandler, OrderUpdate, StreamHealth};
use crate::config::OrderStreamConfig;
use crate::connectivity::NetworkState;
use crate::error::{Result, StreamError};
use crate::manager::ChannelConnectionManager;
use crate::state::{ConnectionPhase, ConnectionState};
use crate::subscription::{panic_message, SubscriptionSpec};

/// What the stream last told the handler about the connection.
type ReportedFailure = (String, u32, bool);

/// Manager subscriptions held by one stream, shared with its handle.
pub(super) type SubscriptionIds = Arc<Mutex<Vec<SubscriptionId>>>;

pub(super) struct StreamSession {
    manager: ChannelConnectionManager,
    hydrator: Arc<Hydrator>,
    handler: Arc<dyn OrderStreamHandler>,
    config: OrderStreamConfig,
    scope_id: String,
    /// Cleared on close; checked before every handler call.
    active: Arc<AtomicBool>,
    health_tx: watch::Sender<StreamHealth>,
    staleness: StalenessFilter,
    history: StatusHistory,
    subscriptions: SubscriptionIds,
    events_tx: mpsc::UnboundedSender<ChangeNotification>,
    events_rx: mpsc::UnboundedReceiver<ChangeNotification>,
    hydrations: JoinSet<()>,
    been_active: bool,
    reported: Option<ReportedFailure>,
}

impl StreamSession {
    pub fn new(
        manager: ChannelConnectionManager,
        hydrator: Hydrator,
        handler: Arc<dyn OrderStreamHandler>,
        config: OrderStreamConfig,
        scope_id: String,
        active: Arc<AtomicBool>,
        health_tx: watch::Sender<StreamHealth>,
        subscriptions: SubscriptionIds,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            manager,
            hydrator: Arc::new(hydrator),
            handler,
            staleness: StalenessFilter::new(config.staleness_window),
            config,
            scope_id,
            active,
            health_tx,
            history: StatusHistory::default(),
            subscriptions,
            events_tx,
            events_rx,
            hydrations: JoinSet::new(),
            been_active: false,
            reported: None,
        }
    }

    /// Register the insert and update subscriptions for this scope.
    pub async fn subscribe_all(&mut self) -> Result<()> {
        self.set_state(ListenerState::Subscribing);
        let filter = RowFilter::eq(self.config.scope_column.as_str(), self.scope_id.as_str()).to_string();

        for event in [EventKind::Insert, EventKind::Update] {
            let tx = self.events_tx.clone();
            let active = self.active.clone();
            let spec = SubscriptionSpec::new(self.config.table.as_str(), move |change| {
                if active.load(Ordering::SeqCst) {
                    let _ = tx.send(change.clone());
                }
            })
            .with_event(event)
            .with_filter(filter.clone());

            match self.manager.subscribe(spec).await {
                Ok(id) => self.subscriptions.lock().push(id),
                Err(e) => {
                    self.unsubscribe_all().await;
                    return Err(e);
                }
            }
        }

        tracing::debug!(
            scope_id = %self.scope_id,
            subscriptions = ?*self.subscriptions.lock(),
            "order stream subscribed"
        );
        Ok(())
    }

    async fn unsubscribe_all(&mut self) {
        release(&self.manager, &self.subscriptions).await;
    }

    pub async fn run(mut self, mut close_rx: oneshot::Receiver<()>) {
        let mut state_rx = self.manager.watch_state();
        let mut network_rx = self.manager.watch_network();
        let mut online = network_rx.borrow_and_update().is_online();
        let mut manager_running = true;
        let mut network_open = true;

        let initial = state_rx.borrow_and_update().clone();
        self.on_connection_state(&initial);

        loop {
            tokio::select! {
                biased;

                _ = &mut close_rx => break,

                Some(change) = self.events_rx.recv() => self.on_change(change),

                changed = state_rx.changed(), if manager_running => {
                    if changed.is_err() {
                        manager_running = false;
                        self.on_manager_stopped();
                    } else {
                        let state = state_rx.borrow_and_update().clone();
                        self.on_connection_state(&state);
                    }
                }

                changed = network_rx.changed(), if network_open => {
                    if changed.is_err() {
                        network_open = false;
                        continue;
                    }
                    let network = *network_rx.borrow_and_update();
                    let regained = !online && network == NetworkState::Online;
                    online = network.is_online();
                    if regained {
                        self.resubscribe().await;
                    }
                }

                Some(joined) = self.hydrations.join_next(), if !self.hydrations.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!(scope_id = %self.scope_id, error = %e, "order handler panicked");
                        }
                    }
                }
            }
        }

        self.close().await;
    }

    fn on_change(&mut self, change: ChangeNotification) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }

        let typed: TypedChange<OrderRow> = match change.decode() {
            Ok(typed) => typed,
            Err(e) => {
                tracing::warn!(scope_id = %self.scope_id, error = %e, "malformed order change");
                self.report(StreamError::Decode {
                    message: e.to_string(),
                });
                return;
            }
        };
        let Some(new) = typed.new else {
            tracing::debug!(change_type = ?typed.change_type, "order change without a new row");
            return;
        };

        if !self.staleness.admit(&new.id, self.manager.clock().now()) {
            tracing::debug!(order_id = %new.id, "repeat order notification dropped");
            return;
        }

        let old_status = typed.old.as_ref().and_then(|old| old.status);
        let previous_status = self.history.observe(&new, old_status);

        match typed.change_type {
            ChangeType::Insert => self.hydrate(new.id, None),
            ChangeType::Update => {
                let old_items = typed.old.as_ref().and_then(|old| old.items.as_ref());
                let decision = self.config.gate.evaluate(previous_status, old_items, &new);
                if !decision.forward {
                    tracing::trace!(
                        order_id = %new.id,
                        items_changed = decision.items_changed,
                        "order update gated"
                    );
                    return;
                }

                let at = typed
                    .commit_timestamp
                    .unwrap_or_else(|| self.manager.clock().utc_now());
                let pending = PendingUpdate {
                    previous_status: decision.previous_status,
                    change_id: format!("{}-{}", new.id, at.timestamp_millis()),
                    is_new_to_preparing: decision.is_highlight_transition,
                };
                self.hydrate(new.id, Some(pending));
            }
            ChangeType::Delete => {}
        }
    }

    /// Fetch the order and hand it to the handler on a separate task.
    fn hydrate(&mut self, order_id: String, update: Option<PendingUpdate>) {
        let hydrator = self.hydrator.clone();
        let handler = self.handler.clone();
        let active = self.active.clone();
        let scope_id = self.scope_id.clone();

        self.hydrations.spawn(async move {
            let result = hydrator.fetch(&order_id).await;
            if !active.load(Ordering::SeqCst) {
                tracing::debug!(order_id = %order_id, "order stream closed during hydration");
                return;
            }

            let order = match result {
                Ok(order) => order,
                Err(e) => {
                    notify(&scope_id, "on_error", || handler.on_error(e));
                    return;
                }
            };
            if order.franchise_id != scope_id {
                tracing::warn!(
                    order_id = %order.id,
                    franchise_id = %order.franchise_id,
                    scope_id = %scope_id,
                    "hydrated order outside stream scope"
                );
                return;
            }

            match update {
                None => notify(&scope_id, "on_new_order", || handler.on_new_order(order)),
                Some(pending) => notify(&scope_id, "on_order_update", || {
                    handler.on_order_update(pending.into_update(order))
                }),
            }
        });
    }

    fn on_connection_state(&mut self, state: &ConnectionState) {
        if state.phase == ConnectionPhase::Connected {
            self.been_active = true;
        }

        let listener_state = match state.phase {
            ConnectionPhase::Connected => ListenerState::Active,
            _ if !self.been_active && state.last_error.is_none() => ListenerState::Subscribing,
            _ => ListenerState::Degraded,
        };

        let health = StreamHealth {
            state: listener_state,
            is_connected: state.is_connected(),
            last_error: state.last_error.clone(),
            retry_count: state.reconnect_attempts,
        };
        self.health_tx.send_if_modified(|current| {
            if *current != health {
                *current = health;
                true
            } else {
                false
            }
        });

        let Some(message) = state.last_error.clone() else {
            self.reported = None;
            return;
        };
        let key = (message.clone(), state.reconnect_attempts, state.retries_exhausted);
        if self.reported.as_ref() == Some(&key) {
            return;
        }
        self.reported = Some(key);

        self.report(StreamError::Connection {
            message,
            retrying: !state.retries_exhausted && state.online,
        });
    }

    fn on_manager_stopped(&mut self) {
        tracing::warn!(scope_id = %self.scope_id, "connection manager stopped under order stream");
        self.set_state(ListenerState::Degraded);
        self.report(StreamError::Connection {
            message: "connection manager stopped".to_string(),
            retrying: false,
        });
    }

    /// Register both subscriptions again after the network came back.
    async fn resubscribe(&mut self) {
        tracing::info!(scope_id = %self.scope_id, "network regained, re-subscribing order stream");
        self.unsubscribe_all().await;
        self.staleness.clear();
        if let Err(e) = self.subscribe_all().await {
            tracing::error!(scope_id = %self.scope_id, error = %e, "failed to re-subscribe order stream");
            self.report(StreamError::Connection {
                message: e.to_string(),
                retrying: false,
            });
            return;
        }
        let state = self.manager.state();
        self.on_connection_state(&state);
    }

    async fn close(mut self) {
        self.active.store(false, Ordering::SeqCst);
        self.unsubscribe_all().await;
        self.hydrations.abort_all();
        self.staleness.clear();
        self.history.clear();
        self.set_state(ListenerState::Closed);
        self.health_tx.send_modify(|health| health.is_connected = false);
        tracing::info!(scope_id = %self.scope_id, "order stream closed");
    }

    /// Pass an error to the handler unless the stream is closed.
    fn report(&self, error: StreamError) {
        if self.active.load(Ordering::SeqCst) {
            let handler = &self.handler;
            notify(&self.scope_id, "on_error", || handler.on_error(error));
        }
    }

    fn set_state(&self, state: ListenerState) {
        self.health_tx.send_if_modified(|health| {
            if health.state != state {
                health.state = state;
                true
            } else {
                false
            }
        });
    }
}

/// Run a handler callback, logging a panic instead of unwinding into the stream.
fn notify(scope_id: &str, callback: &'static str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        tracing::error!(
            scope_id = %scope_id,
            callback,
            panic = %panic_message(panic.as_ref()),
            "order handler panicked"
        );
    }
}

/// Remove every recorded subscription from the manager.
pub(super) async fn release(manager: &ChannelConnectionManager, subscriptions: &SubscriptionIds) {
    let ids = std::mem::take(&mut *subscriptions.lock());
    for id in ids {
        manager.unsubscribe(id).await;
    }
}

/// Update fields computed before hydration.
struct PendingUpdate {
    previous_status: Option<OrderStatus>,
    change_id: String,
    is_new_to_preparing: bool,
}

impl PendingUpdate {
    fn into_update(self, order: Order) -> OrderUpdate {
        OrderUpdate {
            order,
            previous_status: self.previous_status,
            change_id: self.change_id,
            is_new_to_preparing: self.is_new_to_preparing,
        }
    }
}
