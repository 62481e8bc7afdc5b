//! Order stream: per-franchise order events for kitchen and counter views.
//!
//! An [`OrderStreamListener`] opens [`OrderStream`]s on top of the shared
//! [`ChannelConnectionManager`]. Each stream registers an insert and an update
//! subscription scoped to one franchise, drops repeat notifications for the
//! same order within a short window, re-fetches every accepted order with its
//! line items, and only forwards updates that change what a kitchen display
//! shows.
//!
//! ```ignore
//! let listener = OrderStreamListener::new(manager, backend, OrderStreamConfig::default());
//! let stream = listener.open("F1", Arc::new(KitchenView::new())).await?;
//! // ...
//! stream.close().await;
//! ```

mod gate;
mod hydrate;
mod session;
mod staleness;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use tillpoint_client::Backend;
use tillpoint_proto::{Order, OrderStatus};

use crate::config::OrderStreamConfig;
use crate::error::{Result, StreamError};
use crate::manager::ChannelConnectionManager;

pub use gate::{GateDecision, UpdateGatePolicy};

use hydrate::Hydrator;
use session::{release, StreamSession, SubscriptionIds};

/// Receives the events of one order stream.
///
/// Callbacks run on background tasks and never after the stream is closed.
pub trait OrderStreamHandler: Send + Sync + 'static {
    /// A new order was placed.
    fn on_new_order(&self, order: Order);

    /// An order changed in a way worth showing.
    fn on_order_update(&self, update: OrderUpdate);

    /// Something went wrong. The stream keeps running.
    fn on_error(&self, error: StreamError) {
        tracing::warn!(%error, "order stream error");
    }
}

/// A forwarded order update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderUpdate {
    /// The order as fetched after the change.
    pub order: Order,
    pub previous_status: Option<OrderStatus>,
    /// Order id plus change time in milliseconds, for keying UI effects.
    pub change_id: String,
    /// Set when the order just moved from pending to preparing.
    pub is_new_to_preparing: bool,
}

/// Lifecycle of an order stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    Uninitialized,
    Subscribing,
    Active,
    /// The shared channel is down; the manager is reconnecting or has given up.
    Degraded,
    Closed,
}

/// Connection health of an order stream, for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamHealth {
    pub state: ListenerState,
    pub is_connected: bool,
    pub last_error: Option<String>,
    pub retry_count: u32,
}

impl Default for StreamHealth {
    fn default() -> Self {
        Self {
            state: ListenerState::Uninitialized,
            is_connected: false,
            last_error: None,
            retry_count: 0,
        }
    }
}

/// Opens order streams.
#[derive(Clone)]
pub struct OrderStreamListener {
    manager: ChannelConnectionManager,
    backend: Arc<dyn Backend>,
    config: OrderStreamConfig,
}

impl OrderStreamListener {
    pub fn new(
        manager: ChannelConnectionManager,
        backend: Arc<dyn Backend>,
        config: OrderStreamConfig,
    ) -> Self {
        Self {
            manager,
            backend,
            config,
        }
    }

    /// Start streaming orders of franchise `scope_id` into `handler`.
    ///
    /// Returns once both subscriptions are registered with the manager. The
    /// channel may still be connecting; follow [`OrderStream::watch_health`].
    pub async fn open(
        &self,
        scope_id: impl Into<String>,
        handler: Arc<dyn OrderStreamHandler>,
    ) -> Result<OrderStream> {
        let scope_id = scope_id.into();
        let (health_tx, health_rx) = watch::channel(StreamHealth::default());
        let active = Arc::new(AtomicBool::new(true));
        let subscriptions = SubscriptionIds::default();

        let hydrator = Hydrator::new(self.backend.clone(), self.manager.clock(), &self.config);
        let mut session = StreamSession::new(
            self.manager.clone(),
            hydrator,
            handler,
            self.config.clone(),
            scope_id.clone(),
            active.clone(),
            health_tx,
            subscriptions.clone(),
        );
        session.subscribe_all().await?;

        let (close_tx, close_rx) = oneshot::channel();
        let worker = tokio::spawn(session.run(close_rx));

        tracing::info!(scope_id = %scope_id, table = %self.config.table, "order stream opened");

        Ok(OrderStream {
            scope_id,
            manager: self.manager.clone(),
            health: health_rx,
            active,
            subscriptions,
            close_tx: Mutex::new(Some(close_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }
}

/// A running order stream. Dropping it closes the stream in the background.
pub struct OrderStream {
    scope_id: String,
    manager: ChannelConnectionManager,
    health: watch::Receiver<StreamHealth>,
    active: Arc<AtomicBool>,
    /// Emptied by the worker on close; anything left is released here.
    subscriptions: SubscriptionIds,
    close_tx: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl OrderStream {
    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    /// Current health.
    pub fn health(&self) -> StreamHealth {
        self.health.borrow().clone()
    }

    /// Watch health changes.
    pub fn watch_health(&self) -> watch::Receiver<StreamHealth> {
        self.health.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.health.borrow().is_connected
    }

    /// Stop the stream and wait for its subscriptions to be removed.
    ///
    /// No handler callback runs once this is called. Calling it again, or
    /// while a reconnect or fetch is in flight, is fine.
    pub async fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(tx) = self.close_tx.lock().take() {
            let _ = tx.send(());
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!(scope_id = %self.scope_id, error = %e, "order stream worker failed");
            }
        }
        release(&self.manager, &self.subscriptions).await;
    }
}

impl Drop for OrderStream {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(tx) = self.close_tx.lock().take() {
            let _ = tx.send(());
        }

        // A live worker releases the subscriptions itself.
        let worker_gone = self
            .worker
            .lock()
            .as_ref()
            .map_or(true, |worker| worker.is_finished());
        if !worker_gone || self.subscriptions.lock().is_empty() {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let manager = self.manager.clone();
            let subscriptions = self.subscriptions.clone();
            runtime.spawn(async move { release(&manager, &subscriptions).await });
        }
    }
}

impl std::fmt::Debug for OrderStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderStream")
            .field("scope_id", &self.scope_id)
            .field("health", &*self.health.borrow())
            .finish()
    }
}
