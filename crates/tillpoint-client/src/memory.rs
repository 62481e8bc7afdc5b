//! In-process backend.
//!
//! [`MemoryBackend`] implements both [`Backend`] and [`RealtimeTransport`]
//! over in-memory tables. It is used for local development and as the
//! collaborator in tests: channel statuses, change events, latency and
//! request failures are all driven from the outside.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use tillpoint_proto::{
    ChangeBinding, ChangeNotification, ChannelMessage, ChannelStatus, Embed, ProcedureCall,
    SubscriptionId, TableQuery,
};

use crate::backend::Backend;
use crate::error::Error;
use crate::transport::{ChannelHandle, RealtimeTransport};

/// A stored procedure implemented in Rust.
pub type ProcedureFn = Arc<dyn Fn(&Value) -> Result<Value, Error> + Send + Sync>;

/// State shared between the backend and one channel handle.
struct ChannelShared {
    id: u64,
    name: String,
    bindings: Mutex<Vec<ChangeBinding>>,
    sender: Mutex<Option<mpsc::UnboundedSender<ChannelMessage>>>,
    closed: AtomicBool,
}

impl ChannelShared {
    fn send(&self, message: ChannelMessage) -> bool {
        match self.sender.lock().as_ref() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    fn is_subscribed(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.sender.lock().is_some()
    }
}

struct Inner {
    tables: DashMap<String, Vec<Value>>,
    /// Child table -> foreign key column referencing the parent's `id`.
    relations: DashMap<String, String>,
    procedures: DashMap<String, ProcedureFn>,
    channels: Mutex<Vec<Arc<ChannelShared>>>,
    next_channel_id: AtomicU64,
    auto_ack: AtomicBool,
    live_channels: AtomicUsize,
    peak_live_channels: AtomicUsize,
    channel_opens: Mutex<Vec<Instant>>,
    request_failures: AtomicUsize,
    request_delay: Mutex<Option<Duration>>,
    request_count: AtomicUsize,
}

/// An in-memory backend and change feed.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    /// Create an empty backend that acknowledges channel subscriptions
    /// immediately.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tables: DashMap::new(),
                relations: DashMap::new(),
                procedures: DashMap::new(),
                channels: Mutex::new(Vec::new()),
                next_channel_id: AtomicU64::new(1),
                auto_ack: AtomicBool::new(true),
                live_channels: AtomicUsize::new(0),
                peak_live_channels: AtomicUsize::new(0),
                channel_opens: Mutex::new(Vec::new()),
                request_failures: AtomicUsize::new(0),
                request_delay: Mutex::new(None),
                request_count: AtomicUsize::new(0),
            }),
        }
    }

    // ── Data ────────────────────────────────────────────────────────────────

    /// Insert a row, replacing any existing row with the same `id`.
    pub fn upsert_row(&self, table: &str, row: Value) {
        let mut rows = self.inner.tables.entry(table.to_string()).or_default();
        let existing = row
            .get("id")
            .and_then(|id| rows.iter().position(|r| r.get("id") == Some(id)));
        match existing {
            Some(pos) => rows[pos] = row,
            None => rows.push(row),
        }
    }

    /// Number of rows stored in a table.
    pub fn row_count(&self, table: &str) -> usize {
        self.inner.tables.get(table).map(|rows| rows.len()).unwrap_or(0)
    }

    /// Declare that `child_table.foreign_key` references a parent row's `id`,
    /// so the child can be embedded in the parent's select list.
    pub fn relate(&self, child_table: &str, foreign_key: &str) {
        self.inner
            .relations
            .insert(child_table.to_string(), foreign_key.to_string());
    }

    /// Register a stored procedure.
    pub fn register_procedure<F>(&self, name: &str, procedure: F)
    where
        F: Fn(&Value) -> Result<Value, Error> + Send + Sync + 'static,
    {
        self.inner
            .procedures
            .insert(name.to_string(), Arc::new(procedure));
    }

    /// Fail the next `count` requests with [`Error::Request`].
    pub fn fail_next_requests(&self, count: usize) {
        self.inner.request_failures.store(count, Ordering::SeqCst);
    }

    /// Delay every request by `delay`.
    pub fn set_request_delay(&self, delay: Option<Duration>) {
        *self.inner.request_delay.lock() = delay;
    }

    /// Number of queries and procedure calls received so far.
    pub fn request_count(&self) -> usize {
        self.inner.request_count.load(Ordering::SeqCst)
    }

    // ── Change feed ─────────────────────────────────────────────────────────

    /// Choose whether new channels are acknowledged as soon as they subscribe.
    pub fn set_auto_ack(&self, enabled: bool) {
        self.inner.auto_ack.store(enabled, Ordering::SeqCst);
    }

    /// Send `Subscribed` to every subscribed channel.
    pub fn acknowledge(&self) -> usize {
        self.emit(ChannelMessage::status(ChannelStatus::Subscribed))
    }

    /// Send a status to every subscribed channel.
    pub fn emit_status(&self, status: ChannelStatus, error: Option<&str>) -> usize {
        self.emit(ChannelMessage::Status {
            status,
            error: error.map(str::to_string),
        })
    }

    /// Deliver a change to every subscribed channel with a matching binding.
    ///
    /// Returns the number of channels the change was sent to.
    pub fn publish(&self, change: ChangeNotification) -> usize {
        let channels = self.subscribed_channels();
        let mut delivered = 0;
        for channel in channels {
            let selected = channel.bindings.lock().iter().any(|b| b.matches(&change));
            if selected && channel.send(ChannelMessage::Change(change.clone())) {
                delivered += 1;
            }
        }
        tracing::trace!(table = %change.table, delivered, "published change");
        delivered
    }

    /// Number of channels opened and not yet torn down.
    pub fn live_channels(&self) -> usize {
        self.inner.live_channels.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live channels observed.
    pub fn peak_live_channels(&self) -> usize {
        self.inner.peak_live_channels.load(Ordering::SeqCst)
    }

    /// When each channel was opened, in order.
    pub fn channel_opens(&self) -> Vec<Instant> {
        self.inner.channel_opens.lock().clone()
    }

    /// Bindings attached to the most recently opened live channel.
    pub fn current_bindings(&self) -> Vec<ChangeBinding> {
        self.inner
            .channels
            .lock()
            .iter()
            .rev()
            .find(|c| !c.closed.load(Ordering::SeqCst))
            .map(|c| c.bindings.lock().clone())
            .unwrap_or_default()
    }

    fn emit(&self, message: ChannelMessage) -> usize {
        self.subscribed_channels()
            .into_iter()
            .filter(|c| c.send(message.clone()))
            .count()
    }

    fn subscribed_channels(&self) -> Vec<Arc<ChannelShared>> {
        let mut channels = self.inner.channels.lock();
        channels.retain(|c| !c.closed.load(Ordering::SeqCst));
        channels.iter().filter(|c| c.is_subscribed()).cloned().collect()
    }

    // ── Requests ────────────────────────────────────────────────────────────

    async fn simulate_request(&self) -> Result<(), Error> {
        self.inner.request_count.fetch_add(1, Ordering::SeqCst);

        let delay = *self.inner.request_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let injected = self
            .inner
            .request_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Request("injected failure".to_string()));
        }
        Ok(())
    }

    fn embed_relations(&self, mut row: Value, embeds: &[Embed]) -> Value {
        let parent_id = row.get("id").cloned();
        for embed in embeds {
            let Some(foreign_key) = self.inner.relations.get(&embed.table).map(|fk| fk.value().clone())
            else {
                continue;
            };
            let children: Vec<Value> = self
                .inner
                .tables
                .get(&embed.table)
                .map(|rows| {
                    rows.iter()
                        .filter(|child| {
                            parent_id.is_some() && child.get(&foreign_key) == parent_id.as_ref()
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            if let Value::Object(map) = &mut row {
                map.insert(embed.table.clone(), Value::Array(children));
            }
        }
        row
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("tables", &self.inner.tables.len())
            .field("live_channels", &self.live_channels())
            .field("requests", &self.request_count())
            .finish()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn query(&self, query: TableQuery) -> Result<Value, Error> {
        self.simulate_request().await?;

        let matched: Vec<Value> = self
            .inner
            .tables
            .get(&query.table)
            .map(|rows| rows.iter().filter(|row| query.matches(row)).cloned().collect())
            .unwrap_or_default();

        let embeds = query.embeds();
        let mut rows: Vec<Value> = matched
            .into_iter()
            .map(|row| self.embed_relations(row, &embeds))
            .collect();

        if !query.single {
            return Ok(Value::Array(rows));
        }
        match rows.len() {
            0 => Err(Error::NotFound(format!(
                "no row in {} matching {:?}",
                query.table, query.filters
            ))),
            1 => Ok(rows.remove(0)),
            n => Err(Error::Request(format!(
                "expected a single row from {}, found {}",
                query.table, n
            ))),
        }
    }

    async fn invoke(&self, call: ProcedureCall) -> Result<Value, Error> {
        self.simulate_request().await?;

        let procedure = self
            .inner
            .procedures
            .get(&call.name)
            .map(|p| p.value().clone())
            .ok_or_else(|| Error::Procedure {
                name: call.name.clone(),
                message: "procedure not found".to_string(),
            })?;
        procedure(&call.args)
    }
}

impl RealtimeTransport for MemoryBackend {
    fn open_channel(&self, name: &str) -> Box<dyn ChannelHandle> {
        let id = self.inner.next_channel_id.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::new(ChannelShared {
            id,
            name: name.to_string(),
            bindings: Mutex::new(Vec::new()),
            sender: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        self.inner.channels.lock().push(shared.clone());
        self.inner.channel_opens.lock().push(Instant::now());

        let live = self.inner.live_channels.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak_live_channels.fetch_max(live, Ordering::SeqCst);

        tracing::debug!(channel_id = id, name, live, "channel opened");

        Box::new(MemoryChannel {
            shared,
            backend: self.inner.clone(),
        })
    }
}

/// Channel handle returned by [`MemoryBackend`].
struct MemoryChannel {
    shared: Arc<ChannelShared>,
    backend: Arc<Inner>,
}

impl ChannelHandle for MemoryChannel {
    fn on(&mut self, binding: ChangeBinding) {
        let mut bindings = self.shared.bindings.lock();
        bindings.retain(|b| b.id != binding.id);
        bindings.push(binding);
    }

    fn off(&mut self, id: SubscriptionId) {
        self.shared.bindings.lock().retain(|b| b.id != id);
    }

    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ChannelMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.shared.closed.load(Ordering::SeqCst) {
            return rx;
        }
        if self.backend.auto_ack.load(Ordering::SeqCst) {
            let _ = tx.send(ChannelMessage::status(ChannelStatus::Subscribed));
        }
        *self.shared.sender.lock() = Some(tx);
        rx
    }

    fn unsubscribe(&mut self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.sender.lock().take();
        self.backend.live_channels.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(channel_id = self.shared.id, name = %self.shared.name, "channel closed");
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
