//! Shared fixtures for the realtime integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use tillpoint_client::MemoryBackend;
use tillpoint_proto::{ChangeNotification, Order};
use tillpoint_realtime::{
    ChannelConnectionManager, ManualConnectivity, OrderStreamHandler, OrderUpdate,
    RealtimeConfig, StreamError, TokioClock,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Let spawned tasks run without moving virtual time noticeably.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Reconnect settings with short delays and no spacing floor.
pub fn fast_config() -> RealtimeConfig {
    RealtimeConfig::new()
        .with_reconnect_delays(Duration::from_millis(100), Duration::from_secs(10))
        .with_jitter_ratio(0.2)
        .with_min_reconnect_spacing(Duration::ZERO)
        .with_teardown_grace(Duration::from_secs(1))
}

pub struct TestContext {
    pub backend: MemoryBackend,
    pub connectivity: Arc<ManualConnectivity>,
    pub manager: ChannelConnectionManager,
}

impl TestContext {
    pub fn new(config: RealtimeConfig) -> Self {
        init_tracing();
        let backend = MemoryBackend::new();
        backend.relate("order_items", "order_id");
        let connectivity = Arc::new(ManualConnectivity::online());
        let manager = ChannelConnectionManager::start_with(
            Arc::new(backend.clone()),
            config,
            Arc::new(TokioClock),
            connectivity.clone(),
        )
        .unwrap();

        Self {
            backend,
            connectivity,
            manager,
        }
    }

    /// Store an order with one line item.
    pub fn seed_order(&self, id: &str, franchise_id: &str, status: &str) {
        self.backend.upsert_row(
            "orders",
            json!({"id": id, "franchise_id": franchise_id, "status": status, "order_number": 7}),
        );
        self.backend.upsert_row(
            "order_items",
            json!({"id": format!("{id}-i1"), "order_id": id, "name": "Burger", "quantity": 2}),
        );
    }
}

pub fn order_row(id: &str, franchise_id: &str, status: &str) -> Value {
    json!({"id": id, "franchise_id": franchise_id, "status": status})
}

pub fn order_insert(id: &str, franchise_id: &str, status: &str) -> ChangeNotification {
    ChangeNotification::insert("orders", order_row(id, franchise_id, status))
}

pub fn order_update(id: &str, franchise_id: &str, from: &str, to: &str) -> ChangeNotification {
    ChangeNotification::update(
        "orders",
        json!({"id": id, "status": from}),
        order_row(id, franchise_id, to),
    )
}

#[derive(Debug)]
pub enum StreamEvent {
    New(Order),
    Update(OrderUpdate),
    Error(StreamError),
}

/// Handler that forwards every callback into a channel.
pub struct RecordingHandler {
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl RecordingHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<StreamEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { events }), rx)
    }
}

impl OrderStreamHandler for RecordingHandler {
    fn on_new_order(&self, order: Order) {
        let _ = self.events.send(StreamEvent::New(order));
    }

    fn on_order_update(&self, update: OrderUpdate) {
        let _ = self.events.send(StreamEvent::Update(update));
    }

    fn on_error(&self, error: StreamError) {
        let _ = self.events.send(StreamEvent::Error(error));
    }
}

/// Drain everything received so far.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
