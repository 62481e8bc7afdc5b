//! Logical subscriptions multiplexed onto the shared channel.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::time::Instant;

use tillpoint_proto::{ChangeBinding, ChangeNotification, EventKind, RowFilter, SubscriptionId};

use crate::error::Result;

/// Callback invoked for every change a subscription selects.
///
/// Runs on the manager task; keep it short and hand work off elsewhere.
pub type ChangeCallback = Arc<dyn Fn(&ChangeNotification) + Send + Sync>;

/// Request to subscribe to changes of one table.
#[derive(Clone)]
pub struct SubscriptionSpec {
    pub table: String,
    /// Defaults to the manager's configured schema.
    pub schema: Option<String>,
    pub event: EventKind,
    /// Row filter in `column=eq.value` form.
    pub filter: Option<String>,
    pub callback: ChangeCallback,
}

impl SubscriptionSpec {
    /// Subscribe to every event on `table`.
    pub fn new<F>(table: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&ChangeNotification) + Send + Sync + 'static,
    {
        Self {
            table: table.into(),
            schema: None,
            event: EventKind::Any,
            filter: None,
            callback: Arc::new(callback),
        }
    }

    pub fn with_event(mut self, event: EventKind) -> Self {
        self.event = event;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Validate the filter and build the binding sent to the channel.
    pub(crate) fn into_parts(
        self,
        id: SubscriptionId,
        default_schema: &str,
    ) -> Result<(ChangeBinding, ChangeCallback)> {
        let filter = self.filter.as_deref().map(RowFilter::parse).transpose()?;
        let binding = ChangeBinding {
            id,
            schema: self.schema.unwrap_or_else(|| default_schema.to_string()),
            table: self.table,
            event: self.event,
            filter,
        };
        Ok((binding, self.callback))
    }
}

impl fmt::Debug for SubscriptionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionSpec")
            .field("table", &self.table)
            .field("schema", &self.schema)
            .field("event", &self.event)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

/// A registered subscription.
pub(crate) struct SubscriptionEntry {
    pub binding: ChangeBinding,
    pub callback: ChangeCallback,
    pub created_at: Instant,
    pub events_delivered: u64,
}

/// Subscriptions keyed by id, with a per-table index for dispatch.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: HashMap<SubscriptionId, SubscriptionEntry>,
    table_index: HashMap<String, Vec<SubscriptionId>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, binding: ChangeBinding, callback: ChangeCallback, now: Instant) {
        let id = binding.id;
        self.table_index
            .entry(binding.table.clone())
            .or_default()
            .push(id);
        self.entries.insert(
            id,
            SubscriptionEntry {
                binding,
                callback,
                created_at: now,
                events_delivered: 0,
            },
        );
    }

    pub fn remove(&mut self, id: SubscriptionId) -> Option<SubscriptionEntry> {
        let entry = self.entries.remove(&id)?;
        if let Some(ids) = self.table_index.get_mut(&entry.binding.table) {
            ids.retain(|&other| other != id);
            if ids.is_empty() {
                self.table_index.remove(&entry.binding.table);
            }
        }
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bindings of every registered subscription, in id order.
    pub fn bindings(&self) -> Vec<ChangeBinding> {
        let mut bindings: Vec<ChangeBinding> =
            self.entries.values().map(|e| e.binding.clone()).collect();
        bindings.sort_by_key(|b| b.id.0);
        bindings
    }

    /// Invoke the callback of every subscription that selects `change`.
    ///
    /// A panicking callback is logged and does not affect the others.
    /// Returns the number of callbacks that ran to completion.
    pub fn dispatch(&mut self, change: &ChangeNotification) -> usize {
        let Some(ids) = self.table_index.get(&change.table) else {
            return 0;
        };

        let mut delivered = 0;
        for id in ids {
            let Some(entry) = self.entries.get_mut(id) else {
                continue;
            };
            if !entry.binding.matches(change) {
                continue;
            }

            let callback = entry.callback.clone();
            match catch_unwind(AssertUnwindSafe(|| callback(change))) {
                Ok(()) => {
                    entry.events_delivered += 1;
                    delivered += 1;
                }
                Err(panic) => {
                    tracing::error!(
                        subscription_id = %id,
                        table = %change.table,
                        panic = %panic_message(panic.as_ref()),
                        "subscription callback panicked"
                    );
                }
            }
        }
        delivered
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn register(
        registry: &mut SubscriptionRegistry,
        id: u64,
        spec: SubscriptionSpec,
    ) -> SubscriptionId {
        let id = SubscriptionId(id);
        let (binding, callback) = spec.into_parts(id, "public").unwrap();
        registry.insert(binding, callback, Instant::now());
        id
    }

    #[test]
    fn test_spec_rejects_bad_filter() {
        let spec = SubscriptionSpec::new("orders", |_| {}).with_filter("franchise_id>5");
        assert!(spec.into_parts(SubscriptionId(1), "public").is_err());
    }

    #[test]
    fn test_spec_defaults_schema() {
        let (binding, _) = SubscriptionSpec::new("orders", |_| {})
            .with_event(EventKind::Insert)
            .with_filter("franchise_id=eq.f1")
            .into_parts(SubscriptionId(3), "public")
            .unwrap();
        assert_eq!(binding.schema, "public");
        assert_eq!(binding.event, EventKind::Insert);
        assert_eq!(binding.filter, Some(RowFilter::eq("franchise_id", "f1")));
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_table_event_and_filter() {
        let mut registry = SubscriptionRegistry::new();
        let inserts = Arc::new(AtomicUsize::new(0));
        let any = Arc::new(AtomicUsize::new(0));

        let counter = inserts.clone();
        register(
            &mut registry,
            1,
            SubscriptionSpec::new("orders", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .with_event(EventKind::Insert)
            .with_filter("franchise_id=eq.f1"),
        );
        let counter = any.clone();
        register(
            &mut registry,
            2,
            SubscriptionSpec::new("orders", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let own = ChangeNotification::insert("orders", json!({"id": "o1", "franchise_id": "f1"}));
        let other = ChangeNotification::insert("orders", json!({"id": "o2", "franchise_id": "f2"}));
        let delete = ChangeNotification::delete("orders", json!({"id": "o1", "franchise_id": "f1"}));
        let unrelated = ChangeNotification::insert("menu_items", json!({"id": "m1"}));

        assert_eq!(registry.dispatch(&own), 2);
        assert_eq!(registry.dispatch(&other), 1);
        assert_eq!(registry.dispatch(&delete), 1);
        assert_eq!(registry.dispatch(&unrelated), 0);
        assert_eq!(inserts.load(Ordering::SeqCst), 1);
        assert_eq!(any.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_panicking_callback_is_isolated() {
        let mut registry = SubscriptionRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        register(
            &mut registry,
            1,
            SubscriptionSpec::new("orders", |_| panic!("feature bug")),
        );
        let counter = calls.clone();
        register(
            &mut registry,
            2,
            SubscriptionSpec::new("orders", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let change = ChangeNotification::insert("orders", json!({"id": "o1"}));
        assert_eq!(registry.dispatch(&change), 1);
        assert_eq!(registry.dispatch(&change), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_remove_cleans_index() {
        let mut registry = SubscriptionRegistry::new();
        let id = register(&mut registry, 1, SubscriptionSpec::new("orders", |_| {}));
        assert_eq!(registry.len(), 1);

        let entry = registry.remove(id).unwrap();
        assert_eq!(entry.binding.table, "orders");
        assert!(registry.is_empty());
        assert!(registry.remove(id).is_none());
        assert!(registry.bindings().is_empty());

        let change = ChangeNotification::insert("orders", json!({"id": "o1"}));
        assert_eq!(registry.dispatch(&change), 0);
    }
}
