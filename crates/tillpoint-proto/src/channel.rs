//! Realtime channel vocabulary: bindings, statuses and messages.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::change::{ChangeNotification, EventKind};
use crate::filter::RowFilter;

/// Opaque identifier of a logical subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// An event matcher attached to a channel before or after it subscribes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBinding {
    /// The logical subscription this binding serves.
    pub id: SubscriptionId,
    /// Database schema of the watched table.
    pub schema: String,
    /// Watched table.
    pub table: String,
    /// Change types of interest.
    pub event: EventKind,
    /// Optional row predicate.
    pub filter: Option<RowFilter>,
}

impl ChangeBinding {
    /// Check whether a notification is selected by this binding.
    pub fn matches(&self, change: &ChangeNotification) -> bool {
        if change.table != self.table || change.schema != self.schema {
            return false;
        }
        if !self.event.accepts(change.change_type) {
            return false;
        }
        match &self.filter {
            None => true,
            Some(filter) => change
                .subject_row()
                .map(|row| filter.matches(row))
                .unwrap_or(false),
        }
    }
}

/// Channel lifecycle statuses reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    /// The server acknowledged the channel subscription.
    Subscribed,
    /// The channel was closed.
    Closed,
    /// The channel reported an error.
    ChannelError,
    /// The transport gave up waiting for the acknowledgment.
    TimedOut,
}

impl ChannelStatus {
    /// Whether this status ends the channel's useful life.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ChannelStatus::Subscribed)
    }
}

/// A message flowing from a subscribed channel to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    /// A lifecycle status, with the transport's error text if any.
    Status {
        status: ChannelStatus,
        error: Option<String>,
    },
    /// A row change.
    Change(ChangeNotification),
}

impl ChannelMessage {
    /// Create a status message without error text.
    pub fn status(status: ChannelStatus) -> Self {
        ChannelMessage::Status {
            status,
            error: None,
        }
    }

    /// Create a status message carrying error text.
    pub fn failure(status: ChannelStatus, error: impl Into<String>) -> Self {
        ChannelMessage::Status {
            status,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeNotification;
    use serde_json::json;

    fn binding(event: EventKind, filter: Option<RowFilter>) -> ChangeBinding {
        ChangeBinding {
            id: SubscriptionId(1),
            schema: "public".into(),
            table: "orders".into(),
            event,
            filter,
        }
    }

    #[test]
    fn test_binding_matches_table_event_filter() {
        let b = binding(EventKind::Insert, Some(RowFilter::eq("franchise_id", "F1")));

        let hit = ChangeNotification::insert("orders", json!({"id": "1", "franchise_id": "F1"}));
        let other_scope = ChangeNotification::insert("orders", json!({"id": "2", "franchise_id": "F2"}));
        let other_table = ChangeNotification::insert("menu_items", json!({"franchise_id": "F1"}));
        let other_event = ChangeNotification::delete("orders", json!({"franchise_id": "F1"}));

        assert!(b.matches(&hit));
        assert!(!b.matches(&other_scope));
        assert!(!b.matches(&other_table));
        assert!(!b.matches(&other_event));
    }

    #[test]
    fn test_binding_any_matches_delete_on_old_row() {
        let b = binding(EventKind::Any, Some(RowFilter::eq("franchise_id", "F1")));
        let change = ChangeNotification::delete("orders", json!({"id": "1", "franchise_id": "F1"}));
        assert!(b.matches(&change));
    }

    #[test]
    fn test_binding_respects_schema() {
        let b = binding(EventKind::Any, None);
        let change = ChangeNotification::insert("orders", json!({})).with_schema("audit");
        assert!(!b.matches(&change));
    }

    #[test]
    fn test_status_terminal() {
        assert!(!ChannelStatus::Subscribed.is_terminal());
        assert!(ChannelStatus::Closed.is_terminal());
        assert!(ChannelStatus::ChannelError.is_terminal());
        assert!(ChannelStatus::TimedOut.is_terminal());
    }

    #[test]
    fn test_subscription_id_display() {
        assert_eq!(SubscriptionId(42).to_string(), "sub-42");
    }
}
