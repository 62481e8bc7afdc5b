//! Decides which order updates are worth showing.

use std::collections::HashMap;

use serde_json::Value;

use tillpoint_proto::{OrderRow, OrderStatus};

/// Which updates reach the feature.
///
/// An update passes when the status changed, or when the line items changed
/// while the order is in one of `item_edit_statuses`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateGatePolicy {
    /// Statuses in which item edits are still shown.
    pub item_edit_statuses: Vec<OrderStatus>,
    /// Transition flagged on forwarded updates.
    pub highlight_from: OrderStatus,
    pub highlight_to: OrderStatus,
}

impl Default for UpdateGatePolicy {
    fn default() -> Self {
        Self {
            item_edit_statuses: vec![OrderStatus::Preparing],
            highlight_from: OrderStatus::Pending,
            highlight_to: OrderStatus::Preparing,
        }
    }
}

/// Outcome of [`UpdateGatePolicy::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDecision {
    pub forward: bool,
    pub status_changed: bool,
    pub items_changed: bool,
    pub previous_status: Option<OrderStatus>,
    pub is_highlight_transition: bool,
}

impl UpdateGatePolicy {
    /// Evaluate an update.
    ///
    /// `previous_status` is the status before the update, if known. An
    /// unknown previous status with a known new one counts as a change.
    /// Items only count as changed when both snapshots carry them.
    pub fn evaluate(
        &self,
        previous_status: Option<OrderStatus>,
        old_items: Option<&Value>,
        new: &OrderRow,
    ) -> GateDecision {
        let status_changed = match (previous_status, new.status) {
            (Some(before), Some(after)) => before != after,
            (None, Some(_)) => true,
            (_, None) => false,
        };

        let items_changed = match (old_items, new.items.as_ref()) {
            (Some(before), Some(after)) => before != after,
            _ => false,
        };

        let editable = new
            .status
            .is_some_and(|status| self.item_edit_statuses.contains(&status));

        let is_highlight_transition = status_changed
            && previous_status == Some(self.highlight_from)
            && new.status == Some(self.highlight_to);

        GateDecision {
            forward: status_changed || (items_changed && editable),
            status_changed,
            items_changed,
            previous_status,
            is_highlight_transition,
        }
    }
}

/// Last known status per open order.
///
/// Fills in the previous status when an update's old row omits it. Orders
/// are forgotten once they reach a final status.
#[derive(Debug, Default)]
pub(crate) struct StatusHistory {
    statuses: HashMap<String, OrderStatus>,
}

impl StatusHistory {
    /// Record the row's status and return the status it replaced.
    ///
    /// `old_status` from the change feed wins over the remembered one.
    pub fn observe(&mut self, row: &OrderRow, old_status: Option<OrderStatus>) -> Option<OrderStatus> {
        let previous = old_status.or_else(|| self.statuses.get(&row.id).copied());
        match row.status {
            Some(status) if status.is_final() => {
                self.statuses.remove(&row.id);
            }
            Some(status) => {
                self.statuses.insert(row.id.clone(), status);
            }
            None => {}
        }
        previous
    }

    pub fn clear(&mut self) {
        self.statuses.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.statuses.len()
    }
}
