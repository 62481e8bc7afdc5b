//! Order records as stored in the `orders` and `order_items` tables.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Table holding orders.
pub const ORDERS_TABLE: &str = "orders";

/// Table holding order line items.
pub const ORDER_ITEMS_TABLE: &str = "order_items";

/// Lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Preparing,
    Ready,
    Completed,
    Cancelled,
}

impl OrderStatus {
    /// Whether the order has left the kitchen for good.
    pub fn is_final(self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: String,
    #[serde(default)]
    pub menu_item_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub unit_price: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_quantity() -> u32 {
    1
}

/// A fully hydrated order with its line items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub franchise_id: String,
    pub status: OrderStatus,
    #[serde(default)]
    pub order_number: Option<i64>,
    #[serde(default)]
    pub table_number: Option<String>,
    #[serde(default)]
    pub total: Option<f64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "order_items")]
    pub items: Vec<OrderItem>,
}

/// A possibly partial `orders` row as carried by the change feed.
///
/// Only the primary key is guaranteed; the old snapshot of an update often
/// carries nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRow {
    pub id: String,
    #[serde(default)]
    pub franchise_id: Option<String>,
    #[serde(default)]
    pub status: Option<OrderStatus>,
    /// Denormalized line items, if the table carries them.
    #[serde(default)]
    pub items: Option<Value>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}
