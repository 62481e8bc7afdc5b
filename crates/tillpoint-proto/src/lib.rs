//! Tillpoint protocol types.
//!
//! This crate defines the data exchanged between the realtime layer, the
//! backend service and feature code.
//!
//! # Modules
//!
//! - [`change`] - Change notifications and change types
//! - [`filter`] - `column=eq.value` row predicates
//! - [`channel`] - Channel bindings, statuses and messages
//! - [`query`] - Table queries and procedure calls
//! - [`order`] - Order records
//! - [`error`] - Protocol error types
//!
//! Change payloads arrive as untyped JSON; decode them into a row type at the
//! boundary:
//!
//! ```ignore
//! use tillpoint_proto::{ChangeNotification, OrderRow};
//!
//! let change: ChangeNotification = serde_json::from_str(payload)?;
//! let typed = change.decode::<OrderRow>()?;
//! ```

pub mod change;
pub mod channel;
pub mod error;
pub mod filter;
pub mod order;
pub mod query;

pub use error::Error;

// Re-export commonly used types at crate root
pub use change::{ChangeNotification, ChangeType, EventKind, TypedChange};
pub use channel::{ChangeBinding, ChannelMessage, ChannelStatus, SubscriptionId};
pub use filter::RowFilter;
pub use order::{Order, OrderItem, OrderRow, OrderStatus, ORDERS_TABLE, ORDER_ITEMS_TABLE};
pub use query::{Embed, ProcedureCall, TableQuery};

/// Schema used when a subscription does not name one.
pub const DEFAULT_SCHEMA: &str = "public";
