//! Tillpoint realtime layer.
//!
//! Feature code subscribes to table changes through one process-wide
//! [`ChannelConnectionManager`], which multiplexes every subscription onto a
//! single realtime channel and reconnects it with exponential backoff when it
//! fails. [`OrderStreamListener`] builds per-franchise order streams on top.
//!
//! # Modules
//!
//! - [`manager`] - The channel connection manager
//! - [`subscription`] - Subscription requests and callback dispatch
//! - [`backoff`] - Reconnect delay policy
//! - [`state`] - Observable connection state
//! - [`listener`] - Order streams
//! - [`config`] - Configuration and command line arguments
//! - [`clock`] - Injected time source
//! - [`connectivity`] - Injected network state
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tillpoint_realtime::{ChannelConnectionManager, RealtimeConfig, SubscriptionSpec};
//!
//! let manager = ChannelConnectionManager::start(transport, RealtimeConfig::default())?;
//! let id = manager
//!     .subscribe(
//!         SubscriptionSpec::new("menu_items", |change| println!("{:?}", change.change_type))
//!             .with_filter("franchise_id=eq.F1"),
//!     )
//!     .await?;
//! manager.unsubscribe(id).await;
//! ```

pub mod backoff;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod listener;
pub mod manager;
pub mod state;
pub mod subscription;

pub use backoff::{ReconnectPolicy, RetryPlan};
pub use clock::{Clock, TokioClock};
pub use config::{HydrationSource, OrderStreamConfig, RealtimeArgs, RealtimeConfig};
pub use connectivity::{ConnectivityObserver, ManualConnectivity, NetworkState};
pub use error::{Error, Result, StreamError};
pub use listener::{
    GateDecision, ListenerState, OrderStream, OrderStreamHandler, OrderStreamListener,
    OrderUpdate, StreamHealth, UpdateGatePolicy,
};
pub use manager::ChannelConnectionManager;
pub use state::{ConnectionPhase, ConnectionState};
pub use subscription::{ChangeCallback, SubscriptionSpec};
