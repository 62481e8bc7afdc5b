//! Tillpoint client - the backend capability consumed by the realtime layer.
//!
//! The hosted backend exposes two things this workspace relies on:
//!
//! - [`Backend`]: table queries and stored-procedure calls
//! - [`RealtimeTransport`]: channels carrying row changes and lifecycle statuses
//!
//! [`MemoryBackend`] implements both in process.
//!
//! # Quick Start
//!
//! ```ignore
//! use tillpoint_client::{Backend, MemoryBackend};
//! use tillpoint_client::proto::TableQuery;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MemoryBackend::new();
//!     backend.upsert_row("orders", serde_json::json!({"id": "E1", "status": "pending"}));
//!
//!     let order = backend
//!         .query(TableQuery::from("orders").eq("id", "E1").single())
//!         .await?;
//!     println!("{order}");
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
pub mod transport;

pub use backend::Backend;
pub use error::Error;
pub use memory::{MemoryBackend, ProcedureFn};
pub use transport::{ChannelHandle, RealtimeTransport};

/// Re-export protocol types.
pub use tillpoint_proto as proto;
