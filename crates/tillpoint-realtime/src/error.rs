//! Realtime layer error types.

use thiserror::Error;

/// Errors returned by the connection manager and listeners.
///
/// Transport failures are not in this list: they are absorbed by the
/// reconnect loop and reported through connection state instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Protocol error, e.g. a malformed row filter.
    #[error("protocol error: {0}")]
    Protocol(#[from] tillpoint_proto::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The connection manager's background task is no longer running.
    #[error("connection manager has stopped")]
    ManagerStopped,
}

/// Errors an order stream reports to its handler.
///
/// None of these stop the stream; it keeps delivering later changes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The shared channel failed. `retrying` is false once the manager has
    /// given up or the host is offline.
    #[error("realtime connection error: {message}")]
    Connection { message: String, retrying: bool },

    /// Fetching the full order failed after all retries.
    #[error("failed to load order {order_id}: {message}")]
    Hydration { order_id: String, message: String },

    /// A change payload did not match the order row shape.
    #[error("malformed order change: {message}")]
    Decode { message: String },
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
