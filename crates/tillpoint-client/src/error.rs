//! Client error types.

use thiserror::Error;

/// Errors returned by a backend.
#[derive(Debug, Error)]
pub enum Error {
    /// The request reached the backend but failed.
    #[error("request failed: {0}")]
    Request(String),

    /// A single-row query matched nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// A stored procedure returned an error.
    #[error("procedure '{name}' failed: {message}")]
    Procedure { name: String, message: String },

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] tillpoint_proto::Error),

    /// Request timed out.
    #[error("request timed out")]
    Timeout,
}
