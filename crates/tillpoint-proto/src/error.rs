//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A row filter expression could not be parsed.
    #[error("invalid filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    /// A change payload did not match the expected row shape.
    #[error("failed to decode {table} row: {reason}")]
    Decode { table: String, reason: String },

    /// Invalid message format.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
