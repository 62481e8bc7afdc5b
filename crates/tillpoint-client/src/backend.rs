//! The request/response half of the backend service.

use async_trait::async_trait;
use serde_json::Value;

use tillpoint_proto::{ProcedureCall, TableQuery};

use crate::error::Error;

/// Read access to the hosted database.
///
/// Business rules (permissions, aggregation, transactional writes) live in
/// stored procedures behind [`Backend::invoke`]; this crate never evaluates
/// them.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Run a table query.
    ///
    /// Returns an array of rows, or a single row object when
    /// [`TableQuery::single`] is set. A single-row query that matches nothing
    /// fails with [`Error::NotFound`].
    async fn query(&self, query: TableQuery) -> Result<Value, Error>;

    /// Call a stored procedure.
    async fn invoke(&self, call: ProcedureCall) -> Result<Value, Error>;
}
