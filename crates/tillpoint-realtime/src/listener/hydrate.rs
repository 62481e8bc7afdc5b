//! Fetching full orders for change notifications.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use tillpoint_client::{Backend, Error as BackendError};
use tillpoint_proto::{Order, ProcedureCall, TableQuery};

use crate::clock::Clock;
use crate::config::{HydrationSource, OrderStreamConfig};
use crate::error::StreamError;

/// Loads an order with its items, with a per-attempt timeout and a small
/// retry budget of its own.
pub(crate) struct Hydrator {
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    table: String,
    source: HydrationSource,
    timeout: Duration,
    retries: u32,
    backoff: Duration,
}

enum FetchError {
    /// Not worth retrying.
    Permanent(String),
    Transient(String),
}

impl Hydrator {
    pub fn new(backend: Arc<dyn Backend>, clock: Arc<dyn Clock>, config: &OrderStreamConfig) -> Self {
        Self {
            backend,
            clock,
            table: config.table.clone(),
            source: config.hydration.clone(),
            timeout: config.hydration_timeout,
            retries: config.hydration_retries,
            backoff: config.hydration_backoff,
        }
    }

    /// Fetch order `id`, retrying transient failures.
    pub async fn fetch(&self, id: &str) -> Result<Order, StreamError> {
        let mut attempt = 0;
        loop {
            let message = match self.fetch_once(id).await {
                Ok(order) => return Ok(order),
                Err(FetchError::Permanent(message)) => message,
                Err(FetchError::Transient(message)) if attempt < self.retries => {
                    attempt += 1;
                    tracing::debug!(order_id = id, attempt, %message, "retrying order hydration");
                    self.clock.sleep(self.backoff * attempt).await;
                    continue;
                }
                Err(FetchError::Transient(message)) => message,
            };

            tracing::warn!(order_id = id, attempts = attempt + 1, %message, "order hydration failed");
            return Err(StreamError::Hydration {
                order_id: id.to_string(),
                message,
            });
        }
    }

    async fn fetch_once(&self, id: &str) -> Result<Order, FetchError> {
        let request = self.request(id);
        let timeout = self.clock.sleep(self.timeout);

        let value = tokio::select! {
            result = request => result.map_err(|e| match e {
                BackendError::NotFound(_)
                | BackendError::Procedure { .. }
                | BackendError::Protocol(_) => {
                    FetchError::Permanent(e.to_string())
                }
                _ => FetchError::Transient(e.to_string()),
            })?,
            _ = timeout => {
                return Err(FetchError::Transient(format!(
                    "timed out after {:?}",
                    self.timeout
                )));
            }
        };

        let value = match value {
            Value::Array(mut rows) if rows.len() == 1 => rows.remove(0),
            Value::Array(rows) => {
                return Err(FetchError::Permanent(format!(
                    "expected one order, got {}",
                    rows.len()
                )));
            }
            other => other,
        };

        serde_json::from_value(value)
            .map_err(|e| FetchError::Permanent(format!("invalid order payload: {}", e)))
    }

    fn request(&self, id: &str) -> BoxFuture<'_, Result<Value, BackendError>> {
        match &self.source {
            HydrationSource::Query { select } => self.backend.query(
                TableQuery::from(self.table.as_str())
                    .select(select.as_str())
                    .eq("id", id)
                    .single(),
            ),
            HydrationSource::Procedure { name, id_arg } => self
                .backend
                .invoke(ProcedureCall::new(name.as_str()).arg(id_arg.as_str(), id)),
        }
    }
}
