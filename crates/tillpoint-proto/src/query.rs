//! Read requests sent to the backend: table queries and procedure calls.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::filter::RowFilter;

/// A relation embedded in a table query's select list, e.g. `order_items(*)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Embed {
    /// Name of the related table.
    pub table: String,
    /// Columns selected from the related table.
    pub columns: String,
}

/// A filtered read of one table.
///
/// Mirrors the fluent `from(table).select(..).eq(..).single()` style of the
/// backend's query builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableQuery {
    /// The table to read.
    pub table: String,
    /// The raw select list.
    pub select: String,
    /// Equality filters, all of which must hold.
    pub filters: Vec<RowFilter>,
    /// Expect exactly one row.
    pub single: bool,
}

impl TableQuery {
    /// Start a query over a table, selecting every column.
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            select: "*".to_string(),
            filters: Vec::new(),
            single: false,
        }
    }

    /// Set the select list.
    pub fn select(mut self, columns: impl Into<String>) -> Self {
        self.select = columns.into();
        self
    }

    /// Add an equality filter.
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push(RowFilter::eq(column, value));
        self
    }

    /// Expect a single row.
    pub fn single(mut self) -> Self {
        self.single = true;
        self
    }

    /// Embedded relations named in the select list.
    pub fn embeds(&self) -> Vec<Embed> {
        self.select
            .split(',')
            .filter_map(|part| {
                let part = part.trim();
                let open = part.find('(')?;
                let columns = part[open + 1..].strip_suffix(')')?;
                Some(Embed {
                    table: part[..open].trim().to_string(),
                    columns: columns.trim().to_string(),
                })
            })
            .collect()
    }

    /// Check whether a row passes every filter.
    pub fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }
}

/// A call to a server-side stored procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureCall {
    /// Procedure name.
    pub name: String,
    /// Named arguments as a JSON object.
    pub args: Value,
}

impl ProcedureCall {
    /// Create a call with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Value::Object(Default::default()),
        }
    }

    /// Add a named argument.
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Value::Object(map) = &mut self.args {
            map.insert(key.into(), value.into());
        }
        self
    }
}
