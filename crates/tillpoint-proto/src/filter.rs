//! Row filter predicates.
//!
//! Subscriptions may narrow a table's change feed with a single equality
//! predicate written as `column=eq.value`, e.g. `franchise_id=eq.F1`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// An equality predicate over one column of a row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowFilter {
    /// Column the predicate applies to.
    pub column: String,
    /// Expected value, in its textual form.
    pub value: String,
}

impl RowFilter {
    /// Create an equality filter.
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Parse a `column=eq.value` expression.
    pub fn parse(expr: &str) -> Result<Self, Error> {
        let invalid = |reason: &str| Error::InvalidFilter {
            filter: expr.to_string(),
            reason: reason.to_string(),
        };

        let (column, rhs) = expr
            .split_once('=')
            .ok_or_else(|| invalid("expected 'column=eq.value'"))?;
        let column = column.trim();
        if column.is_empty() {
            return Err(invalid("column name is empty"));
        }

        let value = rhs
            .strip_prefix("eq.")
            .ok_or_else(|| invalid("only the 'eq' operator is supported"))?;

        Ok(Self::eq(column, value))
    }

    /// Check whether a row satisfies this predicate.
    ///
    /// Rows that are not JSON objects, or that lack the column, never match.
    pub fn matches(&self, row: &Value) -> bool {
        let Some(field) = row.get(&self.column) else {
            return false;
        };

        match field {
            Value::String(s) => *s == self.value,
            Value::Number(n) => n.to_string() == self.value,
            Value::Bool(b) => b.to_string() == self.value,
            Value::Null => self.value == "null",
            Value::Array(_) | Value::Object(_) => false,
        }
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

impl FromStr for RowFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_eq() {
        let filter = RowFilter::parse("franchise_id=eq.F1").unwrap();
        assert_eq!(filter.column, "franchise_id");
        assert_eq!(filter.value, "F1");
        assert_eq!(filter.to_string(), "franchise_id=eq.F1");
    }

    #[test]
    fn test_parse_keeps_dots_in_value() {
        let filter: RowFilter = "email=eq.a.b@c.d".parse().unwrap();
        assert_eq!(filter.value, "a.b@c.d");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(RowFilter::parse("franchise_id").is_err());
        assert!(RowFilter::parse("=eq.F1").is_err());
        assert!(RowFilter::parse("total=gt.10").is_err());
    }

    #[test]
    fn test_matches_scalar_types() {
        let row = json!({"franchise_id": "F1", "table_no": 7, "paid": false, "note": null});

        assert!(RowFilter::eq("franchise_id", "F1").matches(&row));
        assert!(!RowFilter::eq("franchise_id", "F2").matches(&row));
        assert!(RowFilter::eq("table_no", "7").matches(&row));
        assert!(RowFilter::eq("paid", "false").matches(&row));
        assert!(RowFilter::eq("note", "null").matches(&row));
        assert!(!RowFilter::eq("missing", "x").matches(&row));
    }

    #[test]
    fn test_non_object_rows_never_match() {
        assert!(!RowFilter::eq("id", "1").matches(&json!([1, 2])));
        assert!(!RowFilter::eq("id", "1").matches(&Value::Null));
    }
}
