//! Change notifications delivered by the realtime feed.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Types of changes that can occur to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    /// A new row was inserted.
    Insert,
    /// An existing row was updated.
    Update,
    /// A row was deleted.
    Delete,
}

/// The change types a subscription listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
    /// Every change type.
    #[default]
    #[serde(rename = "*")]
    Any,
}

impl EventKind {
    /// Check whether a change of the given type is selected by this kind.
    pub fn accepts(self, change_type: ChangeType) -> bool {
        matches!(
            (self, change_type),
            (EventKind::Any, _)
                | (EventKind::Insert, ChangeType::Insert)
                | (EventKind::Update, ChangeType::Update)
                | (EventKind::Delete, ChangeType::Delete)
        )
    }
}

impl From<ChangeType> for EventKind {
    fn from(change_type: ChangeType) -> Self {
        match change_type {
            ChangeType::Insert => EventKind::Insert,
            ChangeType::Update => EventKind::Update,
            ChangeType::Delete => EventKind::Delete,
        }
    }
}

/// A raw change notification with untyped row snapshots.
///
/// `old` is only populated for updates and deletes, and may carry just the
/// primary key depending on the table's replica identity. An empty object is
/// treated the same as an absent snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// The type of change.
    #[serde(rename = "eventType")]
    pub change_type: ChangeType,
    /// Schema of the changed table.
    pub schema: String,
    /// The table that changed.
    pub table: String,
    /// Row snapshot after the change.
    #[serde(default)]
    pub new: Option<Value>,
    /// Row snapshot before the change.
    #[serde(default)]
    pub old: Option<Value>,
    /// When the change was committed, if the feed reports it.
    #[serde(default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl ChangeNotification {
    /// Create a notification for a table in the `public` schema.
    pub fn new(change_type: ChangeType, table: impl Into<String>) -> Self {
        Self {
            change_type,
            schema: crate::DEFAULT_SCHEMA.to_string(),
            table: table.into(),
            new: None,
            old: None,
            commit_timestamp: None,
        }
    }

    /// Create an insert notification.
    pub fn insert(table: impl Into<String>, new: Value) -> Self {
        Self::new(ChangeType::Insert, table).with_new(new)
    }

    /// Create an update notification.
    pub fn update(table: impl Into<String>, old: Value, new: Value) -> Self {
        Self::new(ChangeType::Update, table)
            .with_old(old)
            .with_new(new)
    }

    /// Create a delete notification.
    pub fn delete(table: impl Into<String>, old: Value) -> Self {
        Self::new(ChangeType::Delete, table).with_old(old)
    }

    /// Set the schema.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Set the new row snapshot.
    pub fn with_new(mut self, new: Value) -> Self {
        self.new = Some(new);
        self
    }

    /// Set the old row snapshot.
    pub fn with_old(mut self, old: Value) -> Self {
        self.old = Some(old);
        self
    }

    /// Set the commit timestamp.
    pub fn with_commit_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.commit_timestamp = Some(at);
        self
    }

    /// The new row snapshot, if present and non-empty.
    pub fn new_row(&self) -> Option<&Value> {
        non_empty(self.new.as_ref())
    }

    /// The old row snapshot, if present and non-empty.
    pub fn old_row(&self) -> Option<&Value> {
        non_empty(self.old.as_ref())
    }

    /// The row a filter should be evaluated against.
    ///
    /// Deletes only carry the old row; everything else uses the new row,
    /// falling back to the old one when the feed omitted it.
    pub fn subject_row(&self) -> Option<&Value> {
        match self.change_type {
            ChangeType::Delete => self.old_row(),
            ChangeType::Insert | ChangeType::Update => self.new_row().or_else(|| self.old_row()),
        }
    }

    /// Decode both snapshots into a per-table row type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<TypedChange<T>, Error> {
        Ok(TypedChange {
            change_type: self.change_type,
            schema: self.schema.clone(),
            table: self.table.clone(),
            new: self.decode_row(self.new_row())?,
            old: self.decode_row(self.old_row())?,
            commit_timestamp: self.commit_timestamp,
        })
    }

    fn decode_row<T: DeserializeOwned>(&self, row: Option<&Value>) -> Result<Option<T>, Error> {
        row.map(|value| {
            serde_json::from_value(value.clone()).map_err(|e| Error::Decode {
                table: self.table.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
    }
}

fn non_empty(value: Option<&Value>) -> Option<&Value> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) if map.is_empty() => None,
        Some(v) => Some(v),
    }
}

/// A change notification whose snapshots were validated as `T`.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedChange<T> {
    pub change_type: ChangeType,
    pub schema: String,
    pub table: String,
    pub new: Option<T>,
    pub old: Option<T>,
    pub commit_timestamp: Option<DateTime<Utc>>,
}
