//! Table-tagged payload snapshots.
//!
//! Every payload that crosses the engine carries the name of the table it
//! belongs to. The table's [`TableSchema`](crate::TableSchema) is its decode
//! contract; [`TablePayload::decode`] gives producers typed access.

use crate::{error::Result, Error, TableName};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// An immutable copy of a row's fields, tagged with its table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TablePayload {
    pub table: TableName,
    pub data: serde_json::Value,
}

impl TablePayload {
    /// Wrap a JSON value without validating it.
    ///
    /// Prefer [`Schema::decode_payload`](crate::Schema::decode_payload), which
    /// checks the value against the table's field definitions.
    pub fn new(table: impl Into<TableName>, data: serde_json::Value) -> Self {
        Self {
            table: table.into(),
            data,
        }
    }

    /// Decode the snapshot into a producer's own row type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| Error::InvalidPayload(format!("{}: {}", self.table, e)))
    }

    /// Look up a single field.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.data.get(name)
    }
}
