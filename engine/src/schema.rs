//! Schema definition, payload validation and version compatibility.
//!
//! Schemas define the syncable tables, the decode contract of each table's
//! payload, and the conflict policy the resolver applies to it. The schema
//! version is compared between device and cloud before any transfer.

use crate::{
    error::Result, ChangeRecord, Error, OpType, SchemaVersion, TableName, TablePayload,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field in a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None if self.required => Err(Error::MissingRequiredField(self.name.clone())),
            None => Ok(()),
            Some(serde_json::Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(serde_json::Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            // epoch millis or an RFC 3339 string
            FieldType::Timestamp => value.is_u64() || value.is_i64() || value.is_string(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// How the resolver settles a conflicting write to a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Master data: later `last_modified` wins, ties broken by device id
    #[default]
    LastWriteWins,
    /// Critical data (money, stock): never auto-applied, held for an operator
    ManualReview,
}

/// Schema for a syncable table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name
    pub name: TableName,
    /// Conflict policy for this table
    #[serde(default)]
    pub policy: ConflictPolicy,
    /// Field definitions
    pub fields: Vec<FieldDef>,
}

impl TableSchema {
    /// Create a new last-write-wins table schema.
    pub fn new(name: impl Into<TableName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            policy: ConflictPolicy::LastWriteWins,
            fields,
        }
    }

    /// Mark the table as critical: conflicts go to manual review.
    pub fn critical(mut self) -> Self {
        self.policy = ConflictPolicy::ManualReview;
        self
    }

    /// Validate a payload against this schema.
    pub fn validate_payload(&self, payload: &serde_json::Value) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;

        for field in &self.fields {
            field.validate(obj.get(&field.name))?;
        }

        Ok(())
    }
}

/// Schema for the whole synced dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Schema version compared between device and cloud
    pub version: SchemaVersion,
    /// Table schemas by name
    pub tables: BTreeMap<TableName, TableSchema>,
}

impl Schema {
    /// Create a new schema.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            tables: BTreeMap::new(),
        }
    }

    /// Add a table to the schema.
    pub fn add_table(&mut self, table: TableSchema) -> &mut Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    /// Builder-style method to add a table.
    pub fn with_table(mut self, table: TableSchema) -> Self {
        self.add_table(table);
        self
    }

    /// Get a table schema by name.
    pub fn table(&self, name: &str) -> Result<&TableSchema> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::UnknownTable(name.to_string()))
    }

    /// Conflict policy configured for a table.
    pub fn policy_for(&self, name: &str) -> Result<ConflictPolicy> {
        Ok(self.table(name)?.policy)
    }

    /// Validate a raw value against a table and tag it.
    pub fn decode_payload(&self, table: &str, data: serde_json::Value) -> Result<TablePayload> {
        self.table(table)?.validate_payload(&data)?;
        Ok(TablePayload::new(table, data))
    }

    /// Validate a change against the schema.
    pub fn validate_change(&self, change: &ChangeRecord) -> Result<()> {
        let table = self.table(&change.table_name)?;

        if change.version == 0 {
            return Err(Error::InvalidPayload(format!(
                "{}: version must be at least 1",
                change.key()
            )));
        }

        match (change.op_type, &change.payload) {
            (OpType::Delete, _) => Ok(()),
            (_, None) => Err(Error::InvalidPayload(format!(
                "{}: {} requires a payload",
                change.key(),
                change.op_type
            ))),
            (_, Some(payload)) if payload.table != change.table_name => {
                Err(Error::InvalidPayload(format!(
                    "{}: payload tagged for table '{}'",
                    change.key(),
                    payload.table
                )))
            }
            (_, Some(payload)) => table.validate_payload(&payload.data),
        }
    }

    /// Check that the cloud accepts this schema version.
    ///
    /// Compatibility is exact: any difference aborts the sync cycle before a
    /// single record is transmitted.
    pub fn check_compatible(&self, remote: SchemaVersion) -> Result<()> {
        if self.version == remote {
            Ok(())
        } else {
            Err(Error::SchemaMismatch {
                local: self.version,
                remote,
            })
        }
    }

    /// The built-in retail/restaurant schema.
    ///
    /// Catalog and customer tables resolve conflicts last-write-wins; tables
    /// that move money or stock are held for manual review.
    pub fn retail() -> Self {
        use FieldDef as F;
        use FieldType as T;

        Schema::new(1)
            .with_table(TableSchema::new(
                "categories",
                vec![
                    F::required("name", T::String),
                    F::optional("description", T::String),
                ],
            ))
            .with_table(TableSchema::new(
                "products",
                vec![
                    F::required("name", T::String),
                    F::optional("sku", T::String),
                    F::optional("barcode", T::String),
                    F::optional("category_id", T::String),
                    F::optional("price", T::Float),
                    F::optional("cost", T::Float),
                    F::optional("active", T::Bool),
                ],
            ))
            .with_table(TableSchema::new(
                "ingredients",
                vec![
                    F::required("name", T::String),
                    F::optional("unit", T::String),
                    F::optional("cost_per_unit", T::Float),
                    F::optional("supplier_id", T::String),
                ],
            ))
            .with_table(TableSchema::new(
                "customers",
                vec![
                    F::required("name", T::String),
                    F::optional("email", T::String),
                    F::optional("phone", T::String),
                    F::optional("loyalty_points", T::Int),
                ],
            ))
            .with_table(
                TableSchema::new(
                    "orders",
                    vec![
                        F::required("order_number", T::String),
                        F::optional("status", T::String),
                        F::optional("total", T::Float),
                        F::optional("items", T::Json),
                        F::optional("placed_at", T::Timestamp),
                    ],
                )
                .critical(),
            )
            .with_table(
                TableSchema::new(
                    "transactions",
                    vec![
                        F::required("amount", T::Float),
                        F::optional("order_id", T::String),
                        F::optional("payment_method", T::String),
                        F::optional("status", T::String),
                    ],
                )
                .critical(),
            )
            .with_table(
                TableSchema::new(
                    "inventory",
                    vec![
                        F::required("quantity", T::Float),
                        F::optional("product_id", T::String),
                        F::optional("ingredient_id", T::String),
                        F::optional("location_id", T::String),
                    ],
                )
                .critical(),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RecordKey;
    use chrono::Utc;
    use serde_json::json;

    fn test_schema() -> Schema {
        Schema::new(1)
            .with_table(TableSchema::new(
                "ingredients",
                vec![
                    FieldDef::required("name", FieldType::String),
                    FieldDef::required("stock", FieldType::Int),
                    FieldDef::optional("unit", FieldType::String),
                ],
            ))
            .with_table(
                TableSchema::new("sales", vec![FieldDef::required("total", FieldType::Float)])
                    .critical(),
            )
    }

    #[test]
    fn validate_valid_payload() {
        let schema = test_schema();
        let table = schema.table("ingredients").unwrap();

        assert!(table
            .validate_payload(&json!({"name": "Flour", "stock": 30}))
            .is_ok());
        assert!(table
            .validate_payload(&json!({"name": "Flour", "stock": 30, "unit": "kg"}))
            .is_ok());
    }

    #[test]
    fn validate_missing_required_field() {
        let schema = test_schema();
        let table = schema.table("ingredients").unwrap();

        let result = table.validate_payload(&json!({"name": "Flour"}));
        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "stock"));
    }

    #[test]
    fn validate_wrong_type() {
        let schema = test_schema();
        let table = schema.table("ingredients").unwrap();

        let result = table.validate_payload(&json!({"name": "Flour", "stock": "lots"}));
        assert!(matches!(result, Err(Error::TypeMismatch { field, .. }) if field == "stock"));
    }

    #[test]
    fn validate_null_required_field() {
        let schema = test_schema();
        let table = schema.table("ingredients").unwrap();

        let result = table.validate_payload(&json!({"name": null, "stock": 1}));
        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "name"));
    }

    #[test]
    fn unknown_table() {
        let schema = test_schema();
        assert!(matches!(
            schema.decode_payload("widgets", json!({})),
            Err(Error::UnknownTable(t)) if t == "widgets"
        ));
    }

    #[test]
    fn policies_per_table() {
        let schema = test_schema();
        assert_eq!(
            schema.policy_for("ingredients").unwrap(),
            ConflictPolicy::LastWriteWins
        );
        assert_eq!(
            schema.policy_for("sales").unwrap(),
            ConflictPolicy::ManualReview
        );
    }

    #[test]
    fn validate_change_requires_payload_except_delete() {
        let schema = test_schema();
        let key = RecordKey::new("ingredients", "flour");

        let bare_update = ChangeRecord::new(OpType::Update, key.clone(), "till-1", 2, Utc::now());
        assert!(matches!(
            schema.validate_change(&bare_update),
            Err(Error::InvalidPayload(_))
        ));

        let delete = ChangeRecord::new(OpType::Delete, key.clone(), "till-1", 3, Utc::now());
        assert!(schema.validate_change(&delete).is_ok());

        let mistagged = ChangeRecord::new(OpType::Insert, key, "till-1", 1, Utc::now())
            .with_payload(TablePayload::new("sales", json!({"total": 1.0})));
        assert!(matches!(
            schema.validate_change(&mistagged),
            Err(Error::InvalidPayload(msg)) if msg.contains("tagged for table 'sales'")
        ));
    }

    #[test]
    fn compatibility_is_exact() {
        let schema = test_schema();
        assert!(schema.check_compatible(1).is_ok());
        assert_eq!(
            schema.check_compatible(2),
            Err(Error::SchemaMismatch {
                local: 1,
                remote: 2
            })
        );
    }

    #[test]
    fn retail_schema_classes() {
        let schema = Schema::retail();
        for table in ["categories", "products", "ingredients", "customers"] {
            assert_eq!(
                schema.policy_for(table).unwrap(),
                ConflictPolicy::LastWriteWins,
                "{table}"
            );
        }
        for table in ["orders", "transactions", "inventory"] {
            assert_eq!(
                schema.policy_for(table).unwrap(),
                ConflictPolicy::ManualReview,
                "{table}"
            );
        }
    }

    #[test]
    fn field_type_display() {
        assert_eq!(FieldType::String.to_string(), "String");
        assert_eq!(FieldType::Int.to_string(), "Int");
        assert_eq!(FieldType::Json.to_string(), "Json");
    }

    #[test]
    fn schema_serialization() {
        let schema = test_schema();
        let json = serde_json::to_string(&schema).unwrap();
        let parsed: Schema = serde_json::from_str(&json).unwrap();
        assert_eq!(schema, parsed);
    }

    #[test]
    fn policy_defaults_when_absent() {
        let table: TableSchema =
            serde_json::from_value(json!({"name": "notes", "fields": []})).unwrap();
        assert_eq!(table.policy, ConflictPolicy::LastWriteWins);
    }

    #[test]
    fn json_field_accepts_any() {
        let table = TableSchema::new("events", vec![FieldDef::required("data", FieldType::Json)]);

        assert!(table.validate_payload(&json!({"data": "string"})).is_ok());
        assert!(table.validate_payload(&json!({"data": 123})).is_ok());
        assert!(table.validate_payload(&json!({"data": [1, 2, 3]})).is_ok());
        assert!(table
            .validate_payload(&json!({"data": {"nested": "object"}}))
            .is_ok());
    }
}
