use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use crate::errors::{ConfigError, SchemaMismatchError};

/// Zone attached to timestamp columns. A fixed offset is understood by every
/// arrow writer; named zones need the `chrono-tz` feature.
pub const TIMESTAMP_ZONE: &str = "+00:00";

/// Declared storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Utf8,
    Int64,
    Boolean,
    /// Milliseconds since the unix epoch, UTC.
    Timestamp,
}

impl ColumnType {
    pub fn to_arrow(self) -> DataType {
        match self {
            ColumnType::Utf8 => DataType::Utf8,
            ColumnType::Int64 => DataType::Int64,
            ColumnType::Boolean => DataType::Boolean,
            ColumnType::Timestamp => {
                DataType::Timestamp(TimeUnit::Millisecond, Some(TIMESTAMP_ZONE.into()))
            }
        }
    }
}

/// Explicit transform applied to a column before it is materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Coercion {
    /// Nested structures become canonical JSON text; text passes through.
    JsonText,
    /// Missing booleans become `false`, whatever the declared default.
    FillFalse,
    /// Missing integer identifiers become `0`, whatever the declared default.
    FillZero,
    /// Timestamp text or epoch milliseconds.
    Timestamp,
    /// Values already of the declared type pass through. Anything else fails
    /// the strict pass and is stringified when the column is salvaged.
    Auto,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    #[serde(default)]
    pub default: Value,
    pub coercion: Coercion,
}

impl ColumnSpec {
    pub fn new(name: &str, column_type: ColumnType, default: Value, coercion: Coercion) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            default,
            coercion,
        }
    }

    fn text(name: &str) -> Self {
        Self::new(name, ColumnType::Utf8, Value::Null, Coercion::Auto)
    }

    fn json(name: &str) -> Self {
        Self::new(name, ColumnType::Utf8, Value::Null, Coercion::JsonText)
    }

    fn int(name: &str) -> Self {
        Self::new(name, ColumnType::Int64, Value::from(0), Coercion::FillZero)
    }

    fn flag(name: &str) -> Self {
        Self::new(name, ColumnType::Boolean, Value::Bool(false), Coercion::FillFalse)
    }

    fn timestamp(name: &str) -> Self {
        Self::new(name, ColumnType::Timestamp, Value::Null, Coercion::Timestamp)
    }
}

/// The ordered column list every emitted table must match for a whole run.
#[derive(Debug, Clone)]
pub struct FixedSchema {
    columns: Vec<ColumnSpec>,
    arrow: SchemaRef,
}

impl FixedSchema {
    pub fn new(columns: Vec<ColumnSpec>) -> Result<Self, ConfigError> {
        if columns.is_empty() {
            return Err(ConfigError::Invalid {
                message: "fixed schema needs at least one column".to_string(),
            });
        }
        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(ConfigError::Invalid {
                    message: format!("duplicate schema column '{}'", column.name),
                });
            }
        }

        let fields: Vec<Field> = columns
            .iter()
            .map(|c| Field::new(&c.name, c.column_type.to_arrow(), true))
            .collect();

        Ok(Self {
            columns,
            arrow: Arc::new(Schema::new(fields)),
        })
    }

    /// Schema of post-like items as returned by the search and hydration
    /// endpoints, declared in lexicographic order.
    pub fn posts() -> Self {
        let columns = vec![
            ColumnSpec::json("contributors"),
            ColumnSpec::json("coordinates"),
            ColumnSpec::timestamp("created_at"),
            ColumnSpec::json("display_text_range"),
            ColumnSpec::json("entities"),
            ColumnSpec::json("extended_entities"),
            ColumnSpec::int("favorite_count"),
            ColumnSpec::flag("favorited"),
            ColumnSpec::json("followers"),
            ColumnSpec::text("full_text"),
            ColumnSpec::json("geo"),
            ColumnSpec::int("id"),
            ColumnSpec::text("id_str"),
            ColumnSpec::text("in_reply_to_screen_name"),
            ColumnSpec::int("in_reply_to_status_id"),
            ColumnSpec::text("in_reply_to_status_id_str"),
            ColumnSpec::int("in_reply_to_user_id"),
            ColumnSpec::text("in_reply_to_user_id_str"),
            ColumnSpec::flag("is_quote_status"),
            ColumnSpec::text("lang"),
            ColumnSpec::json("place"),
            ColumnSpec::flag("possibly_sensitive"),
            ColumnSpec::json("quoted_status"),
            ColumnSpec::int("quoted_status_id"),
            ColumnSpec::text("quoted_status_id_str"),
            ColumnSpec::json("quoted_status_permalink"),
            ColumnSpec::int("retweet_count"),
            ColumnSpec::flag("retweeted"),
            ColumnSpec::json("retweeted_status"),
            ColumnSpec::json("scopes"),
            ColumnSpec::text("source"),
            ColumnSpec::flag("truncated"),
            ColumnSpec::json("user"),
            ColumnSpec::json("withheld_in_countries"),
        ];
        // The column list above is static and duplicate free.
        match Self::new(columns) {
            Ok(schema) => schema,
            Err(e) => unreachable!("built-in post schema is invalid: {e}"),
        }
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn arrow_schema(&self) -> SchemaRef {
        self.arrow.clone()
    }

    /// Checks name, order and type of every column against `actual`.
    pub fn verify(&self, actual: &Schema) -> Result<(), SchemaMismatchError> {
        let expected = self.arrow.fields();
        let found = actual.fields();
        if expected.len() != found.len() {
            return Err(SchemaMismatchError::ColumnCount {
                expected: expected.len(),
                actual: found.len(),
            });
        }
        for (index, (e, a)) in expected.iter().zip(found.iter()).enumerate() {
            if e.name() != a.name() || e.data_type() != a.data_type() {
                return Err(SchemaMismatchError::Column {
                    index,
                    expected: format!("{}: {}", e.name(), e.data_type()),
                    actual: format!("{}: {}", a.name(), a.data_type()),
                });
            }
        }
        Ok(())
    }
}
