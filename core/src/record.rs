use serde_json::{Map, Value};

use crate::errors::SerializationError;

/// One raw item as delivered by a source: field name to dynamically typed value.
///
/// The field set varies per record. Fields the fixed schema does not declare
/// are discarded during normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn from_json_str(raw: &str) -> Result<Self, SerializationError> {
        let value: Value = serde_json::from_str(raw).map_err(|e| SerializationError::Json {
            reason: e.to_string(),
        })?;
        Self::try_from(value)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }

    pub fn with(mut self, field: impl Into<String>, value: Value) -> Self {
        self.insert(field, value);
        self
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Natural id of the item, from `id` or, failing that, `id_str`.
    pub fn id(&self) -> Option<i64> {
        match self.0.get("id") {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .or_else(|| match self.0.get("id_str") {
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Record {
    type Error = SerializationError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(SerializationError::Json {
                reason: format!("expected a JSON object, got {}", type_name(&other)),
            }),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_id_prefers_numeric_field() {
        let record = Record::try_from(json!({"id": 42, "id_str": "43"})).unwrap();
        assert_eq!(record.id(), Some(42));
    }

    #[test]
    fn test_id_falls_back_to_id_str() {
        let record = Record::try_from(json!({"id_str": "1300000000000000000"})).unwrap();
        assert_eq!(record.id(), Some(1_300_000_000_000_000_000));
        assert_eq!(Record::new().id(), None);
    }

    #[test]
    fn test_non_object_rejected() {
        let err = Record::from_json_str("[1, 2, 3]").unwrap_err();
        assert!(err.to_string().contains("array"));
    }
}
