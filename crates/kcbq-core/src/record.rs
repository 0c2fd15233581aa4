//! Records crossing the stream boundary and rows ready for insertion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ConnectorError, Result};
use crate::table::TableDescription;

/// A stream record.
///
/// Serialized with the same field names the stream side uses
/// (`key`, `keySchema`, `value`, `valueSchema`, `timestamp`, `partition`,
/// `topic`), so a record produced by a source task can be read back by a
/// sink task's default converter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(deserialize_with = "deserialize_key")]
    pub key: String,
    #[serde(default)]
    pub key_schema: Option<Value>,
    /// `None` is the logical delete signal.
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub value_schema: Option<TableDescription>,
    pub timestamp: DateTime<Utc>,
    /// `-1` when unassigned.
    #[serde(default = "unassigned_partition")]
    pub partition: i32,
    #[serde(default)]
    pub topic: String,
}

fn unassigned_partition() -> i32 {
    -1
}

fn deserialize_key<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(key_from_value(&value).unwrap_or_default())
}

impl Record {
    pub fn new(key: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            key: key.into(),
            key_schema: None,
            value,
            value_schema: None,
            timestamp: Utc::now(),
            partition: -1,
            topic: String::new(),
        }
    }

    pub fn with_schema(mut self, schema: TableDescription) -> Self {
        self.value_schema = Some(schema);
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = partition;
        self
    }

    /// `true` when the value is absent or JSON `null`.
    pub fn is_delete(&self) -> bool {
        matches!(self.value, None | Some(Value::Null))
    }

    /// Rejects records without a usable key.
    pub fn validate_key(&self, column: &str) -> Result<()> {
        if self.key.trim().is_empty() {
            return Err(ConnectorError::MissingKey {
                column: column.to_string(),
            });
        }
        Ok(())
    }
}

/// Coerces a JSON scalar into a record key.
///
/// Strings are taken as-is, numbers and booleans use their textual form.
/// `null`, empty strings and compound values yield `None`.
pub fn key_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// One row of an `insertAll` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    /// Deduplication key for the backend, taken from the id column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert_id: Option<String>,
    pub json: Map<String, Value>,
}

impl Row {
    /// Builds a row from a record value.
    ///
    /// When `id_column` is set, the row's insert id is the coerced value of
    /// that column and a missing value is an error.
    pub fn from_value(key: &str, value: Value, id_column: Option<&str>) -> Result<Self> {
        let json = match value {
            Value::Object(map) => map,
            other => {
                return Err(ConnectorError::InvalidRow {
                    key: key.to_string(),
                    reason: format!("expected a JSON object, got `{other}`"),
                })
            }
        };

        let insert_id = match id_column {
            Some(column) => Some(json.get(column).and_then(key_from_value).ok_or_else(|| {
                ConnectorError::MissingInsertId {
                    key: key.to_string(),
                    column: column.to_string(),
                }
            })?),
            None => None,
        };

        Ok(Self { insert_id, json })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_coerced_from_scalars() {
        assert_eq!(key_from_value(&json!("abc")).as_deref(), Some("abc"));
        assert_eq!(key_from_value(&json!(42)).as_deref(), Some("42"));
        assert_eq!(key_from_value(&json!(true)).as_deref(), Some("true"));
        assert_eq!(key_from_value(&json!("")), None);
        assert_eq!(key_from_value(&Value::Null), None);
        assert_eq!(key_from_value(&json!({"a": 1})), None);
    }

    #[test]
    fn row_takes_insert_id_from_the_id_column() {
        let row = Row::from_value("k", json!({"id": 7, "name": "x"}), Some("id")).unwrap();
        assert_eq!(row.insert_id.as_deref(), Some("7"));
        let wire = serde_json::to_value(&row).unwrap();
        assert_eq!(wire, json!({"insertId": "7", "json": {"id": 7, "name": "x"}}));
    }

    #[test]
    fn row_without_id_column_has_no_insert_id() {
        let row = Row::from_value("k", json!({"name": "x"}), None).unwrap();
        assert!(row.insert_id.is_none());
        assert!(serde_json::to_value(&row).unwrap().get("insertId").is_none());
    }

    #[test]
    fn missing_id_column_is_an_error() {
        let err = Row::from_value("k", json!({"name": "x"}), Some("id")).unwrap_err();
        assert!(matches!(err, ConnectorError::MissingInsertId { .. }));
    }

    #[test]
    fn non_object_values_are_rejected() {
        let err = Row::from_value("k", json!([1, 2]), None).unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidRow { .. }));
    }

    #[test]
    fn record_json_uses_stream_field_names() {
        let record = Record::new("1", Some(json!({"id": 1}))).with_topic("t");
        let wire = serde_json::to_value(&record).unwrap();
        assert_eq!(wire["partition"], json!(-1));
        assert!(wire.get("valueSchema").is_some());
        assert!(wire["timestamp"].as_str().unwrap().contains('T'));

        let back: Record = serde_json::from_value(json!({
            "key": 5,
            "value": null,
            "timestamp": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(back.key, "5");
        assert!(back.is_delete());
        assert_eq!(back.partition, -1);
    }

    #[test]
    fn empty_key_fails_validation() {
        let record = Record::new("", Some(json!({})));
        assert!(matches!(
            record.validate_key("id"),
            Err(ConnectorError::MissingKey { .. })
        ));
    }
}
