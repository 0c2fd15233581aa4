//! Table coordinates and table descriptions.
//!
//! [`TableDescription`] mirrors the parts of a BigQuery table resource the
//! connector cares about (schema, time partitioning, clustering). It is an
//! owned value: storing or handing one to another task is always a deep
//! clone, so a caller mutating its copy never affects a provisioning task.

use serde::{Deserialize, Serialize};
use std::fmt;

/// `project.dataset` coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetRef {
    pub project_id: String,
    pub dataset_id: String,
}

impl DatasetRef {
    pub fn new(project_id: impl Into<String>, dataset_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
        }
    }

    pub fn table(&self, table_id: impl Into<String>) -> TableRef {
        TableRef {
            project_id: self.project_id.clone(),
            dataset_id: self.dataset_id.clone(),
            table_id: table_id.into(),
        }
    }
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project_id, self.dataset_id)
    }
}

/// `project.dataset.table` coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRef {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl TableRef {
    pub fn new(
        project_id: impl Into<String>,
        dataset_id: impl Into<String>,
        table_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
            table_id: table_id.into(),
        }
    }

    pub fn dataset(&self) -> DatasetRef {
        DatasetRef::new(self.project_id.clone(), self.dataset_id.clone())
    }

    /// Standard SQL identifier, e.g. `` `p.d.t` ``.
    pub fn sql_path(&self) -> String {
        format!("`{}.{}.{}`", self.project_id, self.dataset_id, self.table_id)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.project_id, self.dataset_id, self.table_id)
    }
}

/// Column definition. `mode` is `NULLABLE` (default), `REQUIRED` or `REPEATED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Nested columns of a `RECORD`/`STRUCT` field.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            mode: None,
            fields: Vec::new(),
            description: None,
        }
    }

    pub fn repeated(mut self) -> Self {
        self.mode = Some("REPEATED".to_string());
        self
    }

    pub fn with_fields(mut self, fields: Vec<FieldSchema>) -> Self {
        self.fields = fields;
        self
    }

    pub fn is_repeated(&self) -> bool {
        self.mode.as_deref() == Some("REPEATED")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
}

/// `DAY`/`HOUR`/`MONTH`/`YEAR` partitioning, optionally on a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimePartitioning {
    #[serde(rename = "type")]
    pub partition_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_ms: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clustering {
    pub fields: Vec<String>,
}

/// Schema plus physical layout of a table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDescription {
    #[serde(default)]
    pub schema: TableSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_partitioning: Option<TimePartitioning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clustering: Option<Clustering>,
}

impl TableDescription {
    pub fn new(fields: Vec<FieldSchema>) -> Self {
        Self {
            schema: TableSchema { fields },
            time_partitioning: None,
            clustering: None,
        }
    }

    pub fn with_time_partitioning(mut self, partitioning: TimePartitioning) -> Self {
        self.time_partitioning = Some(partitioning);
        self
    }

    pub fn fields(&self) -> &[FieldSchema] {
        &self.schema.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.schema.fields.iter().find(|f| f.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.schema.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_a_table_resource() {
        let resource = json!({
            "schema": {"fields": [
                {"name": "id", "type": "INTEGER", "mode": "REQUIRED"},
                {"name": "tags", "type": "STRING", "mode": "REPEATED"},
                {"name": "geo", "type": "RECORD", "fields": [
                    {"name": "lat", "type": "FLOAT"}
                ]}
            ]},
            "timePartitioning": {"type": "DAY", "field": "updated_at"},
            "numRows": "12"
        });
        let desc: TableDescription = serde_json::from_value(resource).unwrap();
        assert_eq!(desc.fields().len(), 3);
        assert!(desc.field("tags").unwrap().is_repeated());
        assert_eq!(desc.field("geo").unwrap().fields[0].name, "lat");
        assert_eq!(
            desc.time_partitioning.as_ref().unwrap().field.as_deref(),
            Some("updated_at")
        );
    }

    #[test]
    fn clones_do_not_share_state() {
        let original = TableDescription::new(vec![FieldSchema::new("id", "INTEGER")]);
        let mut copy = original.clone();
        copy.schema.fields.push(FieldSchema::new("name", "STRING"));
        assert_eq!(original.fields().len(), 1);
        assert_eq!(copy.fields().len(), 2);
    }

    #[test]
    fn table_ref_formats() {
        let table = DatasetRef::new("proj", "ds").table("events");
        assert_eq!(table.to_string(), "proj:ds.events");
        assert_eq!(table.sql_path(), "`proj.ds.events`");
        assert_eq!(table.dataset().dataset_id, "ds");
    }
}
