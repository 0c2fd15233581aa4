//! Connector and host configuration loaded from YAML.
//!
//! # Example
//!
//! ```yaml
//! kafka:
//!   brokers: "localhost:9092"
//!   group_id: "kcbq-group"
//! topic: "bq_table_topic"
//! poll_interval_ms: 250
//! connector:
//!   project_id: "bq-project-id"
//!   dataset: "bq_dataset"
//!   table: "bq_table"
//!   id_column: "id"
//!   batch_size: 500
//! ```

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cursor::Watermark;
use crate::error::{ConnectorError, Result};
use crate::table::{TableDescription, TableRef};

fn default_batch_size() -> usize {
    500
}

fn default_max_poll_count() -> usize {
    500
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_sink_id_column() -> Option<String> {
    Some(default_id_column())
}

fn require(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ConnectorError::Config(format!("`{name}` must not be empty")));
    }
    Ok(())
}

/// Settings of the sink connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    pub project_id: String,
    pub dataset: String,
    pub table: String,
    /// Column whose value becomes each row's insert id. Set to `null` to
    /// send rows without insert ids.
    #[serde(default = "default_sink_id_column")]
    pub id_column: Option<String>,
    /// Rows per insert call; also the buffer size that triggers a drain.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Fallback schema used to create the table when records carry none.
    #[serde(default)]
    pub schema: Option<TableDescription>,
}

impl SinkConfig {
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(&self.project_id, &self.dataset, &self.table)
    }

    pub fn validate(&self) -> Result<()> {
        require(&self.project_id, "project_id")?;
        require(&self.dataset, "dataset")?;
        require(&self.table, "table")?;
        if let Some(column) = &self.id_column {
            require(column, "id_column")?;
        }
        if self.batch_size == 0 {
            return Err(ConnectorError::Config("`batch_size` must be at least 1".into()));
        }
        Ok(())
    }
}

/// How a source task walks the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollMode {
    /// Resumable full scan following page tokens.
    #[default]
    Page,
    /// Watermark query over an incrementing id and an updated-at column.
    Incremental,
}

/// Settings of the source connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub project_id: String,
    pub dataset: String,
    pub table: String,
    /// Column used as the record key.
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default = "default_max_poll_count")]
    pub max_poll_count: usize,
    #[serde(default)]
    pub mode: PollMode,
    #[serde(default)]
    pub incrementing_column_name: Option<String>,
    #[serde(default)]
    pub timestamp_column_name: Option<String>,
    /// Seed of the watermark timestamp; defaults to the Unix epoch.
    #[serde(default)]
    pub init_timestamp: Option<DateTime<Utc>>,
    /// Seed of the watermark id; defaults to `-1`.
    #[serde(default)]
    pub init_incrementing_value: Option<i64>,
}

impl SourceConfig {
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(&self.project_id, &self.dataset, &self.table)
    }

    pub fn initial_watermark(&self) -> Watermark {
        let default = Watermark::default();
        Watermark::new(
            self.init_incrementing_value
                .unwrap_or(default.last_incrementing_value),
            self.init_timestamp.unwrap_or(default.last_timestamp),
        )
    }

    /// `(incrementing, timestamp)` column names for incremental mode.
    pub fn watermark_columns(&self) -> Result<(&str, &str)> {
        match (
            self.incrementing_column_name.as_deref(),
            self.timestamp_column_name.as_deref(),
        ) {
            (Some(inc), Some(ts)) if !inc.trim().is_empty() && !ts.trim().is_empty() => {
                Ok((inc, ts))
            }
            _ => Err(ConnectorError::Config(
                "incremental mode needs `incrementing_column_name` and `timestamp_column_name`"
                    .into(),
            )),
        }
    }

    pub fn validate(&self) -> Result<()> {
        require(&self.project_id, "project_id")?;
        require(&self.dataset, "dataset")?;
        require(&self.table, "table")?;
        require(&self.id_column, "id_column")?;
        if self.max_poll_count == 0 {
            return Err(ConnectorError::Config(
                "`max_poll_count` must be at least 1".into(),
            ));
        }
        if self.mode == PollMode::Incremental {
            self.watermark_columns()?;
        }
        Ok(())
    }
}

/// Connection settings of the Kafka host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KafkaSpec {
    #[serde(default = "default_brokers")]
    pub brokers: String,
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// `earliest` or `latest`.
    #[serde(default = "default_offset_reset")]
    pub from_offset: String,
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_group_id() -> String {
    "kcbq-group".to_string()
}

fn default_client_id() -> String {
    "kcbq-client".to_string()
}

fn default_offset_reset() -> String {
    "earliest".to_string()
}

impl Default for KafkaSpec {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            group_id: default_group_id(),
            client_id: default_client_id(),
            from_offset: default_offset_reset(),
        }
    }
}

/// REST endpoint settings of the BigQuery backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BigQuerySpec {
    /// Overrides `https://bigquery.googleapis.com/bigquery/v2`.
    #[serde(default)]
    pub api_base: Option<String>,
    /// Pre-issued OAuth bearer token.
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_topic() -> String {
    "bq_table_topic".to_string()
}

fn default_one() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_stats_interval_ms() -> u64 {
    30_000
}

/// Complete runner configuration: Kafka side, BigQuery side, connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSpec<C> {
    #[serde(default)]
    pub kafka: KafkaSpec,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_one")]
    pub max_tasks: usize,
    /// Delay between source polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Interval of periodic stats reports.
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
    #[serde(default)]
    pub bigquery: BigQuerySpec,
    pub connector: C,
}

impl<C: DeserializeOwned> HostSpec<C> {
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(yaml).context("parse host configuration")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        Self::from_yaml_str(&yaml)
    }
}
