//! Record converters: the hook between raw stream messages and records.
//!
//! [`JsonConverter`] is the default and expects payloads that are serialized
//! [`Record`]s, which is what a source task produces. [`SchemaConverter`]
//! wraps a caller supplied ETL function and pairs its output with a fixed
//! table description.

use anyhow::{Context, Result};
use chrono::Utc;
use kcbq_core::{Converter, RawMessage, Record, TableDescription};
use serde_json::Value;
use tracing::debug;

/// Reads and writes whole records as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConverter;

impl Converter for JsonConverter {
    fn to_record(&self, message: RawMessage) -> Result<Record> {
        // Empty payload: tombstone for the message key
        if message.payload.is_null() {
            return Ok(Record::new(message.key.unwrap_or_default(), None)
                .with_topic(message.topic)
                .with_partition(message.partition));
        }

        let mut record: Record = serde_json::from_value(message.payload)
            .context("payload is not a serialized record")?;
        if record.key.is_empty() {
            record.key = message.key.unwrap_or_default();
        }
        if record.topic.is_empty() {
            record.topic = message.topic;
        }
        if record.partition < 0 {
            record.partition = message.partition;
        }
        Ok(record)
    }

    fn from_record(&self, record: &Record) -> Result<Vec<u8>> {
        serde_json::to_vec(record).context("serialize record")
    }
}

/// Identity ETL function.
pub fn passthrough(value: Value) -> Result<Value> {
    Ok(value)
}

/// Applies an ETL function to every message value and stamps the result
/// with the table description it must match.
///
/// A `null` output marks the record as a delete.
#[derive(Debug, Clone)]
pub struct SchemaConverter<F> {
    schema: TableDescription,
    etl: F,
}

impl<F> SchemaConverter<F>
where
    F: Fn(Value) -> Result<Value> + Send + Sync,
{
    pub fn schema(&self) -> &TableDescription {
        &self.schema
    }
}

impl<F> Converter for SchemaConverter<F>
where
    F: Fn(Value) -> Result<Value> + Send + Sync,
{
    fn to_record(&self, message: RawMessage) -> Result<Record> {
        let key = message.key.unwrap_or_default();
        let value = (self.etl)(message.payload)
            .with_context(|| format!("etl function failed for key `{key}`"))?;
        debug!(key = %key, delete = value.is_null(), "converted message");

        Ok(Record {
            key,
            key_schema: None,
            value: (!value.is_null()).then_some(value),
            value_schema: Some(self.schema.clone()),
            timestamp: Utc::now(),
            partition: message.partition,
            topic: message.topic,
        })
    }

    fn from_record(&self, record: &Record) -> Result<Vec<u8>> {
        serde_json::to_vec(record).context("serialize record")
    }
}

/// Builds converters for the sink side.
pub struct ConverterFactory;

impl ConverterFactory {
    /// Converter running `etl` on each message value. `schema` is the table
    /// description of the destination; it is used to create the table on the
    /// first write when it does not exist yet.
    pub fn create_sink_schema_converter<F>(
        schema: TableDescription,
        etl: F,
    ) -> Result<SchemaConverter<F>>
    where
        F: Fn(Value) -> Result<Value> + Send + Sync,
    {
        if schema.is_empty() {
            anyhow::bail!("table schema must define at least one field");
        }
        Ok(SchemaConverter { schema, etl })
    }

    /// Schema converter that keeps message values unchanged.
    pub fn passthrough(
        schema: TableDescription,
    ) -> Result<SchemaConverter<fn(Value) -> Result<Value>>> {
        Self::create_sink_schema_converter(schema, passthrough as fn(Value) -> Result<Value>)
    }
}
