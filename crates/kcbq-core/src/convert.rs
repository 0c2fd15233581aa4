//! Conversion between raw stream messages and [`Record`]s.

use serde_json::Value;

use crate::record::Record;

/// A message as consumed from the stream, before conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub key: Option<String>,
    /// Parsed payload; `Value::Null` for an empty payload (tombstone).
    pub payload: Value,
    pub partition: i32,
    pub topic: String,
}

/// Turns stream messages into records and back.
///
/// Used through generics by the hosts, so implementations are statically
/// dispatched.
pub trait Converter: Send + Sync {
    /// Stream → record, invoked once per consumed message before it reaches
    /// the sink buffer.
    fn to_record(&self, message: RawMessage) -> anyhow::Result<Record>;

    /// Record → stream payload.
    fn from_record(&self, record: &Record) -> anyhow::Result<Vec<u8>>;
}
