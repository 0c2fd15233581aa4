//! # KCBQ Core - Connector Core Library
//!
//! This crate provides the foundational types and traits shared by the KCBQ
//! sink and source connectors. It defines the record model that crosses the
//! stream boundary, the lifecycle contract the host drives, the cursor and
//! stats state kept per task, and the seam to the table-storage backend.
//!
//! ## Key Components
//!
//! - **Record Model**: [`Record`] (stream side), [`Row`] (insert side) and
//!   [`TableDescription`] (schema snapshot)
//! - **Lifecycle Traits**: [`Task`], [`SinkTask`], [`SourceTask`], [`Connector`]
//! - **Cursor State**: page tokens and [`Watermark`]s for incremental reads
//! - **Stats & Events**: per-task counters and outbound notifications
//! - **Backend Seam**: [`TableBackend`], implemented by the I/O crate
//! - **Error Handling**: [`ConnectorError`] and [`BackendError`]
//!
//! ## Example Usage
//!
//! ```rust
//! use kcbq_core::{Event, Notifier, Record};
//! use serde_json::json;
//!
//! let (notifier, mut events) = Notifier::channel();
//! let record = Record::new("42", Some(json!({"id": 42}))).with_topic("orders");
//! notifier.emit(Event::ModelUpsert(record.key.clone()));
//! assert_eq!(events.try_recv().unwrap().kind(), "model-upsert");
//! ```

pub mod backend;
pub mod config;
pub mod convert;
pub mod cursor;
pub mod error;
pub mod events;
pub mod record;
pub mod stats;
pub mod table;
pub mod task;

pub use backend::TableBackend;
pub use config::{BigQuerySpec, HostSpec, KafkaSpec, PollMode, SinkConfig, SourceConfig};
pub use convert::{Converter, RawMessage};
pub use cursor::{Cursor, IncrementalQuery, PageRequest, PageToken, RowPage, Watermark};
pub use error::{BackendError, ConnectorError, Result};
pub use events::{Event, EventRx, Notifier};
pub use record::{key_from_value, Record, Row};
pub use stats::{Stats, StatsSnapshot};
pub use table::{DatasetRef, FieldSchema, TableDescription, TableRef, TableSchema, TimePartitioning};
pub use task::{Connector, SinkTask, SourceTask, Task};
