//! # KCBQ I/O - BigQuery Tasks, Backends and Kafka Hosts
//!
//! This crate provides the concrete pieces that move data between Kafka
//! topics and BigQuery tables on top of the contracts in `kcbq-core`.
//!
//! ## Features
//!
//! ### Tasks
//! - **Sink**: buffers records and drains them with `insertAll` in fixed-size
//!   batches, one insert in flight at a time
//! - **Source**: resumable page scan or watermark queries, turning rows into
//!   records stamped with the table description
//!
//! ### Backends
//! - **BigQuery REST**: datasets, tables, `insertAll`, `tabledata.list` and
//!   parameterised `jobs.query`
//! - **Memory**: in-process tables with fault injection for tests
//!
//! ### Hosts
//! - **Kafka**: consumer loop feeding a sink task, producer loop draining a
//!   source task
//!
//! ## Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use kcbq_core::{Notifier, SinkConfig, Task};
//! use kcbq_io::memory::MemoryBackend;
//! use kcbq_io::sink_bigquery::{BigQuerySinkTask, SinkTaskConfig};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let task = BigQuerySinkTask::new("sink", Arc::new(MemoryBackend::new()), Notifier::disabled());
//! task.start(SinkTaskConfig {
//!     max_tasks: 1,
//!     config: SinkConfig {
//!         project_id: "p".into(),
//!         dataset: "d".into(),
//!         table: "t".into(),
//!         id_column: None,
//!         batch_size: 500,
//!         schema: None,
//!     },
//! })
//! .await
//! .unwrap();
//! assert_eq!(task.buffered(), 0);
//! # }
//! ```

/// BigQuery REST backend
pub mod bigquery;

/// Sink and source connectors
pub mod connector;

/// Kafka consumer/producer hosts
pub mod kafka;

/// In-memory backend
pub mod memory;

/// Dataset and table provisioning
pub mod provisioner;

/// Buffered BigQuery sink task
pub mod sink_bigquery;

/// Paged / incremental BigQuery source task
pub mod source_bigquery;

pub use bigquery::BigQueryBackend;
pub use connector::{BigQuerySinkConnector, BigQuerySourceConnector};
pub use kafka::{KafkaSinkHost, KafkaSourceHost};
pub use memory::MemoryBackend;
pub use provisioner::{ProvisionOutcome, TableProvisioner};
pub use sink_bigquery::{BigQuerySinkTask, DrainState, SinkTaskConfig};
pub use source_bigquery::{BigQuerySourceTask, SourceTaskConfig};
