//! Lifecycle contract between the host and connector tasks.
//!
//! The host owns scheduling: it calls [`Task::start`] once, then drives
//! [`SinkTask::put`] or [`SourceTask::poll`] on its own cadence, and finally
//! [`Task::stop`]. Tasks never spawn their own loops.

use async_trait::async_trait;

use crate::error::Result;
use crate::record::Record;
use crate::stats::StatsSnapshot;

/// Behaviour shared by sink and source tasks.
#[async_trait]
pub trait Task: Send + Sync {
    /// Per-task configuration produced by [`Connector::task_configs`].
    type Config: Send + Sync;

    /// Returns the name used in logs and stats reports.
    fn name(&self) -> &str;

    /// Prepares the task. Source tasks capture the table description and
    /// initialise their cursor here.
    async fn start(&self, config: Self::Config) -> Result<()>;

    /// Waits for in-flight work, then refuses further calls. Idempotent.
    async fn stop(&self) -> Result<()>;

    /// Current counters. Never blocks the hot path.
    fn stats(&self) -> StatsSnapshot;

    /// Emits a stats report notification and returns the counters.
    fn report(&self) -> StatsSnapshot;
}

/// Task writing stream records into a table.
#[async_trait]
pub trait SinkTask: Task {
    /// Accepts a batch of records, draining the buffer when it reaches the
    /// batch size.
    async fn put(&self, records: Vec<Record>) -> Result<()>;

    /// Drains whatever is buffered, regardless of the batch size.
    async fn flush(&self) -> Result<()>;
}

/// Task reading table rows as stream records.
#[async_trait]
pub trait SourceTask: Task {
    /// Returns zero or more records. Never blocks indefinitely.
    async fn poll(&self) -> Result<Vec<Record>>;
}

/// Connector level fan-out.
#[async_trait]
pub trait Connector: Send + Sync {
    type Properties: Send;
    type TaskConfig: Clone + Send;

    async fn start(&mut self, properties: Self::Properties) -> Result<()>;

    /// One config per task. The table is not sharded, so this yields a
    /// single config whatever `max_tasks` is.
    fn task_configs(&self, max_tasks: usize) -> Result<Vec<Self::TaskConfig>>;

    async fn stop(&mut self) -> Result<()>;
}
