//! BigQuery sink task: buffers accepted records and drains them into the
//! destination table in fixed-size insert batches.
//!
//! The buffer lives behind a plain mutex that is never held across an await.
//! A separate async drain guard makes sure at most one insert is in flight
//! per task, no matter how many `put` calls arrive while a drain runs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use async_trait::async_trait;
use kcbq_core::{
    ConnectorError, Event, Notifier, Record, Result, Row, SinkConfig, SinkTask, Stats,
    StatsSnapshot, TableBackend, TableDescription, Task,
};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::provisioner::{ProvisionOutcome, TableProvisioner};

/// Configuration handed to each sink task by the connector.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkTaskConfig {
    pub max_tasks: usize,
    pub config: SinkConfig,
}

/// Whether an insert is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    Idle,
    Draining,
}

pub struct BigQuerySinkTask<B: ?Sized> {
    name: String,
    backend: Arc<B>,
    notifier: Notifier,
    stats: Stats,
    config: OnceLock<SinkConfig>,
    provisioned: OnceCell<ProvisionOutcome>,
    buffer: Mutex<VecDeque<Row>>,
    drain_guard: tokio::sync::Mutex<()>,
    stopped: CancellationToken,
}

impl<B: TableBackend + ?Sized> BigQuerySinkTask<B> {
    pub fn new(name: impl Into<String>, backend: Arc<B>, notifier: Notifier) -> Self {
        Self {
            name: name.into(),
            backend,
            notifier,
            stats: Stats::new(),
            config: OnceLock::new(),
            provisioned: OnceCell::new(),
            buffer: Mutex::new(VecDeque::new()),
            drain_guard: tokio::sync::Mutex::new(()),
            stopped: CancellationToken::new(),
        }
    }

    pub fn drain_state(&self) -> DrainState {
        match self.drain_guard.try_lock() {
            Ok(_) => DrainState::Idle,
            Err(_) => DrainState::Draining,
        }
    }

    /// Rows accepted but not yet inserted.
    pub fn buffered(&self) -> usize {
        self.buffer().len()
    }

    fn buffer(&self) -> MutexGuard<'_, VecDeque<Row>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settings(&self) -> Result<&SinkConfig> {
        self.config
            .get()
            .ok_or_else(|| ConnectorError::NotStarted(self.name.clone()))
    }

    fn ensure_running(&self) -> Result<&SinkConfig> {
        let config = self.settings()?;
        if self.stopped.is_cancelled() {
            return Err(ConnectorError::Stopped(self.name.clone()));
        }
        Ok(config)
    }

    /// Provisions the destination once per task lifetime. Concurrent callers
    /// wait for the first one.
    async fn ensure_table(
        &self,
        config: &SinkConfig,
        schema: Option<&TableDescription>,
    ) -> Result<()> {
        self.provisioned
            .get_or_try_init(|| async {
                let table = config.table_ref();
                let schema = schema.or(config.schema.as_ref());
                let outcome = TableProvisioner::new(self.backend.clone())
                    .ensure(&table, schema)
                    .await?;
                if outcome.table_created {
                    self.stats.mark_table_created();
                    info!(task = %self.name, table = %table, "created destination table");
                }
                Ok::<_, ConnectorError>(outcome)
            })
            .await?;
        Ok(())
    }

    /// Converts a batch into insert rows. Deletes map to `None`.
    ///
    /// The whole batch is validated before anything is buffered, so a data
    /// error leaves the task untouched.
    fn prepare(&self, config: &SinkConfig, records: Vec<Record>) -> Result<Vec<(String, Option<Row>)>> {
        let key_column = config.id_column.as_deref().unwrap_or("key");
        records
            .into_iter()
            .map(|record| {
                record.validate_key(key_column)?;
                let is_delete = record.is_delete();
                let Record { key, value, .. } = record;
                match value {
                    Some(value) if !is_delete => {
                        let row = Row::from_value(&key, value, config.id_column.as_deref())?;
                        Ok((key, Some(row)))
                    }
                    _ => Ok((key, None)),
                }
            })
            .collect()
    }

    /// Drains when the buffer reached the batch size.
    async fn drain_if_full(&self, config: &SinkConfig) -> Result<()> {
        if self.buffered() < config.batch_size {
            return Ok(());
        }
        let _guard = self.drain_guard.lock().await;
        if self.stopped.is_cancelled() {
            return Err(ConnectorError::Stopped(self.name.clone()));
        }
        // The drain we waited for may already have emptied the buffer
        if self.buffered() < config.batch_size {
            return Ok(());
        }
        self.drain_locked(config).await
    }

    /// Inserts buffered rows in chunks of `batch_size` until the buffer is
    /// empty. The caller holds the drain guard.
    ///
    /// Rows are removed from the buffer when their chunk is taken; a failed
    /// insert drops that chunk and stops the drain, leaving later rows
    /// buffered for the next attempt.
    async fn drain_locked(&self, config: &SinkConfig) -> Result<()> {
        let table = config.table_ref();
        loop {
            let chunk: Vec<Row> = {
                let mut buffer = self.buffer();
                let n = config.batch_size.min(buffer.len());
                buffer.drain(..n).collect()
            };
            if chunk.is_empty() {
                return Ok(());
            }

            debug!(task = %self.name, table = %table, rows = chunk.len(), "inserting batch");
            match self.backend.insert_rows(&table, &chunk).await {
                Ok(()) => self.stats.record_batch(chunk.len()),
                Err(e) => {
                    self.stats.record_insert_error();
                    error!(task = %self.name, table = %table, rows = chunk.len(), "insert failed: {}", e);
                    return Err(if e.is_insert_rejected() {
                        ConnectorError::InsertRejected {
                            rows: chunk.len(),
                            body: e.body,
                        }
                    } else {
                        ConnectorError::backend("insertAll", e)
                    });
                }
            }
        }
    }
}

#[async_trait]
impl<B: TableBackend + ?Sized> Task for BigQuerySinkTask<B> {
    type Config = SinkTaskConfig;

    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, config: SinkTaskConfig) -> Result<()> {
        config.config.validate()?;
        let table = config.config.table_ref();
        let batch_size = config.config.batch_size;
        self.config
            .set(config.config)
            .map_err(|_| ConnectorError::Config(format!("task `{}` already started", self.name)))?;
        info!(
            task = %self.name,
            table = %table,
            batch_size,
            max_tasks = config.max_tasks,
            "sink task started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        // Waits for an in-flight insert; nothing is aborted midway
        let _guard = self.drain_guard.lock().await;
        if self.stopped.is_cancelled() {
            return Ok(());
        }
        self.stopped.cancel();
        let pending = self.buffered();
        if pending > 0 {
            warn!(task = %self.name, rows = pending, "sink task stopped with unflushed rows");
        } else {
            info!(task = %self.name, "sink task stopped");
        }
        Ok(())
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn report(&self) -> StatsSnapshot {
        let stats = self.stats.snapshot();
        info!(
            task = %self.name,
            batches = stats.batches_run,
            rows = stats.rows_inserted,
            errors = stats.insert_errors,
            "sink stats"
        );
        self.notifier.emit(Event::StatsReport {
            name: self.name.clone(),
            stats: stats.clone(),
        });
        stats
    }
}

#[async_trait]
impl<B: TableBackend + ?Sized> SinkTask for BigQuerySinkTask<B> {
    async fn put(&self, records: Vec<Record>) -> Result<()> {
        let config = self.ensure_running()?;
        if records.is_empty() {
            return Ok(());
        }

        // First batch carries the schema for table creation
        let schema = records.iter().find_map(|r| r.value_schema.clone());
        self.ensure_table(config, schema.as_ref()).await?;

        let prepared = self.prepare(config, records)?;
        let mut rows = Vec::with_capacity(prepared.len());
        for (key, row) in prepared {
            match row {
                Some(row) => {
                    self.stats.record_upsert();
                    self.notifier.emit(Event::ModelUpsert(key));
                    rows.push(row);
                }
                None => {
                    self.stats.record_delete();
                    self.notifier.emit(Event::ModelDelete(key));
                }
            }
        }

        let buffered = {
            let mut buffer = self.buffer();
            buffer.extend(rows);
            buffer.len()
        };
        debug!(task = %self.name, buffered, "records accepted");

        self.drain_if_full(config).await
    }

    async fn flush(&self) -> Result<()> {
        let config = self.ensure_running()?;
        if self.buffered() == 0 {
            return Ok(());
        }
        let _guard = self.drain_guard.lock().await;
        self.drain_locked(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBackend, Op};
    use kcbq_core::{BackendError, DatasetRef, FieldSchema, TableRef};
    use serde_json::json;
    use std::time::Duration;

    fn table() -> TableRef {
        TableRef::new("p", "d", "users")
    }

    fn schema() -> TableDescription {
        TableDescription::new(vec![
            FieldSchema::new("id", "INTEGER"),
            FieldSchema::new("name", "STRING"),
        ])
    }

    fn config(batch_size: usize) -> SinkTaskConfig {
        SinkTaskConfig {
            max_tasks: 1,
            config: SinkConfig {
                project_id: "p".into(),
                dataset: "d".into(),
                table: "users".into(),
                id_column: Some("id".into()),
                batch_size,
                schema: None,
            },
        }
    }

    fn record(id: i64) -> Record {
        Record::new(id.to_string(), Some(json!({"id": id, "name": format!("user-{id}")})))
            .with_schema(schema())
    }

    fn records(range: std::ops::RangeInclusive<i64>) -> Vec<Record> {
        range.map(record).collect()
    }

    async fn started(
        backend: MemoryBackend,
        batch_size: usize,
    ) -> (Arc<BigQuerySinkTask<MemoryBackend>>, Arc<MemoryBackend>, kcbq_core::EventRx) {
        let backend = Arc::new(backend);
        let (notifier, events) = Notifier::channel();
        let task = Arc::new(BigQuerySinkTask::new("sink-test", backend.clone(), notifier));
        task.start(config(batch_size)).await.unwrap();
        (task, backend, events)
    }

    #[tokio::test]
    async fn put_below_threshold_only_buffers() {
        let (task, backend, _events) = started(MemoryBackend::new(), 500).await;
        task.put(records(1..=3)).await.unwrap();

        assert_eq!(backend.calls(Op::Insert), 0);
        assert_eq!(task.buffered(), 3);
        assert_eq!(task.stats().upserts_observed, 3);
    }

    #[tokio::test]
    async fn first_put_creates_the_table_from_the_record_schema() {
        let (task, backend, _events) = started(MemoryBackend::new(), 500).await;
        task.put(records(1..=1)).await.unwrap();

        assert_eq!(backend.description(&table()), Some(schema()));
        assert!(task.stats().table_created);

        task.put(records(2..=2)).await.unwrap();
        assert_eq!(backend.calls(Op::CreateTable), 1);
    }

    #[tokio::test]
    async fn conflicting_table_creation_is_not_an_error() {
        let backend = MemoryBackend::new().with_dataset(DatasetRef::new("p", "d"));
        backend.race_on_create();
        let (task, _backend, _events) = started(backend, 500).await;

        task.put(records(1..=2)).await.unwrap();
        assert!(!task.stats().table_created);
        assert_eq!(task.buffered(), 2);
    }

    #[tokio::test]
    async fn deletes_are_observed_but_never_inserted() {
        let (task, backend, mut events) = started(MemoryBackend::new(), 500).await;
        let delete = Record::new("9", None).with_schema(schema());
        task.put(vec![delete]).await.unwrap();
        task.flush().await.unwrap();

        assert_eq!(events.try_recv().unwrap(), Event::ModelDelete("9".into()));
        assert_eq!(task.buffered(), 0);
        assert_eq!(backend.calls(Op::Insert), 0);
        assert_eq!(task.stats().deletes_observed, 1);
    }

    #[tokio::test]
    async fn reaching_the_batch_size_drains_in_chunks() {
        let (task, backend, _events) = started(MemoryBackend::new(), 2).await;
        task.put(records(1..=5)).await.unwrap();

        // Drain runs until the buffer is empty
        let log = backend.insert_log();
        assert_eq!(log.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 2, 1]);
        let ids: Vec<_> = log
            .iter()
            .flatten()
            .filter_map(|r| r.insert_id.clone())
            .collect();
        let expected: Vec<_> = (1..=5).map(|i| i.to_string()).collect();
        assert_eq!(ids, expected);
        assert_eq!(task.buffered(), 0);
        assert_eq!(task.stats().batches_run, 3);
        assert_eq!(task.stats().rows_inserted, 5);
    }

    #[tokio::test]
    async fn rows_keep_insert_ids_and_order() {
        let (task, backend, _events) = started(MemoryBackend::new(), 3).await;
        task.put(records(1..=3)).await.unwrap();

        let ids: Vec<_> = backend.insert_log()[0]
            .iter()
            .map(|r| r.insert_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn failed_chunk_stops_the_drain() {
        let (task, backend, _events) = started(MemoryBackend::new(), 500).await;
        backend.fail_next(Op::Insert, BackendError::new(Some(503), "backendError"));

        let err = task.put(records(1..=1000)).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Backend { op: "insertAll", .. }));
        assert!(!err.is_fatal());

        // Second chunk never attempted, still buffered
        assert_eq!(backend.calls(Op::Insert), 1);
        assert_eq!(task.buffered(), 500);
        assert_eq!(task.stats().insert_errors, 1);
        assert_eq!(task.stats().rows_inserted, 0);

        task.flush().await.unwrap();
        assert_eq!(task.stats().rows_inserted, 500);
    }

    #[tokio::test]
    async fn row_level_rejections_surface_as_insert_rejected() {
        let (task, backend, _events) = started(MemoryBackend::new(), 2).await;
        backend.fail_next(
            Op::Insert,
            BackendError::insert_rejected(r#"[{"index":0,"errors":[{"reason":"invalid"}]}]"#),
        );

        let err = task.put(records(1..=2)).await.unwrap_err();
        assert!(matches!(err, ConnectorError::InsertRejected { rows: 2, .. }));
    }

    #[tokio::test]
    async fn concurrent_puts_never_overlap_inserts() {
        let backend = MemoryBackend::new().with_insert_delay(Duration::from_millis(20));
        let (task, backend, _events) = started(backend, 10).await;

        let mut handles = Vec::new();
        for n in 0..8 {
            let task = task.clone();
            handles.push(tokio::spawn(async move {
                let start = n * 10 + 1;
                task.put(records(start..=start + 9)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        task.flush().await.unwrap();

        assert_eq!(backend.max_concurrent_inserts(), 1);
        assert_eq!(backend.rows(&table()).len(), 80);
        let mut ids: Vec<_> = backend
            .insert_log()
            .into_iter()
            .flatten()
            .filter_map(|r| r.insert_id)
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 80);
        assert_eq!(task.stats().rows_inserted, 80);
        assert_eq!(task.drain_state(), DrainState::Idle);
    }

    #[tokio::test]
    async fn inserted_rows_match_non_delete_records() {
        let (task, backend, _events) = started(MemoryBackend::new(), 4).await;
        let mut batch = records(1..=6);
        batch.push(Record::new("7", Some(serde_json::Value::Null)));
        batch.push(Record::new("8", None));
        task.put(batch).await.unwrap();
        task.flush().await.unwrap();

        let stats = task.stats();
        assert_eq!(stats.rows_inserted, 6);
        assert_eq!(stats.upserts_observed, 6);
        assert_eq!(stats.deletes_observed, 2);
        assert_eq!(backend.rows(&table()).len(), 6);
    }

    #[tokio::test]
    async fn missing_key_rejects_the_whole_batch() {
        let (task, _backend, _events) = started(MemoryBackend::new(), 500).await;
        let mut batch = records(1..=2);
        batch.push(Record::new("", Some(json!({"id": 3}))));

        let err = task.put(batch).await.unwrap_err();
        assert!(matches!(err, ConnectorError::MissingKey { .. }));
        assert!(err.is_fatal());
        assert_eq!(task.buffered(), 0);
    }

    #[tokio::test]
    async fn missing_id_column_is_a_data_error() {
        let (task, _backend, _events) = started(MemoryBackend::new(), 500).await;
        let record = Record::new("5", Some(json!({"name": "no-id"}))).with_schema(schema());

        let err = task.put(vec![record]).await.unwrap_err();
        assert!(matches!(err, ConnectorError::MissingInsertId { .. }));
    }

    #[tokio::test]
    async fn put_before_start_and_after_stop_fails() {
        let task = BigQuerySinkTask::new("sink", Arc::new(MemoryBackend::new()), Notifier::disabled());
        assert!(matches!(
            task.put(records(1..=1)).await,
            Err(ConnectorError::NotStarted(_))
        ));

        task.start(config(500)).await.unwrap();
        task.put(records(1..=1)).await.unwrap();
        task.flush().await.unwrap();
        task.stop().await.unwrap();
        task.stop().await.unwrap();
        assert!(matches!(
            task.put(records(2..=2)).await,
            Err(ConnectorError::Stopped(_))
        ));
    }

    #[tokio::test]
    async fn report_emits_a_stats_event() {
        let (task, _backend, mut events) = started(MemoryBackend::new(), 1).await;
        task.put(records(1..=1)).await.unwrap();
        while events.try_recv().is_ok() {}

        let snapshot = task.report();
        match events.try_recv().unwrap() {
            Event::StatsReport { name, stats } => {
                assert_eq!(name, "sink-test");
                assert_eq!(stats, snapshot);
                assert_eq!(stats.rows_inserted, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
