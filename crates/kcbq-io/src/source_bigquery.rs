//! BigQuery source task: reads rows page by page (or by watermark) and turns
//! them into records.
//!
//! The cursor only moves once a whole fetched batch converted cleanly. Fetch
//! failures and data errors leave it where it was, so the next poll retries
//! the same position.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kcbq_core::{
    key_from_value, ConnectorError, Cursor, Event, IncrementalQuery, Notifier, PageRequest,
    PollMode, Record, Result, SourceConfig, SourceTask, Stats, StatsSnapshot, TableBackend,
    TableDescription, Task, Watermark,
};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::provisioner::TableProvisioner;

/// Configuration handed to each source task by the connector.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceTaskConfig {
    pub max_tasks: usize,
    pub config: SourceConfig,
    /// Captured by the connector at start; fetched again when absent.
    pub table_description: Option<TableDescription>,
}

struct SourceState {
    config: SourceConfig,
    description: TableDescription,
    cursor: Cursor,
}

pub struct BigQuerySourceTask<B: ?Sized> {
    name: String,
    backend: Arc<B>,
    notifier: Notifier,
    stats: Stats,
    state: Mutex<Option<SourceState>>,
    stopped: CancellationToken,
}

impl<B: TableBackend + ?Sized> BigQuerySourceTask<B> {
    pub fn new(name: impl Into<String>, backend: Arc<B>, notifier: Notifier) -> Self {
        Self {
            name: name.into(),
            backend,
            notifier,
            stats: Stats::new(),
            state: Mutex::new(None),
            stopped: CancellationToken::new(),
        }
    }

    /// Current cursor, `None` before start.
    pub async fn cursor(&self) -> Option<Cursor> {
        self.state.lock().await.as_ref().map(|s| s.cursor.clone())
    }

    fn to_record(
        &self,
        state: &SourceState,
        row: Map<String, Value>,
        polled_at: DateTime<Utc>,
    ) -> Result<Record> {
        let column = &state.config.id_column;
        let key = row
            .get(column)
            .and_then(key_from_value)
            .ok_or_else(|| ConnectorError::MissingKey {
                column: column.clone(),
            })?;
        Ok(Record {
            key,
            key_schema: None,
            value: Some(Value::Object(row)),
            value_schema: Some(state.description.clone()),
            timestamp: polled_at,
            partition: -1,
            topic: state.config.table.clone(),
        })
    }

    async fn poll_page(&self, state: &mut SourceState, polled_at: DateTime<Utc>) -> Result<Vec<Record>> {
        let table = state.config.table_ref();
        let token = state.cursor.page_token().cloned();
        let request = PageRequest {
            token: token.clone(),
            max_results: state.config.max_poll_count,
        };

        let page = match self.backend.list_rows(&table, &request).await {
            Ok(page) => page,
            Err(e) => {
                self.stats.record_query_error();
                warn!(task = %self.name, table = %table, "page fetch failed: {}", e);
                return Err(ConnectorError::backend("tabledata.list", e));
            }
        };

        let records = page
            .rows
            .into_iter()
            .map(|row| self.to_record(state, row, polled_at))
            .collect::<Result<Vec<_>>>()?;

        // No successor token: stay on the current page
        let next = page.next_token.or(token);
        debug!(
            task = %self.name,
            rows = records.len(),
            total = ?page.total_rows,
            token = ?next,
            "page fetched"
        );
        self.stats.set_page_token(next.clone());
        state.cursor = Cursor::Page { token: next };
        Ok(records)
    }

    async fn poll_incremental(
        &self,
        state: &mut SourceState,
        mut watermark: Watermark,
        polled_at: DateTime<Utc>,
    ) -> Result<Vec<Record>> {
        let table = state.config.table_ref();
        let (inc_column, ts_column) = state.config.watermark_columns()?;
        let query = IncrementalQuery {
            incrementing_column: inc_column.to_string(),
            timestamp_column: ts_column.to_string(),
            watermark,
            limit: state.config.max_poll_count,
        };

        let rows = match self.backend.query_incremental(&table, &query).await {
            Ok(rows) => rows,
            Err(e) => {
                self.stats.record_query_error();
                warn!(task = %self.name, table = %table, "incremental query failed: {}", e);
                return Err(ConnectorError::backend("jobs.query", e));
            }
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let (inc, ts) = Watermark::observe(&row, &query.incrementing_column, &query.timestamp_column)
                .map_err(|reason| ConnectorError::InvalidRow {
                    key: row
                        .get(&state.config.id_column)
                        .and_then(key_from_value)
                        .unwrap_or_default(),
                    reason,
                })?;
            records.push(self.to_record(state, row, polled_at)?);
            watermark.advance(inc, ts);
        }

        debug!(
            task = %self.name,
            rows = records.len(),
            last_incrementing_value = watermark.last_incrementing_value,
            last_timestamp = %watermark.last_timestamp,
            "incremental batch fetched"
        );
        self.stats.set_watermark(watermark);
        state.cursor = Cursor::Watermark(watermark);
        Ok(records)
    }
}

#[async_trait]
impl<B: TableBackend + ?Sized> Task for BigQuerySourceTask<B> {
    type Config = SourceTaskConfig;

    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, config: SourceTaskConfig) -> Result<()> {
        let SourceTaskConfig {
            max_tasks,
            config,
            table_description,
        } = config;
        config.validate()?;

        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(ConnectorError::Config(format!(
                "task `{}` already started",
                self.name
            )));
        }

        let description = match table_description {
            Some(description) => description,
            None => {
                TableProvisioner::new(self.backend.clone())
                    .ensure_existing(&config.table_ref())
                    .await?
                    .description
            }
        };

        let cursor = match config.mode {
            PollMode::Page => Cursor::Page { token: None },
            PollMode::Incremental => {
                let (inc_column, ts_column) = config.watermark_columns()?;
                if let Some(missing) = [inc_column, ts_column]
                    .into_iter()
                    .find(|c| description.field(c).is_none())
                {
                    return Err(ConnectorError::Config(format!(
                        "watermark column `{missing}` is not in table `{}`",
                        config.table_ref()
                    )));
                }
                let watermark = config.initial_watermark();
                self.stats.set_watermark(watermark);
                Cursor::Watermark(watermark)
            }
        };

        info!(
            task = %self.name,
            table = %config.table_ref(),
            mode = ?config.mode,
            max_poll_count = config.max_poll_count,
            max_tasks,
            "source task started"
        );
        *state = Some(SourceState {
            config,
            description,
            cursor,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        // Waits for an in-flight poll
        let state = self.state.lock().await;
        if !self.stopped.is_cancelled() {
            self.stopped.cancel();
            info!(task = %self.name, cursor = ?state.as_ref().map(|s| &s.cursor), "source task stopped");
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
            pages = stats.pages_queried,
            rows = stats.rows_queried,
            errors = stats.query_errors,
            "source stats"
        );
        self.notifier.emit(Event::StatsReport {
            name: self.name.clone(),
            stats: stats.clone(),
        });
        stats
    }
}

#[async_trait]
impl<B: TableBackend + ?Sized> SourceTask for BigQuerySourceTask<B> {
    async fn poll(&self) -> Result<Vec<Record>> {
        if self.stopped.is_cancelled() {
            return Err(ConnectorError::Stopped(self.name.clone()));
        }
        let mut guard = self.state.lock().await;
        let state = guard
            .as_mut()
            .ok_or_else(|| ConnectorError::NotStarted(self.name.clone()))?;

        let polled_at = Utc::now();
        let records = match state.cursor.clone() {
            Cursor::Page { .. } => self.poll_page(state, polled_at).await?,
            Cursor::Watermark(watermark) => self.poll_incremental(state, watermark, polled_at).await?,
        };

        self.stats.record_page(records.len());
        for record in &records {
            self.notifier.emit(Event::RecordObserved(record.key.clone()));
        }
        if records.is_empty() {
            debug!(task = %self.name, "caught up, no new rows");
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBackend, Op};
    use kcbq_core::{BackendError, FieldSchema, PageToken, TableRef};
    use serde_json::json;

    fn table() -> TableRef {
        TableRef::new("p", "d", "orders")
    }

    fn schema() -> TableDescription {
        TableDescription::new(vec![
            FieldSchema::new("id", "INTEGER"),
            FieldSchema::new("updated_at", "TIMESTAMP"),
        ])
    }

    fn row(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn rows(ids: std::ops::RangeInclusive<i64>) -> Vec<Map<String, Value>> {
        ids.map(|id| row(json!({"id": id, "updated_at": "2024-01-01T00:00:00Z"})))
            .collect()
    }

    fn page_config(max_poll_count: usize) -> SourceConfig {
        SourceConfig {
            project_id: "p".into(),
            dataset: "d".into(),
            table: "orders".into(),
            id_column: "id".into(),
            max_poll_count,
            mode: PollMode::Page,
            incrementing_column_name: None,
            timestamp_column_name: None,
            init_timestamp: None,
            init_incrementing_value: None,
        }
    }

    fn incremental_config(max_poll_count: usize) -> SourceConfig {
        SourceConfig {
            mode: PollMode::Incremental,
            incrementing_column_name: Some("id".into()),
            timestamp_column_name: Some("updated_at".into()),
            ..page_config(max_poll_count)
        }
    }

    async fn started(
        backend: MemoryBackend,
        config: SourceConfig,
    ) -> (BigQuerySourceTask<MemoryBackend>, Arc<MemoryBackend>, kcbq_core::EventRx) {
        let backend = Arc::new(backend);
        let (notifier, events) = Notifier::channel();
        let task = BigQuerySourceTask::new("source-test", backend.clone(), notifier);
        task.start(SourceTaskConfig {
            max_tasks: 1,
            config,
            table_description: None,
        })
        .await
        .unwrap();
        (task, backend, events)
    }

    fn keys(records: &[Record]) -> Vec<&str> {
        records.iter().map(|r| r.key.as_str()).collect()
    }

    #[tokio::test]
    async fn pages_through_the_table_then_catches_up() {
        let backend = MemoryBackend::new().with_table(table(), schema(), rows(1..=3));
        let (task, _backend, _events) = started(backend, page_config(2)).await;

        assert_eq!(keys(&task.poll().await.unwrap()), vec!["1", "2"]);
        assert_eq!(keys(&task.poll().await.unwrap()), vec!["3"]);
        assert!(task.poll().await.unwrap().is_empty());
        assert!(task.poll().await.unwrap().is_empty());

        let stats = task.stats();
        assert_eq!(stats.rows_queried, 3);
        assert_eq!(stats.page_token, Some(PageToken::new("3")));
    }

    #[tokio::test]
    async fn every_row_is_emitted_once_in_ceil_r_over_p_polls() {
        let backend = MemoryBackend::new().with_table(table(), schema(), rows(1..=7));
        let (task, _backend, _events) = started(backend, page_config(3)).await;

        let mut seen = Vec::new();
        let mut polls = 0;
        loop {
            let batch = task.poll().await.unwrap();
            if batch.is_empty() {
                break;
            }
            polls += 1;
            seen.extend(batch.into_iter().map(|r| r.key));
        }
        assert_eq!(polls, 3);
        assert_eq!(seen, (1..=7).map(|i| i.to_string()).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn rows_appended_later_are_picked_up() {
        let backend = MemoryBackend::new().with_table(table(), schema(), rows(1..=2));
        let (task, backend, _events) = started(backend, page_config(5)).await;

        assert_eq!(task.poll().await.unwrap().len(), 2);
        assert!(task.poll().await.unwrap().is_empty());
        backend.append_rows(&table(), rows(3..=4));
        assert_eq!(keys(&task.poll().await.unwrap()), vec!["3", "4"]);
    }

    #[tokio::test]
    async fn records_carry_schema_topic_and_observed_events() {
        let backend = MemoryBackend::new().with_table(table(), schema(), rows(1..=1));
        let (task, _backend, mut events) = started(backend, page_config(5)).await;

        let records = task.poll().await.unwrap();
        let record = &records[0];
        assert_eq!(record.topic, "orders");
        assert_eq!(record.partition, -1);
        assert_eq!(record.value_schema, Some(schema()));
        assert_eq!(record.value.as_ref().unwrap()["id"], json!(1));
        assert_eq!(events.try_recv().unwrap(), Event::RecordObserved("1".into()));
    }

    #[tokio::test]
    async fn fetch_error_leaves_the_cursor_unchanged() {
        let backend = MemoryBackend::new().with_table(table(), schema(), rows(1..=4));
        let (task, backend, _events) = started(backend, page_config(2)).await;

        task.poll().await.unwrap();
        let before = task.cursor().await;
        backend.fail_next(Op::List, BackendError::new(Some(503), "backendError"));

        let err = task.poll().await.unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(task.cursor().await, before);
        assert_eq!(task.stats().query_errors, 1);

        assert_eq!(keys(&task.poll().await.unwrap()), vec!["3", "4"]);
    }

    #[tokio::test]
    async fn missing_key_is_fatal_and_keeps_the_cursor() {
        let mut data = rows(1..=1);
        data.push(row(json!({"updated_at": "2024-01-01T00:00:00Z"})));
        let backend = MemoryBackend::new().with_table(table(), schema(), data);
        let (task, _backend, mut events) = started(backend, page_config(5)).await;

        let err = task.poll().await.unwrap_err();
        assert!(matches!(err, ConnectorError::MissingKey { .. }));
        assert!(err.is_fatal());
        assert_eq!(task.cursor().await, Some(Cursor::Page { token: None }));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn start_fails_when_the_table_is_missing() {
        let task = BigQuerySourceTask::new("source", Arc::new(MemoryBackend::new()), Notifier::disabled());
        let err = task
            .start(SourceTaskConfig {
                max_tasks: 1,
                config: page_config(5),
                table_description: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::DatasetNotFound { .. }));
    }

    #[tokio::test]
    async fn poll_requires_start_and_fails_after_stop() {
        let backend = Arc::new(MemoryBackend::new().with_table(table(), schema(), rows(1..=1)));
        let task = BigQuerySourceTask::new("source", backend, Notifier::disabled());
        assert!(matches!(task.poll().await, Err(ConnectorError::NotStarted(_))));

        task.start(SourceTaskConfig {
            max_tasks: 1,
            config: page_config(5),
            table_description: Some(schema()),
        })
        .await
        .unwrap();
        task.stop().await.unwrap();
        assert!(matches!(task.poll().await, Err(ConnectorError::Stopped(_))));
    }

    #[tokio::test]
    async fn incremental_mode_follows_the_watermark() {
        let data = vec![
            row(json!({"id": 1, "updated_at": "2024-01-01T00:00:00Z"})),
            row(json!({"id": 2, "updated_at": "2024-01-02T00:00:00Z"})),
            row(json!({"id": 3, "updated_at": "2024-01-03T00:00:00Z"})),
        ];
        let backend = MemoryBackend::new().with_table(table(), schema(), data);
        let (task, backend, _events) = started(backend, incremental_config(2)).await;

        assert_eq!(keys(&task.poll().await.unwrap()), vec!["1", "2"]);
        let first = task.stats().watermark.unwrap();
        assert_eq!(first.last_incrementing_value, 2);

        assert_eq!(keys(&task.poll().await.unwrap()), vec!["3"]);
        assert!(task.poll().await.unwrap().is_empty());

        // An update bumps the timestamp and is read again
        backend.update_row(
            &table(),
            "id",
            row(json!({"id": 1, "updated_at": "2024-02-01T00:00:00Z"})),
        );
        assert_eq!(keys(&task.poll().await.unwrap()), vec!["1"]);

        let last = task.stats().watermark.unwrap();
        assert!(last > first);
        assert_eq!(last.last_incrementing_value, 1);
        assert_eq!(backend.calls(Op::Query), 4);
    }

    #[tokio::test]
    async fn rows_sharing_a_timestamp_are_all_delivered() {
        let data = vec![
            row(json!({"id": 10, "updated_at": "2024-01-01T00:00:00Z"})),
            row(json!({"id": 5, "updated_at": "2024-01-02T00:00:00Z"})),
            row(json!({"id": 7, "updated_at": "2024-01-02T00:00:00Z"})),
        ];
        let backend = MemoryBackend::new().with_table(table(), schema(), data);
        let (task, _backend, _events) = started(backend, incremental_config(1)).await;

        let mut seen = Vec::new();
        let mut previous = Watermark::default();
        for _ in 0..6 {
            seen.extend(task.poll().await.unwrap().into_iter().map(|r| r.key));
            let current = task.stats().watermark.unwrap();
            assert!(current >= previous);
            previous = current;
        }
        assert_eq!(seen, vec!["10", "5", "7"]);
        assert_eq!(
            previous,
            Watermark::new(7, "2024-01-02T00:00:00Z".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn incremental_query_error_keeps_the_watermark() {
        let backend = MemoryBackend::new().with_table(table(), schema(), rows(1..=2));
        let (task, backend, _events) = started(backend, incremental_config(10)).await;
        backend.fail_next(Op::Query, BackendError::new(Some(500), "internalError"));

        assert!(task.poll().await.is_err());
        assert_eq!(
            task.cursor().await,
            Some(Cursor::Watermark(Watermark::default()))
        );
        assert_eq!(task.poll().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn start_rejects_watermark_columns_missing_from_the_table() {
        let backend = Arc::new(MemoryBackend::new().with_table(table(), schema(), rows(1..=1)));
        let task = BigQuerySourceTask::new("source", backend, Notifier::disabled());
        let mut config = incremental_config(10);
        config.timestamp_column_name = Some("modified".into());

        let err = task
            .start(SourceTaskConfig {
                max_tasks: 1,
                config,
                table_description: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Config(ref m) if m.contains("modified")));
        assert!(matches!(task.poll().await, Err(ConnectorError::NotStarted(_))));
    }

    #[tokio::test]
    async fn row_without_watermark_columns_is_invalid() {
        let data = vec![row(json!({"id": 1, "updated_at": "2024-01-01T00:00:00Z"}))];
        let mut description = schema();
        description.schema.fields.push(FieldSchema::new("seq", "INTEGER"));
        let backend = MemoryBackend::new().with_table(table(), description, data);
        let mut config = incremental_config(10);
        config.incrementing_column_name = Some("seq".into());
        let (task, _backend, _events) = started(backend, config).await;

        let err = task.poll().await.unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidRow { .. }));
    }
}
