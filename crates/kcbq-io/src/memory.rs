//! In-process [`TableBackend`] used by tests and local dry runs.
//!
//! Page tokens are start offsets into the table's row list, so rows appended
//! after a poll show up on the next page. Failures can be injected per
//! operation with [`MemoryBackend::fail_next`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use kcbq_core::{
    BackendError, DatasetRef, IncrementalQuery, PageRequest, PageToken, Row, RowPage,
    TableBackend, TableDescription, TableRef, Watermark,
};
use serde_json::{Map, Value};

/// Backend operations, for call counting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    DatasetExists,
    CreateDataset,
    TableExists,
    CreateTable,
    GetTable,
    Insert,
    List,
    Query,
}

#[derive(Debug, Default)]
struct MemoryTable {
    description: TableDescription,
    rows: Vec<Map<String, Value>>,
}

#[derive(Debug, Default)]
struct State {
    datasets: HashSet<DatasetRef>,
    tables: HashMap<TableRef, MemoryTable>,
    faults: HashMap<Op, VecDeque<BackendError>>,
    calls: HashMap<Op, usize>,
    insert_log: Vec<Vec<Row>>,
    race_on_create: bool,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
    insert_delay: Option<Duration>,
    inserts_in_flight: AtomicUsize,
    max_inserts_in_flight: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(self, dataset: DatasetRef) -> Self {
        self.state().datasets.insert(dataset);
        self
    }

    /// Adds a table (and its dataset) holding `rows`.
    pub fn with_table(
        self,
        table: TableRef,
        description: TableDescription,
        rows: Vec<Map<String, Value>>,
    ) -> Self {
        {
            let mut state = self.state();
            state.datasets.insert(table.dataset());
            state.tables.insert(table, MemoryTable { description, rows });
        }
        self
    }

    /// Every insert sleeps this long before landing.
    pub fn with_insert_delay(mut self, delay: Duration) -> Self {
        self.insert_delay = Some(delay);
        self
    }

    /// The next call to `op` fails with `error`. Queued errors are consumed
    /// in order.
    pub fn fail_next(&self, op: Op, error: BackendError) {
        self.state().faults.entry(op).or_default().push_back(error);
    }

    /// Creates report the resource as missing beforehand, then answer with a
    /// conflict because another writer created it first.
    pub fn race_on_create(&self) {
        self.state().race_on_create = true;
    }

    /// Appends rows to an existing table.
    pub fn append_rows(&self, table: &TableRef, rows: Vec<Map<String, Value>>) {
        if let Some(t) = self.state().tables.get_mut(table) {
            t.rows.extend(rows);
        }
    }

    /// Replaces the first row whose `column` equals `value[column]`.
    pub fn update_row(&self, table: &TableRef, column: &str, value: Map<String, Value>) {
        if let Some(t) = self.state().tables.get_mut(table) {
            if let Some(row) = t.rows.iter_mut().find(|r| r.get(column) == value.get(column)) {
                *row = value;
            }
        }
    }

    pub fn has_table(&self, table: &TableRef) -> bool {
        self.state().tables.contains_key(table)
    }

    pub fn description(&self, table: &TableRef) -> Option<TableDescription> {
        self.state().tables.get(table).map(|t| t.description.clone())
    }

    pub fn rows(&self, table: &TableRef) -> Vec<Map<String, Value>> {
        self.state()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Row batches of every successful insert, in call order.
    pub fn insert_log(&self) -> Vec<Vec<Row>> {
        self.state().insert_log.clone()
    }

    pub fn calls(&self, op: Op) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn max_concurrent_inserts(&self) -> usize {
        self.max_inserts_in_flight.load(Ordering::SeqCst)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts the call and pops an injected fault, if any.
    fn enter(&self, op: Op) -> Result<MutexGuard<'_, State>, BackendError> {
        let mut state = self.state();
        *state.calls.entry(op).or_default() += 1;
        if let Some(err) = state.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(state)
    }

    fn insert_now(&self, table: &TableRef, rows: &[Row]) -> Result<(), BackendError> {
        let mut state = self.enter(Op::Insert)?;
        let Some(t) = state.tables.get_mut(table) else {
            return Err(BackendError::not_found(format!("Not found: Table {table}")));
        };
        t.rows.extend(rows.iter().map(|r| r.json.clone()));
        state.insert_log.push(rows.to_vec());
        Ok(())
    }
}

fn sort_key(query: &IncrementalQuery, row: &Map<String, Value>) -> Watermark {
    Watermark::observe(row, &query.incrementing_column, &query.timestamp_column)
        .map(|(inc, ts)| Watermark::new(inc, ts))
        .unwrap_or_default()
}

#[async_trait]
impl TableBackend for MemoryBackend {
    async fn dataset_exists(&self, dataset: &DatasetRef) -> Result<bool, BackendError> {
        let state = self.enter(Op::DatasetExists)?;
        Ok(state.datasets.contains(dataset))
    }

    async fn create_dataset(&self, dataset: &DatasetRef) -> Result<(), BackendError> {
        let mut state = self.enter(Op::CreateDataset)?;
        if !state.datasets.insert(dataset.clone()) || state.race_on_create {
            return Err(BackendError::already_exists(format!(
                "Already Exists: Dataset {dataset}"
            )));
        }
        Ok(())
    }

    async fn table_exists(&self, table: &TableRef) -> Result<bool, BackendError> {
        let state = self.enter(Op::TableExists)?;
        Ok(state.tables.contains_key(table))
    }

    async fn create_table(
        &self,
        table: &TableRef,
        description: &TableDescription,
    ) -> Result<TableDescription, BackendError> {
        let mut state = self.enter(Op::CreateTable)?;
        if !state.datasets.contains(&table.dataset()) {
            return Err(BackendError::not_found(format!(
                "Not found: Dataset {}",
                table.dataset()
            )));
        }
        let raced = state.race_on_create;
        if state.tables.contains_key(table) || raced {
            state.tables.entry(table.clone()).or_insert_with(|| MemoryTable {
                description: description.clone(),
                rows: Vec::new(),
            });
            return Err(BackendError::already_exists(format!(
                "Already Exists: Table {table}"
            )));
        }
        state.tables.insert(
            table.clone(),
            MemoryTable {
                description: description.clone(),
                rows: Vec::new(),
            },
        );
        Ok(description.clone())
    }

    async fn get_table(&self, table: &TableRef) -> Result<TableDescription, BackendError> {
        let state = self.enter(Op::GetTable)?;
        state
            .tables
            .get(table)
            .map(|t| t.description.clone())
            .ok_or_else(|| BackendError::not_found(format!("Not found: Table {table}")))
    }

    async fn insert_rows(&self, table: &TableRef, rows: &[Row]) -> Result<(), BackendError> {
        let in_flight = self.inserts_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inserts_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        if let Some(delay) = self.insert_delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.insert_now(table, rows);
        self.inserts_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn list_rows(
        &self,
        table: &TableRef,
        page: &PageRequest,
    ) -> Result<RowPage, BackendError> {
        let state = self.enter(Op::List)?;
        let t = state
            .tables
            .get(table)
            .ok_or_else(|| BackendError::not_found(format!("Not found: Table {table}")))?;

        let start = match &page.token {
            Some(token) => token.as_str().parse::<usize>().map_err(|_| {
                BackendError::new(Some(400), format!("invalid page token `{token}`"))
                    .with_reason("invalid")
            })?,
            None => 0,
        };
        let start = start.min(t.rows.len());
        let end = start.saturating_add(page.max_results).min(t.rows.len());

        Ok(RowPage {
            rows: t.rows[start..end].to_vec(),
            next_token: Some(PageToken::new(end.to_string())),
            total_rows: Some(t.rows.len() as u64),
        })
    }

    async fn query_incremental(
        &self,
        table: &TableRef,
        query: &IncrementalQuery,
    ) -> Result<Vec<Map<String, Value>>, BackendError> {
        let state = self.enter(Op::Query)?;
        let t = state
            .tables
            .get(table)
            .ok_or_else(|| BackendError::not_found(format!("Not found: Table {table}")))?;

        let mut rows: Vec<_> = t.rows.iter().filter(|r| query.matches(r)).cloned().collect();
        rows.sort_by_key(|r| sort_key(query, r));
        rows.truncate(query.limit);
        Ok(rows)
    }
}
