//! Per-task counters, updated on the hot path and read on demand.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::cursor::{PageToken, Watermark};

/// In-memory counters for one task. Never persisted; a restart starts from
/// zero.
#[derive(Debug, Default)]
pub struct Stats {
    batches_run: AtomicU64,
    rows_inserted: AtomicU64,
    insert_errors: AtomicU64,
    upserts_observed: AtomicU64,
    deletes_observed: AtomicU64,
    pages_queried: AtomicU64,
    rows_queried: AtomicU64,
    query_errors: AtomicU64,
    table_created: AtomicBool,
    position: Mutex<Position>,
}

#[derive(Debug, Default, Clone)]
struct Position {
    page_token: Option<PageToken>,
    watermark: Option<Watermark>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch(&self, rows: usize) {
        self.batches_run.fetch_add(1, Ordering::Relaxed);
        self.rows_inserted.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn record_insert_error(&self) {
        self.insert_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upsert(&self) {
        self.upserts_observed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes_observed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_page(&self, rows: usize) {
        self.pages_queried.fetch_add(1, Ordering::Relaxed);
        self.rows_queried.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn record_query_error(&self) {
        self.query_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_table_created(&self) {
        self.table_created.store(true, Ordering::Relaxed);
    }

    pub fn set_page_token(&self, token: Option<PageToken>) {
        if let Ok(mut position) = self.position.lock() {
            position.page_token = token;
        }
    }

    pub fn set_watermark(&self, watermark: Watermark) {
        if let Ok(mut position) = self.position.lock() {
            position.watermark = Some(watermark);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let position = self
            .position
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default();
        StatsSnapshot {
            batches_run: self.batches_run.load(Ordering::Relaxed),
            rows_inserted: self.rows_inserted.load(Ordering::Relaxed),
            insert_errors: self.insert_errors.load(Ordering::Relaxed),
            upserts_observed: self.upserts_observed.load(Ordering::Relaxed),
            deletes_observed: self.deletes_observed.load(Ordering::Relaxed),
            pages_queried: self.pages_queried.load(Ordering::Relaxed),
            rows_queried: self.rows_queried.load(Ordering::Relaxed),
            query_errors: self.query_errors.load(Ordering::Relaxed),
            table_created: self.table_created.load(Ordering::Relaxed),
            page_token: position.page_token,
            watermark: position.watermark,
        }
    }
}

/// Point-in-time copy of [`Stats`], as sent in a stats report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub batches_run: u64,
    pub rows_inserted: u64,
    pub insert_errors: u64,
    pub upserts_observed: u64,
    pub deletes_observed: u64,
    pub pages_queried: u64,
    pub rows_queried: u64,
    pub query_errors: u64,
    pub table_created: bool,
    pub page_token: Option<PageToken>,
    pub watermark: Option<Watermark>,
}
