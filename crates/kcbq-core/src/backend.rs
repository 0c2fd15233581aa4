//! Table-storage client seam.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::cursor::{IncrementalQuery, PageRequest, RowPage};
use crate::error::BackendError;
use crate::record::Row;
use crate::table::{DatasetRef, TableDescription, TableRef};

/// Operations the connector needs from the table store.
///
/// Every method is a suspension point; nothing else in a task awaits.
#[async_trait]
pub trait TableBackend: Send + Sync {
    async fn dataset_exists(&self, dataset: &DatasetRef) -> Result<bool, BackendError>;

    /// Fails with a 409 [`BackendError`] when the dataset already exists.
    async fn create_dataset(&self, dataset: &DatasetRef) -> Result<(), BackendError>;

    async fn table_exists(&self, table: &TableRef) -> Result<bool, BackendError>;

    /// Fails with a 409 [`BackendError`] when the table already exists.
    async fn create_table(
        &self,
        table: &TableRef,
        description: &TableDescription,
    ) -> Result<TableDescription, BackendError>;

    async fn get_table(&self, table: &TableRef) -> Result<TableDescription, BackendError>;

    /// Streams one batch. Per-row rejections come back as an error whose
    /// body holds the backend's insert errors.
    async fn insert_rows(&self, table: &TableRef, rows: &[Row]) -> Result<(), BackendError>;

    async fn list_rows(&self, table: &TableRef, page: &PageRequest)
        -> Result<RowPage, BackendError>;

    async fn query_incremental(
        &self,
        table: &TableRef,
        query: &IncrementalQuery,
    ) -> Result<Vec<Map<String, Value>>, BackendError>;
}
