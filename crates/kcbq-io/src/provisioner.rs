//! Idempotent dataset/table provisioning.
//!
//! Sink tasks create what is missing on their first write; several task
//! instances may start together, so a "already exists" conflict on creation
//! means another instance won the race and counts as success. Source tasks
//! only verify existence and capture the table description.

use std::sync::Arc;

use kcbq_core::{BackendError, ConnectorError, Result, TableBackend, TableDescription, TableRef};
use tracing::{debug, info, warn};

/// What [`TableProvisioner`] did and the table description now in effect.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionOutcome {
    pub dataset_created: bool,
    pub table_created: bool,
    pub description: TableDescription,
}

pub struct TableProvisioner<B: ?Sized> {
    backend: Arc<B>,
}

impl<B: TableBackend + ?Sized> TableProvisioner<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Makes sure dataset and table exist, creating them when needed.
    ///
    /// `description` is the schema to create the table with; it is only
    /// required when the table is missing.
    pub async fn ensure(
        &self,
        table: &TableRef,
        description: Option<&TableDescription>,
    ) -> Result<ProvisionOutcome> {
        let dataset = table.dataset();
        let dataset_exists = self
            .backend
            .dataset_exists(&dataset)
            .await
            .map_err(|e| ConnectorError::backend("datasets.get", e))?;

        let mut dataset_created = false;
        if !dataset_exists {
            info!(dataset = %dataset, "dataset does not exist, creating it");
            match self.backend.create_dataset(&dataset).await {
                Ok(()) => dataset_created = true,
                Err(e) if e.is_already_exists() => {
                    warn!(dataset = %dataset, "dataset was created concurrently: {}", e);
                }
                Err(e) => return Err(ConnectorError::backend("datasets.insert", e)),
            }
        }

        let table_exists = self
            .backend
            .table_exists(table)
            .await
            .map_err(|e| ConnectorError::backend("tables.get", e))?;

        if table_exists {
            let description = self.fetch(table).await?;
            debug!(table = %table, "table already exists");
            return Ok(ProvisionOutcome {
                dataset_created,
                table_created: false,
                description,
            });
        }

        let Some(description) = description else {
            return Err(ConnectorError::Config(format!(
                "table `{table}` does not exist and no schema is available to create it"
            )));
        };
        // Own copy; the caller keeps theirs
        let description = description.clone();

        info!(table = %table, fields = description.fields().len(), "creating table");
        match self.backend.create_table(table, &description).await {
            Ok(created) => Ok(ProvisionOutcome {
                dataset_created,
                table_created: true,
                description: created,
            }),
            Err(e) if e.is_already_exists() => {
                warn!(table = %table, "table was created concurrently: {}", e);
                Ok(ProvisionOutcome {
                    dataset_created,
                    table_created: false,
                    description: self.fetch(table).await?,
                })
            }
            Err(e) => Err(ConnectorError::backend("tables.insert", e)),
        }
    }

    /// Verifies that dataset and table exist and captures the table
    /// description. Missing resources are fatal.
    pub async fn ensure_existing(&self, table: &TableRef) -> Result<ProvisionOutcome> {
        let dataset = table.dataset();
        let dataset_exists = self
            .backend
            .dataset_exists(&dataset)
            .await
            .map_err(|e| ConnectorError::backend("datasets.get", e))?;
        if !dataset_exists {
            return Err(ConnectorError::DatasetNotFound {
                dataset: dataset.to_string(),
            });
        }

        let table_exists = self
            .backend
            .table_exists(table)
            .await
            .map_err(|e| ConnectorError::backend("tables.get", e))?;
        if !table_exists {
            return Err(ConnectorError::TableNotFound {
                table: table.to_string(),
            });
        }

        let description = self.fetch(table).await?;
        info!(
            table = %table,
            fields = description.fields().len(),
            partitioned = description.time_partitioning.is_some(),
            "captured table description"
        );
        Ok(ProvisionOutcome {
            dataset_created: false,
            table_created: false,
            description,
        })
    }

    async fn fetch(&self, table: &TableRef) -> Result<TableDescription> {
        self.backend
            .get_table(table)
            .await
            .map_err(|e: BackendError| ConnectorError::backend("tables.get", e))
    }
}
