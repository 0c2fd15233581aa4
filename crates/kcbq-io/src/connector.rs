//! Connector objects: validate properties once and fan them out into task
//! configurations.

use std::sync::Arc;

use async_trait::async_trait;
use kcbq_core::{
    Connector, ConnectorError, Result, SinkConfig, SourceConfig, TableBackend, TableDescription,
};
use tracing::info;

use crate::provisioner::TableProvisioner;
use crate::sink_bigquery::SinkTaskConfig;
use crate::source_bigquery::SourceTaskConfig;

#[derive(Debug, Default)]
pub struct BigQuerySinkConnector {
    config: Option<SinkConfig>,
}

impl BigQuerySinkConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Connector for BigQuerySinkConnector {
    type Properties = SinkConfig;
    type TaskConfig = SinkTaskConfig;

    async fn start(&mut self, properties: SinkConfig) -> Result<()> {
        properties.validate()?;
        info!(table = %properties.table_ref(), "sink connector started");
        self.config = Some(properties);
        Ok(())
    }

    /// One configuration regardless of `max_tasks`; the table has a single
    /// writer per connector.
    fn task_configs(&self, max_tasks: usize) -> Result<Vec<SinkTaskConfig>> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| ConnectorError::NotStarted("bigquery-sink-connector".into()))?;
        Ok(vec![SinkTaskConfig { max_tasks, config }])
    }

    async fn stop(&mut self) -> Result<()> {
        if self.config.take().is_some() {
            info!("sink connector stopped");
        }
        Ok(())
    }
}

/// Source connector. Verifies the source table at start and hands its
/// description to the task so every record can carry it.
pub struct BigQuerySourceConnector<B: ?Sized> {
    backend: Arc<B>,
    config: Option<SourceConfig>,
    description: Option<TableDescription>,
}

impl<B: TableBackend + ?Sized> BigQuerySourceConnector<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            config: None,
            description: None,
        }
    }

    pub fn table_description(&self) -> Option<&TableDescription> {
        self.description.as_ref()
    }
}

#[async_trait]
impl<B: TableBackend + ?Sized> Connector for BigQuerySourceConnector<B> {
    type Properties = SourceConfig;
    type TaskConfig = SourceTaskConfig;

    async fn start(&mut self, properties: SourceConfig) -> Result<()> {
        properties.validate()?;
        let table = properties.table_ref();
        let outcome = TableProvisioner::new(self.backend.clone())
            .ensure_existing(&table)
            .await?;
        info!(table = %table, mode = ?properties.mode, "source connector started");
        self.description = Some(outcome.description);
        self.config = Some(properties);
        Ok(())
    }

    fn task_configs(&self, max_tasks: usize) -> Result<Vec<SourceTaskConfig>> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| ConnectorError::NotStarted("bigquery-source-connector".into()))?;
        Ok(vec![SourceTaskConfig {
            max_tasks,
            config,
            table_description: self.description.clone(),
        }])
    }

    async fn stop(&mut self) -> Result<()> {
        if self.config.take().is_some() {
            self.description = None;
            info!("source connector stopped");
        }
        Ok(())
    }
}
