use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use kcbq_core::{
    Connector, Converter, Event, EventRx, HostSpec, Notifier, PollMode, SinkConfig, SourceConfig,
    Task,
};
use kcbq_io::{
    BigQueryBackend, BigQuerySinkConnector, BigQuerySinkTask, BigQuerySourceConnector,
    BigQuerySourceTask, KafkaSinkHost, KafkaSourceHost,
};
use kcbq_tx::{ConverterFactory, JsonConverter};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Used when no `--config` is given; every value can be overridden by flags.
const DEFAULT_CONFIG: &str = r#"
connector:
  project_id: bq-project-id
  dataset: bq_dataset
  table: bq_table
"#;

#[derive(Parser, Debug)]
#[command(name = "kcbq", about = "Move rows between Kafka topics and BigQuery tables")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume a topic and insert its records into a table
    Sink(SinkArgs),
    /// Read a table and produce its rows to a topic
    Source(SourceArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Host + connector YAML
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Kafka bootstrap servers
    #[arg(short, long)]
    kafka: Option<String>,
    #[arg(short, long)]
    topic: Option<String>,
    #[arg(short, long)]
    project_id: Option<String>,
    #[arg(short, long)]
    dataset: Option<String>,
    #[arg(short = 'b', long)]
    table: Option<String>,
    #[arg(short, long)]
    id_column: Option<String>,
}

#[derive(Args, Debug)]
struct SinkArgs {
    #[command(flatten)]
    common: CommonArgs,
    /// Consumer group
    #[arg(short, long)]
    group: Option<String>,
    /// Rows per insert call
    #[arg(short = 'o', long)]
    batch_size: Option<usize>,
    /// Treat payloads as plain row objects matching `connector.schema`
    #[arg(long)]
    raw: bool,
}

#[derive(Args, Debug)]
struct SourceArgs {
    #[command(flatten)]
    common: CommonArgs,
    /// Kafka client id
    #[arg(short, long)]
    name: Option<String>,
    /// Milliseconds between polls
    #[arg(short = 'v', long)]
    interval: Option<u64>,
    /// Rows per poll
    #[arg(short = 'o', long)]
    max_poll_count: Option<usize>,
    /// Watermark queries instead of a page scan
    #[arg(long)]
    incremental: bool,
    #[arg(long)]
    incrementing_column: Option<String>,
    #[arg(long)]
    timestamp_column: Option<String>,
    /// RFC 3339 start of the watermark
    #[arg(long)]
    init_timestamp: Option<DateTime<Utc>>,
}

fn load_spec<C: serde::de::DeserializeOwned>(path: Option<&PathBuf>) -> Result<HostSpec<C>> {
    match path {
        Some(path) => HostSpec::load(path),
        None => HostSpec::from_yaml_str(DEFAULT_CONFIG),
    }
}

fn apply_common<C>(spec: &mut HostSpec<C>, args: &CommonArgs) {
    if let Some(kafka) = &args.kafka {
        spec.kafka.brokers = kafka.clone();
    }
    if let Some(topic) = &args.topic {
        spec.topic = topic.clone();
    }
}

fn sink_spec(args: &SinkArgs) -> Result<HostSpec<SinkConfig>> {
    let mut spec: HostSpec<SinkConfig> = load_spec(args.common.config.as_ref())?;
    apply_common(&mut spec, &args.common);
    let c = &mut spec.connector;
    if let Some(v) = &args.common.project_id {
        c.project_id = v.clone();
    }
    if let Some(v) = &args.common.dataset {
        c.dataset = v.clone();
    }
    if let Some(v) = &args.common.table {
        c.table = v.clone();
    }
    if let Some(v) = &args.common.id_column {
        c.id_column = Some(v.clone());
    }
    if let Some(v) = args.batch_size {
        c.batch_size = v;
    }
    if let Some(group) = &args.group {
        spec.kafka.group_id = group.clone();
    }
    Ok(spec)
}

fn source_spec(args: &SourceArgs) -> Result<HostSpec<SourceConfig>> {
    let mut spec: HostSpec<SourceConfig> = load_spec(args.common.config.as_ref())?;
    apply_common(&mut spec, &args.common);
    let c = &mut spec.connector;
    if let Some(v) = &args.common.project_id {
        c.project_id = v.clone();
    }
    if let Some(v) = &args.common.dataset {
        c.dataset = v.clone();
    }
    if let Some(v) = &args.common.table {
        c.table = v.clone();
    }
    if let Some(v) = &args.common.id_column {
        c.id_column = v.clone();
    }
    if let Some(v) = args.max_poll_count {
        c.max_poll_count = v;
    }
    if args.incremental {
        c.mode = PollMode::Incremental;
    }
    if let Some(v) = &args.incrementing_column {
        c.incrementing_column_name = Some(v.clone());
    }
    if let Some(v) = &args.timestamp_column {
        c.timestamp_column_name = Some(v.clone());
    }
    if let Some(v) = args.init_timestamp {
        c.init_timestamp = Some(v);
    }
    if let Some(name) = &args.name {
        spec.kafka.client_id = name.clone();
    }
    if let Some(interval) = args.interval {
        spec.poll_interval_ms = interval;
    }
    Ok(spec)
}

/// Logs task notifications until every notifier is gone.
async fn log_events(mut events: EventRx) {
    while let Some(event) = events.recv().await {
        match &event {
            Event::StatsReport { name, stats } => {
                let stats = serde_json::to_string(stats).unwrap_or_default();
                info!(task = %name, %stats, "stats report");
            }
            Event::RecordObserved(key) | Event::ModelUpsert(key) | Event::ModelDelete(key) => {
                debug!(event = event.kind(), key = %key, "record event");
            }
        }
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
        }
        token.cancel();
    });
    cancel
}

async fn run_sink(args: SinkArgs) -> Result<()> {
    let spec = sink_spec(&args)?;
    let backend = Arc::new(BigQueryBackend::new(&spec.bigquery)?);
    let (notifier, events) = Notifier::channel();
    tokio::spawn(log_events(events));

    let mut connector = BigQuerySinkConnector::new();
    connector.start(spec.connector.clone()).await?;
    let config = connector
        .task_configs(spec.max_tasks)?
        .into_iter()
        .next()
        .context("connector produced no task configuration")?;

    let task = Arc::new(BigQuerySinkTask::new(
        format!("sink-{}", spec.connector.table),
        backend,
        notifier,
    ));
    task.start(config).await?;

    let cancel = cancel_on_ctrl_c();
    let interval = Duration::from_millis(spec.stats_interval_ms);
    let result = if args.raw {
        let schema = spec
            .connector
            .schema
            .clone()
            .context("--raw needs `connector.schema` in the configuration")?;
        let converter = ConverterFactory::passthrough(schema)?;
        host_sink(task, converter, &spec, interval, cancel).await
    } else {
        host_sink(task, JsonConverter, &spec, interval, cancel).await
    };

    connector.stop().await?;
    result
}

async fn host_sink<C: Converter>(
    task: Arc<BigQuerySinkTask<BigQueryBackend>>,
    converter: C,
    spec: &HostSpec<SinkConfig>,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    KafkaSinkHost::new(task, converter, spec.kafka.clone(), &spec.topic)
        .with_commit_interval(interval)
        .run(cancel)
        .await
}

async fn run_source(args: SourceArgs) -> Result<()> {
    let spec = source_spec(&args)?;
    let backend = Arc::new(BigQueryBackend::new(&spec.bigquery)?);
    let (notifier, events) = Notifier::channel();
    tokio::spawn(log_events(events));

    let mut connector = BigQuerySourceConnector::new(backend.clone());
    connector.start(spec.connector.clone()).await?;
    let config = connector
        .task_configs(spec.max_tasks)?
        .into_iter()
        .next()
        .context("connector produced no task configuration")?;

    let task = Arc::new(BigQuerySourceTask::new(
        format!("source-{}", spec.connector.table),
        backend,
        notifier,
    ));
    task.start(config).await?;
    if spec.max_tasks > 1 {
        warn!(max_tasks = spec.max_tasks, "a table is read by a single task");
    }

    let result = KafkaSourceHost::new(task, JsonConverter, spec.kafka.clone(), &spec.topic)
        .with_poll_interval(Duration::from_millis(spec.poll_interval_ms))
        .with_stats_interval(Duration::from_millis(spec.stats_interval_ms))
        .run(cancel_on_ctrl_c())
        .await;

    connector.stop().await?;
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
    let cli = Cli::parse();
    match cli.command {
        Command::Sink(args) => run_sink(args).await,
        Command::Source(args) => run_source(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_flags_override_the_default_config() {
        let cli = Cli::parse_from([
            "kcbq", "sink", "-p", "proj", "-d", "ds", "-b", "users", "-i", "id", "-o", "50",
            "-t", "users_topic",
        ]);
        let Command::Sink(args) = cli.command else {
            panic!("expected sink");
        };
        let spec = sink_spec(&args).unwrap();
        assert_eq!(spec.connector.table_ref().to_string(), "proj:ds.users");
        assert_eq!(spec.connector.id_column.as_deref(), Some("id"));
        assert_eq!(spec.connector.batch_size, 50);
        assert_eq!(spec.topic, "users_topic");
        spec.connector.validate().unwrap();
    }

    #[test]
    fn source_flags_select_incremental_mode() {
        let cli = Cli::parse_from([
            "kcbq",
            "source",
            "--incremental",
            "--incrementing-column",
            "id",
            "--timestamp-column",
            "updated_at",
            "--init-timestamp",
            "2024-01-01T00:00:00Z",
            "-v",
            "1000",
        ]);
        let Command::Source(args) = cli.command else {
            panic!("expected source");
        };
        let spec = source_spec(&args).unwrap();
        assert_eq!(spec.connector.mode, PollMode::Incremental);
        assert_eq!(spec.poll_interval_ms, 1000);
        assert_eq!(
            spec.connector.initial_watermark().last_timestamp.to_rfc3339(),
            "2024-01-01T00:00:00+00:00"
        );
        spec.connector.validate().unwrap();
    }
}
