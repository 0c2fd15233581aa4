//! Kafka hosts driving connector tasks.
//!
//! [`KafkaSinkHost`] consumes a topic, converts each message and hands it to
//! a sink task; offsets are committed only after a flush, so a crash replays
//! whatever had not reached the table. [`KafkaSourceHost`] polls a source
//! task on an interval and produces every record to a topic.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use kcbq_core::{ConnectorError, Converter, KafkaSpec, RawMessage, SinkTask, SourceTask};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::BorrowedMessage;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use rdkafka::Message as KafkaMessage;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KafkaSinkHost<T, C> {
    task: Arc<T>,
    converter: C,
    kafka: KafkaSpec,
    topic: String,
    commit_interval: Duration,
}

impl<T: SinkTask, C: Converter> KafkaSinkHost<T, C> {
    pub fn new(task: Arc<T>, converter: C, kafka: KafkaSpec, topic: impl Into<String>) -> Self {
        Self {
            task,
            converter,
            kafka,
            topic: topic.into(),
            commit_interval: Duration::from_secs(30),
        }
    }

    /// Flush + commit cadence; stats are reported on the same tick.
    pub fn with_commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = interval;
        self
    }

    fn consumer(&self) -> Result<StreamConsumer> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.kafka.brokers)
            .set("group.id", &self.kafka.group_id)
            .set("client.id", &self.kafka.client_id)
            .set("auto.offset.reset", &self.kafka.from_offset)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false")
            .create()
            .context("create kafka consumer")?;
        consumer
            .subscribe(&[&self.topic])
            .with_context(|| format!("subscribe to `{}`", self.topic))?;
        Ok(consumer)
    }

    /// Consumes until cancelled or until the task fails.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let consumer = self.consumer()?;
        info!(topic = %self.topic, brokers = %self.kafka.brokers, task = self.task.name(), "sink host consuming");

        let mut stream = consumer.stream();
        let mut ticker = tokio::time::interval(self.commit_interval);
        ticker.tick().await;

        let outcome: Result<()> = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = ticker.tick() => {
                    if let Err(e) = self.checkpoint(&consumer).await {
                        break Err(e);
                    }
                    self.task.report();
                }
                message = stream.next() => {
                    let Some(message) = message else { break Ok(()) };
                    let message = match message {
                        Ok(m) => m,
                        Err(e) => {
                            warn!("kafka error on consuming message from broker: {:?}", e);
                            continue;
                        }
                    };
                    if let Err(e) = self.deliver(&message).await {
                        break Err(e);
                    }
                }
            }
        };

        drop(stream);
        // Drain what is buffered before giving up the partitions
        let shutdown = match &outcome {
            Ok(()) => self.checkpoint(&consumer).await,
            Err(_) => Ok(()),
        };
        self.task.stop().await?;
        info!(topic = %self.topic, "sink host stopped");
        outcome.and(shutdown)
    }

    async fn deliver(&self, message: &BorrowedMessage<'_>) -> Result<()> {
        let raw = raw_message(message)?;
        let key = raw.key.clone().unwrap_or_default();
        let record = self
            .converter
            .to_record(raw)
            .map_err(|source| ConnectorError::Transform { key, source })?;
        debug!(key = %record.key, partition = message.partition(), offset = message.offset(), "message converted");
        self.task.put(vec![record]).await?;
        Ok(())
    }

    async fn checkpoint(&self, consumer: &StreamConsumer) -> Result<()> {
        self.task.flush().await?;
        match consumer.commit_consumer_state(CommitMode::Async) {
            Ok(()) => debug!(topic = %self.topic, "offsets committed"),
            // Nothing consumed since the last commit
            Err(e) => debug!(topic = %self.topic, "offset commit skipped: {}", e),
        }
        Ok(())
    }
}

pub struct KafkaSourceHost<T, C> {
    task: Arc<T>,
    converter: C,
    kafka: KafkaSpec,
    topic: String,
    poll_interval: Duration,
    stats_interval: Duration,
}

impl<T: SourceTask, C: Converter> KafkaSourceHost<T, C> {
    pub fn new(task: Arc<T>, converter: C, kafka: KafkaSpec, topic: impl Into<String>) -> Self {
        Self {
            task,
            converter,
            kafka,
            topic: topic.into(),
            poll_interval: Duration::from_millis(250),
            stats_interval: Duration::from_secs(30),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    fn producer(&self) -> Result<FutureProducer> {
        ClientConfig::new()
            .set("bootstrap.servers", &self.kafka.brokers)
            .set("client.id", &self.kafka.client_id)
            .set("message.timeout.ms", "5000")
            .set("delivery.timeout.ms", "10000")
            .set("request.timeout.ms", "5000")
            .create()
            .context("create kafka producer")
    }

    /// Polls until cancelled or until the task fails with a fatal error.
    /// Transient errors are logged and the same position is retried on the
    /// next tick.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let producer = self.producer()?;
        info!(topic = %self.topic, brokers = %self.kafka.brokers, task = self.task.name(), "source host producing");

        let mut poll_ticker = tokio::time::interval(self.poll_interval);
        let mut stats_ticker = tokio::time::interval(self.stats_interval);
        stats_ticker.tick().await;

        let outcome: Result<()> = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = stats_ticker.tick() => {
                    self.task.report();
                }
                _ = poll_ticker.tick() => {
                    match self.task.poll().await {
                        Ok(records) => {
                            if let Err(e) = self.produce(&producer, records).await {
                                break Err(e);
                            }
                        }
                        Err(e) if e.is_fatal() => break Err(e.into()),
                        Err(e) => error!(task = self.task.name(), "poll failed, retrying: {}", e),
                    }
                }
            }
        };

        self.task.stop().await?;
        info!(topic = %self.topic, "source host stopped");
        outcome
    }

    async fn produce(&self, producer: &FutureProducer, records: Vec<kcbq_core::Record>) -> Result<()> {
        for record in records {
            let payload = self
                .converter
                .from_record(&record)
                .with_context(|| format!("encode record `{}`", record.key))?;
            let mut message = FutureRecord::to(&self.topic)
                .key(&record.key)
                .payload(&payload);
            if record.partition >= 0 {
                message = message.partition(record.partition);
            }
            producer
                .send(message, DELIVERY_TIMEOUT)
                .await
                .map_err(|(e, _)| e)
                .with_context(|| format!("produce record `{}` to `{}`", record.key, self.topic))?;
        }
        Ok(())
    }
}

// Empty payloads are tombstones
fn raw_message(m: &BorrowedMessage<'_>) -> Result<RawMessage> {
    let payload = match m.payload() {
        Some(bytes) if !bytes.is_empty() => serde_json::from_slice(bytes).with_context(|| {
            format!("payload at {}/{}@{} is not JSON", m.topic(), m.partition(), m.offset())
        })?,
        _ => Value::Null,
    };
    Ok(RawMessage {
        key: m.key().map(|k| String::from_utf8_lossy(k).into_owned()),
        payload,
        partition: m.partition(),
        topic: m.topic().to_string(),
    })
}
