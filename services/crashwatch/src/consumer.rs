use crate::config::KafkaConfig;
use crate::detection::CrashDetectionHandler;
use crate::error::PipelineError;
use crate::events::{DetectionTrigger, S3EventNotification};
use crate::extraction::FrameExtractionHandler;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::Offset;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Handles one trigger payload pulled off a topic
#[async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn handle_payload(&self, payload: &[u8]) -> Result<(), PipelineError>;
}

#[async_trait]
impl TriggerHandler for FrameExtractionHandler {
    async fn handle_payload(&self, payload: &[u8]) -> Result<(), PipelineError> {
        let event = S3EventNotification::from_slice(payload)?;
        let reports = self.handle(&event).await?;

        for report in &reports {
            debug!(
                video_key = %report.video_key,
                uploaded = report.uploaded.len(),
                failed = report.failed.len(),
                execution = ?report.execution,
                "Extraction report"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl TriggerHandler for CrashDetectionHandler {
    async fn handle_payload(&self, payload: &[u8]) -> Result<(), PipelineError> {
        let trigger = DetectionTrigger::from_slice(payload)?;
        let report = self.handle(&trigger).await?;

        debug!(
            frames = report.frames,
            incident = report.incident.is_some(),
            notified = report.notified,
            deleted = report.cleanup.deleted.len(),
            cleanup_failed = report.cleanup.failed.len(),
            "Detection report"
        );
        Ok(())
    }
}

/// What to do with a message's offset once it has been handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Commit,
    /// Seek the partition back to the message after `delay` so it is
    /// consumed again before anything after it
    Redeliver { attempt: u32, delay: Duration },
    /// Redeliveries exhausted; commit past the message
    Drop { attempts: u32 },
}

/// Counts fatal failures of the message each partition is stuck on.
///
/// A partition never advances past a fatally failed message until the
/// message succeeds or its redeliveries run out, so one entry per
/// partition is enough.
#[derive(Debug)]
pub struct RedeliveryTracker {
    max_redeliveries: u32,
    backoff: Duration,
    pending: HashMap<i32, (i64, u32)>,
}

impl RedeliveryTracker {
    pub fn new(max_redeliveries: u32, backoff: Duration) -> Self {
        Self {
            max_redeliveries,
            backoff,
            pending: HashMap::new(),
        }
    }

    pub fn decide(
        &mut self,
        partition: i32,
        offset: i64,
        outcome: &Result<(), PipelineError>,
    ) -> Disposition {
        if !matches!(outcome, Err(e) if e.is_fatal()) {
            self.pending.remove(&partition);
            return Disposition::Commit;
        }

        let failures = match self.pending.get(&partition) {
            Some(&(held, failures)) if held == offset => failures + 1,
            _ => 1,
        };

        if failures > self.max_redeliveries {
            self.pending.remove(&partition);
            return Disposition::Drop { attempts: failures };
        }

        self.pending.insert(partition, (offset, failures));
        Disposition::Redeliver {
            attempt: failures,
            delay: self
                .backoff
                .saturating_mul(2u32.saturating_pow(failures - 1)),
        }
    }
}

/// Kafka consumer feeding trigger payloads to a handler
pub struct TriggerConsumer {
    consumer: StreamConsumer,
    topic: String,
    max_redeliveries: u32,
    redelivery_backoff: Duration,
    handler: Arc<dyn TriggerHandler>,
}

impl TriggerConsumer {
    pub fn new(config: &KafkaConfig, topic: &str, handler: Arc<dyn TriggerHandler>) -> Result<Self> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string());

        if config.ssl_enabled {
            client_config.set("security.protocol", "SASL_SSL");
            if let Some(ref ca_location) = config.ssl_ca_location {
                client_config.set("ssl.ca.location", ca_location);
            }
        }

        if let (Some(ref username), Some(ref password)) =
            (&config.sasl_username, &config.sasl_password)
        {
            client_config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        let consumer: StreamConsumer = client_config
            .create()
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(&[topic])
            .with_context(|| format!("Failed to subscribe to {topic}"))?;

        info!(
            topic = %topic,
            group = %config.consumer_group,
            "Subscribed to Kafka topic"
        );

        Ok(Self {
            consumer,
            topic: topic.to_string(),
            max_redeliveries: config.max_redeliveries,
            redelivery_backoff: Duration::from_millis(config.redelivery_backoff_ms),
            handler,
        })
    }

    /// Consume until `shutdown` is cancelled
    #[instrument(skip(self, shutdown), fields(topic = %self.topic))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("Starting trigger consumer");

        let mut message_stream = self.consumer.stream();
        let mut redeliveries = RedeliveryTracker::new(self.max_redeliveries, self.redelivery_backoff);

        loop {
            let message_result = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping consumer");
                    break;
                }
                next = message_stream.next() => match next {
                    Some(result) => result,
                    None => break,
                },
            };

            match message_result {
                Ok(message) => {
                    self.process_message(&message, &mut redeliveries, &shutdown)
                        .await
                }
                Err(e) => {
                    error!(error = %e, "Kafka consumer error");
                    metrics::counter!("crashwatch.kafka.errors").increment(1);
                }
            }
        }

        Ok(())
    }

    #[instrument(skip_all, fields(partition = message.partition(), offset = message.offset()))]
    async fn process_message(
        &self,
        message: &BorrowedMessage<'_>,
        redeliveries: &mut RedeliveryTracker,
        shutdown: &CancellationToken,
    ) {
        let outcome = match message.payload() {
            Some(payload) => self.handler.handle_payload(payload).await,
            None => Err(PipelineError::MalformedEvent("message has no payload".to_string())),
        };

        match &outcome {
            Ok(()) => metrics::counter!("crashwatch.messages.processed").increment(1),
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Invocation aborted");
                metrics::counter!("crashwatch.messages.failed").increment(1);
            }
            Err(e) => {
                warn!(error = %e, "Invocation finished with errors");
                metrics::counter!("crashwatch.messages.processed").increment(1);
            }
        }

        match redeliveries.decide(message.partition(), message.offset(), &outcome) {
            Disposition::Commit => self.commit(message),
            Disposition::Drop { attempts } => {
                error!(attempts, "Redeliveries exhausted, dropping message");
                metrics::counter!("crashwatch.messages.dropped").increment(1);
                self.commit(message);
            }
            Disposition::Redeliver { attempt, delay } => {
                warn!(attempt, delay = ?delay, "Redelivering message");
                metrics::counter!("crashwatch.messages.redelivered").increment(1);

                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                if let Err(e) = self.consumer.seek(
                    message.topic(),
                    message.partition(),
                    Offset::Offset(message.offset()),
                    SEEK_TIMEOUT,
                ) {
                    error!(error = %e, "Failed to seek back for redelivery");
                }
            }
        }
    }

    fn commit(&self, message: &BorrowedMessage<'_>) {
        if let Err(e) = self.consumer.commit_message(message, CommitMode::Async) {
            warn!(error = %e, "Failed to commit offset");
        }
    }
}
