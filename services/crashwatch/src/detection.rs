//! Frame-triggered stage: screen a batch of frames and converge on at most
//! one incident.
//!
//! Frames are fetched and classified concurrently but rejoined in batch
//! order before resolution, so the evidence frame never depends on which
//! call finished first. Only after an incident exists is anything published
//! or deleted.

use crate::blob_store::BlobStore;
use crate::classifier::{ClassificationResult, Classifier};
use crate::cleanup::{CleanupExecutor, CleanupReport};
use crate::config::{MinConfidence, Settings};
use crate::error::PipelineError;
use crate::events::DetectionTrigger;
use crate::frame_extractor::frame_prefix;
use crate::notifier::{Notification, Notifier};
use crate::orchestrator::WorkflowInput;
use crate::resolver::{FrameOutcome, Incident, IncidentResolver, IncidentResolverBuilder};
use futures::future::FutureExt;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// What a classification that runs out of time means for the batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Treat the frame as non-qualifying and carry on
    #[default]
    FailOpen,
    /// Abort the batch; nothing is published or deleted
    FailClosed,
}

/// Outcome of screening one batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionReport {
    /// Distinct frames in the batch
    pub frames: usize,
    /// Frames the classifier answered for
    pub classified: usize,
    /// Frames treated as non-qualifying because fetch or classify failed
    pub unclassified: usize,
    pub incident: Option<Incident>,
    pub notified: bool,
    pub cleanup: CleanupReport,
}

/// Handles frame batches
pub struct CrashDetectionHandler {
    settings: Arc<Settings>,
    store: Arc<dyn BlobStore>,
    classifier: Arc<dyn Classifier>,
    notifier: Arc<dyn Notifier>,
    cleanup: CleanupExecutor,
}

impl CrashDetectionHandler {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn BlobStore>,
        classifier: Arc<dyn Classifier>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let cleanup = CleanupExecutor::new(store.clone(), settings.transfer_concurrency);
        Self {
            settings,
            store,
            classifier,
            notifier,
            cleanup,
        }
    }

    pub async fn handle(&self, trigger: &DetectionTrigger) -> Result<DetectionReport, PipelineError> {
        match trigger {
            DetectionTrigger::Frames(event) => {
                let bucket = self.settings.processed_bucket.as_str();
                let keys: Vec<String> = event
                    .objects()
                    .into_iter()
                    .filter(|object| {
                        let ours = object.bucket == bucket;
                        if !ours {
                            warn!(
                                bucket = %object.bucket,
                                key = %object.key,
                                "Skipping frame outside the processed bucket"
                            );
                        }
                        ours
                    })
                    .map(|object| object.key)
                    .collect();

                self.run_batch(bucket, &keys, self.settings.min_confidence, None)
                    .await
            }
            DetectionTrigger::Workflow(input) => self.handle_workflow(input).await,
        }
    }

    /// Screen every frame extracted from one video
    #[instrument(skip(self, input), fields(video_key = %input.video_key))]
    async fn handle_workflow(&self, input: &WorkflowInput) -> Result<DetectionReport, PipelineError> {
        if input.bucket != self.settings.processed_bucket {
            warn!(bucket = %input.bucket, "Skipping workflow for a foreign bucket");
            return Ok(DetectionReport::default());
        }

        let min_confidence = if input.min_confidence.trim().is_empty() {
            self.settings.min_confidence
        } else {
            input.min_confidence.parse::<MinConfidence>()?
        };

        let prefix = frame_prefix(&self.settings.frame_prefix, &input.video_key);
        let mut keys = self
            .store
            .list(&input.bucket, &prefix)
            .await
            .map_err(|e| PipelineError::NothingUsable {
                key: prefix.clone(),
                reason: e.to_string(),
            })?;
        keys.sort();

        self.run_batch(&input.bucket, &keys, min_confidence, Some(&input.video_key))
            .await
    }

    /// Classify, resolve, notify, then clean up one batch.
    ///
    /// Duplicate keys count once, at their first position.
    #[instrument(skip(self, keys), fields(frames = keys.len()))]
    pub async fn run_batch(
        &self,
        bucket: &str,
        keys: &[String],
        min_confidence: MinConfidence,
        source_key: Option<&str>,
    ) -> Result<DetectionReport, PipelineError> {
        let mut seen = HashSet::new();
        let keys: Vec<&str> = keys
            .iter()
            .map(String::as_str)
            .filter(|key| seen.insert(*key))
            .collect();

        let mut report = DetectionReport {
            frames: keys.len(),
            ..Default::default()
        };

        if keys.is_empty() {
            info!("Empty batch, nothing to screen");
            return Ok(report);
        }

        let screens: Vec<_> = keys
            .into_iter()
            .map(|key| self.screen_frame(bucket, key, min_confidence).boxed())
            .collect();
        let screened: Vec<(FrameOutcome, bool)> = stream::iter(screens)
            .buffered(self.settings.classify_concurrency)
            .try_collect()
            .await?;

        let mut batch = Vec::with_capacity(screened.len());
        for (outcome, classified) in screened {
            if classified {
                report.classified += 1;
            } else {
                report.unclassified += 1;
            }
            batch.push(outcome);
        }

        let resolver = IncidentResolverBuilder::new()
            .label_name(self.settings.label_name.clone())
            .min_confidence(min_confidence)
            .policy(self.settings.policy)
            .build();

        let Some(incident) = resolver
            .resolve(&batch)
            .map(|incident| incident.with_source_key(source_key))
        else {
            info!(
                classified = report.classified,
                unclassified = report.unclassified,
                "No crash detected"
            );
            return Ok(report);
        };

        metrics::counter!("crashwatch.incidents.detected").increment(1);
        info!(
            evidence_key = %incident.evidence_key,
            confidence = incident.confidence,
            "Crash detected"
        );

        match self.notify(bucket, &incident).await {
            Ok(()) => report.notified = true,
            Err(e) if e.is_fatal() => return Err(e),
            Err(PipelineError::NotificationTooLarge { size, limit }) => {
                warn!(size, limit, "Incident notification not sent, evidence frame too large");
                metrics::counter!("crashwatch.notifications.too_large").increment(1);
            }
            Err(e) => warn!(error = %e, "Incident notification not sent"),
        }

        let plan = IncidentResolver::plan_retention(&batch, Some(&incident));
        report.cleanup = self.cleanup.execute(bucket, &plan).await;
        report.incident = Some(incident);

        Ok(report)
    }

    /// Fetch and classify one frame. Failures yield a non-qualifying
    /// outcome, except a timeout under [`TimeoutPolicy::FailClosed`].
    async fn screen_frame(
        &self,
        bucket: &str,
        key: &str,
        min_confidence: MinConfidence,
    ) -> Result<(FrameOutcome, bool), PipelineError> {
        let unclassified = || {
            metrics::counter!("crashwatch.classification.failed").increment(1);
            Ok((FrameOutcome::new(key, ClassificationResult::empty()), false))
        };

        let image = match self.store.fetch(bucket, key).await {
            Ok(image) => image,
            Err(e) => {
                warn!(key = %key, error = %e, "Frame not fetched, treating as non-qualifying");
                return unclassified();
            }
        };

        let limit = self.settings.classify_timeout;
        let started = Instant::now();
        let outcome =
            tokio::time::timeout(limit, self.classifier.classify(key, &image, min_confidence)).await;
        metrics::histogram!("crashwatch.classification.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(Ok(result)) => {
                debug!(key = %key, labels = result.labels.len(), "Frame screened");
                metrics::counter!("crashwatch.frames.classified").increment(1);
                Ok((FrameOutcome::new(key, result), true))
            }
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Classification failed, treating as non-qualifying");
                unclassified()
            }
            Err(_) => match self.settings.timeout_policy {
                TimeoutPolicy::FailOpen => {
                    warn!(key = %key, timeout = ?limit, "Classification timed out, treating as non-qualifying");
                    unclassified()
                }
                TimeoutPolicy::FailClosed => Err(PipelineError::ClassificationAborted {
                    key: key.to_string(),
                    message: format!("timed out after {limit:?}"),
                }),
            },
        }
    }

    async fn notify(&self, bucket: &str, incident: &Incident) -> Result<(), PipelineError> {
        let image = self
            .store
            .fetch(bucket, &incident.evidence_key)
            .await
            .map_err(|e| PipelineError::Notification(format!("evidence frame unavailable: {e}")))?;

        let notification = Notification::incident(bucket, incident, image)?;
        self.notifier.publish(&notification).await
    }
}
