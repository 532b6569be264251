//! Upload-triggered stage: split a video into frames and hand them on.

use crate::blob_store::BlobStore;
use crate::config::Settings;
use crate::error::PipelineError;
use crate::events::S3EventNotification;
use crate::frame_extractor::{frame_key, FrameExtractor};
use crate::notifier::{Notification, Notifier};
use crate::orchestrator::{Orchestrator, WorkflowInput};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Outcome of one video's extraction run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionReport {
    pub video_key: String,
    pub frames_extracted: usize,
    /// Uploaded frame keys in ordinal order
    pub uploaded: Vec<String>,
    /// Frame keys whose upload failed
    pub failed: Vec<String>,
    /// Downstream workflow execution, if it started
    pub execution: Option<String>,
}

/// Handles video upload events
pub struct FrameExtractionHandler {
    settings: Arc<Settings>,
    store: Arc<dyn BlobStore>,
    extractor: Arc<dyn FrameExtractor>,
    orchestrator: Arc<dyn Orchestrator>,
    notifier: Arc<dyn Notifier>,
}

impl FrameExtractionHandler {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn BlobStore>,
        extractor: Arc<dyn FrameExtractor>,
        orchestrator: Arc<dyn Orchestrator>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            settings,
            store,
            extractor,
            orchestrator,
            notifier,
        }
    }

    /// Process every uploaded video named by the event.
    ///
    /// A fatal error on any video aborts the invocation.
    #[instrument(skip(self, event), fields(records = event.records.len()))]
    pub async fn handle(
        &self,
        event: &S3EventNotification,
    ) -> Result<Vec<ExtractionReport>, PipelineError> {
        let mut reports = Vec::new();

        for object in event.objects() {
            if object.bucket != self.settings.raw_bucket {
                warn!(
                    bucket = %object.bucket,
                    key = %object.key,
                    "Ignoring upload outside the raw bucket"
                );
                continue;
            }
            reports.push(self.process_video(&object.key).await?);
        }

        Ok(reports)
    }

    /// Download, extract, upload, then start the downstream workflow
    #[instrument(skip(self))]
    pub async fn process_video(&self, video_key: &str) -> Result<ExtractionReport, PipelineError> {
        info!("Video upload detected");

        let video = self
            .store
            .fetch(&self.settings.raw_bucket, video_key)
            .await
            .map_err(|e| PipelineError::NothingUsable {
                key: video_key.to_string(),
                reason: e.to_string(),
            })?;

        let frames = self
            .extractor
            .extract(&video, self.settings.frame_rate)
            .await?;
        drop(video);

        if frames.is_empty() {
            return Err(PipelineError::Extraction(
                "extractor returned no frames".to_string(),
            ));
        }

        let frames_extracted = frames.len();
        let (uploaded, failed) = self.upload_frames(video_key, frames).await;

        if uploaded.is_empty() {
            error!(attempted = frames_extracted, "No frame could be uploaded");
            return Err(PipelineError::NothingUsable {
                key: video_key.to_string(),
                reason: format!("0 of {frames_extracted} frames uploaded"),
            });
        }

        if !failed.is_empty() {
            warn!(
                uploaded = uploaded.len(),
                failed = failed.len(),
                "Some frames were not uploaded"
            );
        }

        let execution = self.start_workflow(video_key).await;

        if self.settings.notify_on_extraction {
            let notification = Notification::extraction_complete(video_key, uploaded.len());
            if let Err(e) = self.notifier.publish(&notification).await {
                warn!(error = %e, "Extraction notice not sent");
            }
        }

        info!(
            frames = frames_extracted,
            uploaded = uploaded.len(),
            "Video processed"
        );

        Ok(ExtractionReport {
            video_key: video_key.to_string(),
            frames_extracted,
            uploaded,
            failed,
            execution,
        })
    }

    /// Upload frames concurrently; returns (uploaded, failed) keys, each in
    /// ordinal order
    async fn upload_frames(
        &self,
        video_key: &str,
        frames: Vec<Vec<u8>>,
    ) -> (Vec<String>, Vec<String>) {
        let bucket = self.settings.processed_bucket.as_str();
        let prefix = self.settings.frame_prefix.as_str();
        let store = self.store.clone();

        let mut results: Vec<(usize, String, Result<(), PipelineError>)> =
            stream::iter(frames.into_iter().enumerate())
                .map(move |(index, data)| {
                    let store = store.clone();
                    let key = frame_key(prefix, video_key, index + 1);
                    async move {
                        let result = store.store(bucket, &key, data).await;
                        (index, key, result)
                    }
                })
                .buffer_unordered(self.settings.transfer_concurrency)
                .collect()
                .await;
        results.sort_by_key(|(index, _, _)| *index);

        let mut uploaded = Vec::new();
        let mut failed = Vec::new();
        for (_, key, result) in results {
            match result {
                Ok(()) => {
                    debug!(key = %key, "Uploaded frame");
                    metrics::counter!("crashwatch.frames.uploaded").increment(1);
                    uploaded.push(key);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to upload frame");
                    metrics::counter!("crashwatch.frames.upload_failed").increment(1);
                    failed.push(key);
                }
            }
        }

        (uploaded, failed)
    }

    async fn start_workflow(&self, video_key: &str) -> Option<String> {
        let input = WorkflowInput {
            video_key: video_key.to_string(),
            bucket: self.settings.processed_bucket.clone(),
            min_confidence: self.settings.min_confidence.to_string(),
        };

        match self.orchestrator.start(&input).await {
            Ok(execution) => Some(execution),
            Err(e) => {
                warn!(error = %e, "Workflow not started");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::memory::MemoryBlobStore;
    use crate::config::tests::create_test_config;
    use crate::error::TransferOp;
    use crate::frame_extractor::MockFrameExtractor;
    use crate::notifier::MockNotifier;
    use crate::orchestrator::MockOrchestrator;
    use mockall::predicate::eq;

    const RAW: &str = "raw-videos";
    const PROCESSED: &str = "processed-frames";

    fn settings() -> Arc<Settings> {
        Arc::new(create_test_config().settings().unwrap())
    }

    fn upload_event(bucket: &str, key: &str) -> S3EventNotification {
        let json = serde_json::json!({
            "Records": [{"s3": {"bucket": {"name": bucket}, "object": {"key": key}}}]
        });
        serde_json::from_value(json).unwrap()
    }

    fn extractor_returning(count: usize) -> MockFrameExtractor {
        let mut extractor = MockFrameExtractor::new();
        extractor
            .expect_extract()
            .returning(move |_, _| Ok((1..=count).map(|i| vec![i as u8]).collect()));
        extractor
    }

    fn orchestrator_expecting(video_key: &'static str) -> MockOrchestrator {
        let mut orchestrator = MockOrchestrator::new();
        orchestrator
            .expect_start()
            .with(eq(WorkflowInput {
                video_key: video_key.to_string(),
                bucket: PROCESSED.to_string(),
                min_confidence: "80".to_string(),
            }))
            .times(1)
            .returning(|_| Ok("arn:execution:1".to_string()));
        orchestrator
    }

    fn handler(
        settings: Arc<Settings>,
        store: Arc<MemoryBlobStore>,
        extractor: MockFrameExtractor,
        orchestrator: MockOrchestrator,
        notifier: MockNotifier,
    ) -> FrameExtractionHandler {
        FrameExtractionHandler::new(
            settings,
            store,
            Arc::new(extractor),
            Arc::new(orchestrator),
            Arc::new(notifier),
        )
    }

    #[tokio::test]
    async fn test_frames_uploaded_in_order_and_workflow_started() {
        let store = Arc::new(MemoryBlobStore::new().with_object(RAW, "uploads/clip.mp4", b"video"));
        let handler = handler(
            settings(),
            store.clone(),
            extractor_returning(3),
            orchestrator_expecting("uploads/clip.mp4"),
            MockNotifier::new(),
        );

        let reports = handler
            .handle(&upload_event(RAW, "uploads/clip.mp4"))
            .await
            .unwrap();

        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.frames_extracted, 3);
        assert_eq!(
            report.uploaded,
            vec![
                "frames/clip.mp4/frame_000001.jpg",
                "frames/clip.mp4/frame_000002.jpg",
                "frames/clip.mp4/frame_000003.jpg",
            ]
        );
        assert!(report.failed.is_empty());
        assert_eq!(report.execution.as_deref(), Some("arn:execution:1"));
        assert_eq!(
            store.get(PROCESSED, "frames/clip.mp4/frame_000002.jpg"),
            Some(vec![2])
        );
    }

    #[tokio::test]
    async fn test_partial_upload_failure_is_reported_not_fatal() {
        let store = Arc::new(MemoryBlobStore::new().with_object(RAW, "clip.mp4", b"video"));
        store.fail_on(TransferOp::Store, "frames/clip.mp4/frame_000002.jpg");
        let handler = handler(
            settings(),
            store.clone(),
            extractor_returning(3),
            orchestrator_expecting("clip.mp4"),
            MockNotifier::new(),
        );

        let report = handler.process_video("clip.mp4").await.unwrap();

        assert_eq!(report.uploaded.len(), 2);
        assert_eq!(report.failed, vec!["frames/clip.mp4/frame_000002.jpg"]);
        assert!(store.contains(PROCESSED, "frames/clip.mp4/frame_000003.jpg"));
    }

    #[tokio::test]
    async fn test_zero_uploads_is_fatal_and_skips_workflow() {
        let store = Arc::new(MemoryBlobStore::new().with_object(RAW, "clip.mp4", b"video"));
        store.fail_on(TransferOp::Store, "frames/clip.mp4/frame_000001.jpg");
        store.fail_on(TransferOp::Store, "frames/clip.mp4/frame_000002.jpg");
        let mut orchestrator = MockOrchestrator::new();
        orchestrator.expect_start().never();
        let handler = handler(
            settings(),
            store,
            extractor_returning(2),
            orchestrator,
            MockNotifier::new(),
        );

        let err = handler.process_video("clip.mp4").await.unwrap_err();
        assert!(matches!(err, PipelineError::NothingUsable { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_extraction_error_is_fatal() {
        let store = Arc::new(MemoryBlobStore::new().with_object(RAW, "clip.mp4", b"video"));
        let mut extractor = MockFrameExtractor::new();
        extractor
            .expect_extract()
            .returning(|_, _| Err(PipelineError::Extraction("ffmpeg produced no frames".to_string())));
        let mut orchestrator = MockOrchestrator::new();
        orchestrator.expect_start().never();
        let handler = handler(settings(), store.clone(), extractor, orchestrator, MockNotifier::new());

        let err = handler.process_video("clip.mp4").await.unwrap_err();
        assert!(matches!(err, PipelineError::Extraction(_)));
        assert!(store.calls(TransferOp::Store).is_empty());
    }

    #[tokio::test]
    async fn test_missing_video_is_fatal() {
        let store = Arc::new(MemoryBlobStore::new());
        let mut extractor = MockFrameExtractor::new();
        extractor.expect_extract().never();
        let handler = handler(
            settings(),
            store,
            extractor,
            MockOrchestrator::new(),
            MockNotifier::new(),
        );

        let err = handler.process_video("missing.mp4").await.unwrap_err();
        assert!(matches!(err, PipelineError::NothingUsable { .. }));
    }

    #[tokio::test]
    async fn test_workflow_failure_is_advisory() {
        let store = Arc::new(MemoryBlobStore::new().with_object(RAW, "clip.mp4", b"video"));
        let mut orchestrator = MockOrchestrator::new();
        orchestrator
            .expect_start()
            .returning(|_| Err(PipelineError::Orchestration("AccessDenied".to_string())));
        let handler = handler(
            settings(),
            store,
            extractor_returning(1),
            orchestrator,
            MockNotifier::new(),
        );

        let report = handler.process_video("clip.mp4").await.unwrap();
        assert_eq!(report.uploaded.len(), 1);
        assert_eq!(report.execution, None);
    }

    #[tokio::test]
    async fn test_extraction_notice_when_enabled() {
        let mut config = create_test_config();
        config.notification.notify_on_extraction = true;
        let settings = Arc::new(config.settings().unwrap());

        let store = Arc::new(MemoryBlobStore::new().with_object(RAW, "clip.mp4", b"video"));
        let mut notifier = MockNotifier::new();
        notifier
            .expect_publish()
            .withf(|n| n.body == "Video clip.mp4 processed, 2 frames uploaded.")
            .times(1)
            .returning(|_| Err(PipelineError::Notification("throttled".to_string())));
        let handler = handler(
            settings,
            store,
            extractor_returning(2),
            orchestrator_expecting("clip.mp4"),
            notifier,
        );

        assert!(handler.process_video("clip.mp4").await.is_ok());
    }

    #[tokio::test]
    async fn test_foreign_bucket_ignored() {
        let store = Arc::new(MemoryBlobStore::new());
        let mut extractor = MockFrameExtractor::new();
        extractor.expect_extract().never();
        let handler = handler(
            settings(),
            store.clone(),
            extractor,
            MockOrchestrator::new(),
            MockNotifier::new(),
        );

        let reports = handler
            .handle(&upload_event("someone-else", "clip.mp4"))
            .await
            .unwrap();
        assert!(reports.is_empty());
        assert!(store.calls(TransferOp::Fetch).is_empty());
    }
}
