//! Crashwatch
//!
//! Two-stage pipeline over uploaded traffic video. The first stage splits each
//! uploaded video into still frames and hands them to a downstream workflow.
//! The second stage screens a batch of frames with an image classifier and
//! converges on at most one crash incident per batch: a single evidence frame
//! is kept, subscribers are notified, and every other frame in the batch is
//! deleted.
//!
//! ## Features
//!
//! - **Frame Extraction**: ffmpeg sampling at a configurable frame rate,
//!   concurrent uploads with per-frame failure reporting
//! - **Single-Incident Resolution**: ordered screening with first-match or
//!   highest-confidence selection of the evidence frame
//! - **Explicit Timeout Policy**: a stalled classification either counts as
//!   non-qualifying or aborts the batch
//! - **Best-Effort Cleanup**: idempotent deletion that touches only the batch
//!
//! ## Architecture
//!
//! ```text
//! Kafka Topics              Raw Bucket                Processed Bucket
//! ┌──────────────┐         ┌──────────────┐          ┌──────────────────┐
//! │ Uploads      │────────▶│ {video}      │          │ frames/{video}/  │
//! └──────────────┘         └──────────────┘          │   frame_NNNNNN   │
//!        │                        │                  └──────────────────┘
//!        ▼                        ▼                         ▲     │
//! ┌──────────────┐         ┌──────────────┐                 │     │
//! │ Frame        │────────▶│ ffmpeg       │─────────────────┘     │
//! │ Extraction   │         └──────────────┘                       │
//! └──────────────┘                                                │
//!        │ workflow input                                         ▼
//!        ▼                                                 ┌──────────────┐
//! ┌──────────────┐         ┌──────────────┐               │ Classifier   │
//! │ Frames /     │────────▶│ Crash        │──────────────▶└──────────────┘
//! │ Workflow     │         │ Detection    │
//! └──────────────┘         └──────────────┘
//!                                 │
//!                    ┌────────────┴────────────┐
//!                    ▼                         ▼
//!             ┌──────────────┐          ┌──────────────┐
//!             │ Notifier     │          │ Cleanup      │
//!             └──────────────┘          └──────────────┘
//! ```

pub mod blob_store;
pub mod classifier;
pub mod cleanup;
pub mod config;
pub mod consumer;
pub mod detection;
pub mod error;
pub mod events;
pub mod extraction;
pub mod frame_extractor;
pub mod notifier;
pub mod orchestrator;
pub mod resolver;
pub mod service;

pub use blob_store::{BlobStore, S3BlobStore};
pub use classifier::{ClassificationResult, Classifier, LabelScore, RekognitionClassifier};
pub use cleanup::{CleanupExecutor, CleanupReport};
pub use config::{Config, ConfigError, FrameRate, MinConfidence, Settings};
pub use consumer::{Disposition, RedeliveryTracker, TriggerConsumer, TriggerHandler};
pub use detection::{CrashDetectionHandler, DetectionReport, TimeoutPolicy};
pub use error::{PipelineError, TransferOp};
pub use events::{DetectionTrigger, S3EventNotification};
pub use extraction::{ExtractionReport, FrameExtractionHandler};
pub use frame_extractor::{FfmpegExtractor, FrameExtractor};
pub use notifier::{Notification, Notifier, SnsNotifier};
pub use orchestrator::{Orchestrator, StepFunctionsOrchestrator, WorkflowInput};
pub use resolver::{DetectionPolicy, Incident, IncidentResolver, IncidentResolverBuilder, RetentionPlan};
