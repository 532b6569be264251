use crate::config::MinConfidence;
use crate::error::PipelineError;
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_rekognition::error::DisplayErrorContext;
use aws_sdk_rekognition::primitives::Blob;
use aws_sdk_rekognition::types::Image;
use aws_sdk_rekognition::Client as RekognitionClient;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

/// One label predicted for an image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelScore {
    /// Label name as reported by the model
    pub name: String,
    /// Confidence on a 0-100 scale
    pub confidence: f32,
}

impl LabelScore {
    pub fn new(name: impl Into<String>, confidence: f32) -> Self {
        Self {
            name: name.into(),
            confidence,
        }
    }
}

/// Predictions for a single frame. Produced once, never mutated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub labels: Vec<LabelScore>,
}

impl ClassificationResult {
    pub fn new(labels: Vec<LabelScore>) -> Self {
        Self { labels }
    }

    /// Result carrying no labels, i.e. a non-qualifying frame
    pub fn empty() -> Self {
        Self::default()
    }

    /// Highest confidence among labels named `label` (case-insensitive)
    /// that reach `min_confidence`
    pub fn qualifying_confidence(&self, label: &str, min_confidence: MinConfidence) -> Option<f32> {
        self.labels
            .iter()
            .filter(|l| l.name.eq_ignore_ascii_case(label))
            .filter(|l| l.confidence >= min_confidence.get())
            .map(|l| l.confidence)
            .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }
}

/// Image classifier returning labels at or above a confidence floor.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify the image stored under `key`
    async fn classify(
        &self,
        key: &str,
        image: &[u8],
        min_confidence: MinConfidence,
    ) -> Result<ClassificationResult, PipelineError>;
}

/// Classifier backed by a Rekognition Custom Labels model version
pub struct RekognitionClassifier {
    client: RekognitionClient,
    model_arn: String,
}

impl RekognitionClassifier {
    pub fn new(sdk_config: &SdkConfig, model_arn: impl Into<String>) -> Self {
        let model_arn = model_arn.into();
        info!(model_arn = %model_arn, "Rekognition classifier initialized");

        Self {
            client: RekognitionClient::new(sdk_config),
            model_arn,
        }
    }
}

#[async_trait]
impl Classifier for RekognitionClassifier {
    #[instrument(skip(self, image), fields(size_bytes = image.len()))]
    async fn classify(
        &self,
        key: &str,
        image: &[u8],
        min_confidence: MinConfidence,
    ) -> Result<ClassificationResult, PipelineError> {
        let response = self
            .client
            .detect_custom_labels()
            .project_version_arn(&self.model_arn)
            .image(Image::builder().bytes(Blob::new(image)).build())
            .min_confidence(min_confidence.get())
            .send()
            .await
            .map_err(|e| PipelineError::Classification {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        let labels: Vec<LabelScore> = response
            .custom_labels()
            .iter()
            .filter_map(|label| match (label.name(), label.confidence()) {
                (Some(name), Some(confidence)) => Some(LabelScore::new(name, confidence)),
                _ => None,
            })
            .collect();

        debug!(labels = labels.len(), "Frame classified");
        Ok(ClassificationResult::new(labels))
    }
}
