use crate::error::PipelineError;
use crate::resolver::Incident;
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sns::error::DisplayErrorContext;
use aws_sdk_sns::Client as SnsClient;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

/// Subject line of incident notifications
pub const INCIDENT_SUBJECT: &str = "Car Crash Detected";

/// Largest message body SNS accepts
pub const MAX_MESSAGE_BYTES: usize = 256 * 1024;

/// Body of an incident notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentMessage {
    /// Bucket holding the evidence frame
    pub bucket: String,
    /// Evidence frame key
    pub key: String,
    /// Evidence frame bytes
    #[serde(with = "base64_serde")]
    pub image_base64: Vec<u8>,
    /// Video the frame was extracted from, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_key: Option<String>,
    /// Human-readable summary
    pub summary: String,
}

/// Base64 serialization helper
mod base64_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// A message ready to publish
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
}

impl Notification {
    /// Incident notification carrying the evidence frame inline
    pub fn incident(
        bucket: &str,
        incident: &Incident,
        image: Vec<u8>,
    ) -> Result<Self, PipelineError> {
        let summary = format!(
            "Crash detected in {} ({} {:.1}%) at {}",
            incident.evidence_key,
            incident.label,
            incident.confidence,
            incident.detected_at.to_rfc3339()
        );

        let message = IncidentMessage {
            bucket: bucket.to_string(),
            key: incident.evidence_key.clone(),
            image_base64: image,
            source_key: incident.source_key.clone(),
            summary,
        };

        let body = serde_json::to_string(&message)
            .map_err(|e| PipelineError::Notification(format!("failed to encode message: {e}")))?;

        if body.len() > MAX_MESSAGE_BYTES {
            return Err(PipelineError::NotificationTooLarge {
                size: body.len(),
                limit: MAX_MESSAGE_BYTES,
            });
        }

        Ok(Self {
            subject: INCIDENT_SUBJECT.to_string(),
            body,
        })
    }

    /// Plain-text notice that a video was split into frames
    pub fn extraction_complete(video_key: &str, frames_uploaded: usize) -> Self {
        Self {
            subject: "Video Processed".to_string(),
            body: format!("Video {video_key} processed, {frames_uploaded} frames uploaded."),
        }
    }
}

/// Publishes messages to subscribers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, notification: &Notification) -> Result<(), PipelineError>;
}

/// Notifier publishing to an SNS topic
pub struct SnsNotifier {
    client: SnsClient,
    topic_arn: String,
}

impl SnsNotifier {
    pub fn new(sdk_config: &SdkConfig, topic_arn: impl Into<String>) -> Self {
        let topic_arn = topic_arn.into();
        info!(topic_arn = %topic_arn, "SNS notifier initialized");

        Self {
            client: SnsClient::new(sdk_config),
            topic_arn,
        }
    }
}

#[async_trait]
impl Notifier for SnsNotifier {
    #[instrument(skip(self, notification), fields(subject = %notification.subject))]
    async fn publish(&self, notification: &Notification) -> Result<(), PipelineError> {
        let response = self
            .client
            .publish()
            .topic_arn(&self.topic_arn)
            .subject(&notification.subject)
            .message(&notification.body)
            .send()
            .await
            .map_err(|e| PipelineError::Notification(DisplayErrorContext(&e).to_string()))?;

        info!(message_id = ?response.message_id(), "Notification published");
        Ok(())
    }
}
