//! Error taxonomy shared by both pipeline stages.
//!
//! Whether an error aborts the current invocation is decided here, once,
//! by [`PipelineError::is_fatal`]. Call sites never make that choice.

use crate::config::ConfigError;
use std::fmt;
use thiserror::Error;

/// Object storage operation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferOp {
    Fetch,
    Store,
    Delete,
    List,
}

impl fmt::Display for TransferOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            TransferOp::Fetch => "fetch",
            TransferOp::Store => "store",
            TransferOp::Delete => "delete",
            TransferOp::List => "list",
        };
        f.write_str(op)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("Failed to {op} {bucket}/{key}: {message}")]
    Transfer {
        op: TransferOp,
        bucket: String,
        key: String,
        message: String,
    },

    /// Transfer failures left nothing to work with for this object.
    #[error("No usable output for {key}: {reason}")]
    NothingUsable { key: String, reason: String },

    #[error("Frame extraction failed: {0}")]
    Extraction(String),

    #[error("Classification of {key} failed: {message}")]
    Classification { key: String, message: String },

    /// A classification failure escalated under the fail-closed policy.
    #[error("Batch aborted, classification of {key} failed: {message}")]
    ClassificationAborted { key: String, message: String },

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Notification payload too large: {size} bytes exceeds the {limit} byte limit")]
    NotificationTooLarge { size: usize, limit: usize },

    #[error("Failed to start workflow: {0}")]
    Orchestration(String),

    #[error("Malformed trigger event: {0}")]
    MalformedEvent(String),
}

impl PipelineError {
    /// Fatal errors abort the invocation and surface to the trigger for
    /// redelivery. Advisory errors are logged and the batch continues.
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::Configuration(_)
            | PipelineError::NothingUsable { .. }
            | PipelineError::Extraction(_)
            | PipelineError::ClassificationAborted { .. }
            | PipelineError::MalformedEvent(_) => true,
            PipelineError::Transfer { .. }
            | PipelineError::Classification { .. }
            | PipelineError::Notification(_)
            | PipelineError::NotificationTooLarge { .. }
            | PipelineError::Orchestration(_) => false,
        }
    }

    pub(crate) fn transfer(
        op: TransferOp,
        bucket: &str,
        key: &str,
        message: impl Into<String>,
    ) -> Self {
        PipelineError::Transfer {
            op,
            bucket: bucket.to_string(),
            key: key.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let config = PipelineError::from(ConfigError::MissingField("x".to_string()));
        assert!(config.is_fatal());
        assert!(PipelineError::Extraction("ffmpeg exited 1".to_string()).is_fatal());
        assert!(PipelineError::NothingUsable {
            key: "raw/clip.mp4".to_string(),
            reason: "0 of 3 frames uploaded".to_string(),
        }
        .is_fatal());
        assert!(PipelineError::ClassificationAborted {
            key: "frames/a".to_string(),
            message: "timed out".to_string(),
        }
        .is_fatal());
    }

    #[test]
    fn test_advisory_classification() {
        assert!(!PipelineError::transfer(TransferOp::Delete, "b", "k", "boom").is_fatal());
        assert!(!PipelineError::Classification {
            key: "frames/a".to_string(),
            message: "throttled".to_string(),
        }
        .is_fatal());
        assert!(!PipelineError::Notification("denied".to_string()).is_fatal());
        assert!(!PipelineError::NotificationTooLarge { size: 300_000, limit: 262_144 }.is_fatal());
        assert!(!PipelineError::Orchestration("denied".to_string()).is_fatal());
    }

    #[test]
    fn test_transfer_display() {
        let err = PipelineError::transfer(TransferOp::Store, "frames-bucket", "frames/a.jpg", "503");
        assert_eq!(
            err.to_string(),
            "Failed to store frames-bucket/frames/a.jpg: 503"
        );
    }
}
