//! Converges per-frame classification results into at most one incident.
//!
//! The resolver walks a batch in its given order and yields every
//! qualifying candidate lazily; the [`DetectionPolicy`] only decides which
//! candidate wins. Under `FirstMatch` the walk stops at the first one.

use crate::classifier::ClassificationResult;
use crate::config::MinConfidence;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, trace};

/// Which qualifying frame becomes the evidence frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionPolicy {
    /// Earliest qualifying frame in batch order
    #[default]
    FirstMatch,
    /// Qualifying frame with the highest matching confidence; ties go to
    /// the earliest frame
    HighestConfidence,
}

/// A frame's classification within a batch
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutcome {
    pub key: String,
    pub result: ClassificationResult,
}

impl FrameOutcome {
    pub fn new(key: impl Into<String>, result: ClassificationResult) -> Self {
        Self {
            key: key.into(),
            result,
        }
    }
}

/// A detected crash. At most one exists per batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Incident {
    /// Key of the retained evidence frame
    pub evidence_key: String,
    /// Position of the evidence frame within the batch
    pub position: usize,
    /// Label that matched
    pub label: String,
    /// Matching confidence of the evidence frame
    pub confidence: f32,
    /// Video the batch was extracted from, when known
    pub source_key: Option<String>,
    /// When the batch was resolved
    pub detected_at: DateTime<Utc>,
}

impl Incident {
    pub fn with_source_key(mut self, source_key: Option<&str>) -> Self {
        self.source_key = source_key.map(String::from);
        self
    }
}

/// Keys to keep and keys to delete after resolution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetentionPlan {
    pub keep: Option<String>,
    pub delete: Vec<String>,
}

impl RetentionPlan {
    pub fn is_empty(&self) -> bool {
        self.keep.is_none() && self.delete.is_empty()
    }
}

struct Candidate {
    position: usize,
    confidence: f32,
}

/// Decides whether a batch contains an incident
#[derive(Debug, Clone)]
pub struct IncidentResolver {
    label_name: String,
    min_confidence: MinConfidence,
    policy: DetectionPolicy,
}

impl IncidentResolver {
    pub fn new(
        label_name: impl Into<String>,
        min_confidence: MinConfidence,
        policy: DetectionPolicy,
    ) -> Self {
        Self {
            label_name: label_name.into(),
            min_confidence,
            policy,
        }
    }

    /// Find the batch's incident, if any
    pub fn resolve(&self, batch: &[FrameOutcome]) -> Option<Incident> {
        let mut candidates = batch.iter().enumerate().filter_map(|(position, frame)| {
            trace!(key = %frame.key, position, "Screening frame");
            frame
                .result
                .qualifying_confidence(&self.label_name, self.min_confidence)
                .map(|confidence| Candidate {
                    position,
                    confidence,
                })
        });

        let winner = match self.policy {
            DetectionPolicy::FirstMatch => candidates.next(),
            DetectionPolicy::HighestConfidence => {
                candidates.fold(None, |best: Option<Candidate>, candidate| match best {
                    Some(b) if b.confidence >= candidate.confidence => Some(b),
                    _ => Some(candidate),
                })
            }
        }?;

        let evidence = &batch[winner.position];
        debug!(
            evidence_key = %evidence.key,
            position = winner.position,
            confidence = winner.confidence,
            policy = ?self.policy,
            "Incident resolved"
        );

        Some(Incident {
            evidence_key: evidence.key.clone(),
            position: winner.position,
            label: self.label_name.clone(),
            confidence: winner.confidence,
            source_key: None,
            detected_at: Utc::now(),
        })
    }

    /// Keep the evidence frame, delete every other key in the batch once.
    /// Without an incident nothing is planned.
    pub fn plan_retention(batch: &[FrameOutcome], incident: Option<&Incident>) -> RetentionPlan {
        let Some(incident) = incident else {
            return RetentionPlan::default();
        };

        let mut seen = HashSet::new();
        let delete = batch
            .iter()
            .map(|frame| frame.key.as_str())
            .filter(|key| *key != incident.evidence_key)
            .filter(|key| seen.insert(*key))
            .map(String::from)
            .collect();

        RetentionPlan {
            keep: Some(incident.evidence_key.clone()),
            delete,
        }
    }
}

/// Builder for creating an IncidentResolver with custom settings
pub struct IncidentResolverBuilder {
    label_name: String,
    min_confidence: MinConfidence,
    policy: DetectionPolicy,
}

impl IncidentResolverBuilder {
    pub fn new() -> Self {
        Self {
            label_name: "carcrash".to_string(),
            min_confidence: MinConfidence::default(),
            policy: DetectionPolicy::FirstMatch,
        }
    }

    pub fn label_name(mut self, label_name: impl Into<String>) -> Self {
        self.label_name = label_name.into();
        self
    }

    pub fn min_confidence(mut self, min_confidence: MinConfidence) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn policy(mut self, policy: DetectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> IncidentResolver {
        IncidentResolver::new(self.label_name, self.min_confidence, self.policy)
    }
}

impl Default for IncidentResolverBuilder {
    fn default() -> Self {
        Self::new()
    }
}
