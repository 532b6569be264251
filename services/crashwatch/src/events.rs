use crate::error::PipelineError;
use crate::orchestrator::WorkflowInput;
use serde::Deserialize;
use std::collections::HashSet;

/// S3 event notification as delivered by the bucket. Only the fields the
/// pipeline reads are modelled; the rest of each record is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct S3EventNotification {
    #[serde(rename = "Records")]
    pub records: Vec<S3EventRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3EventRecord {
    pub s3: S3Entity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Entity {
    pub bucket: S3Bucket,
    pub object: S3Object,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Bucket {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Object {
    /// URL-form encoded object key
    pub key: String,
}

/// A decoded (bucket, key) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl S3EventNotification {
    pub fn from_slice(payload: &[u8]) -> Result<Self, PipelineError> {
        serde_json::from_slice(payload).map_err(|e| PipelineError::MalformedEvent(e.to_string()))
    }

    /// Decoded objects in record order, each listed once
    pub fn objects(&self) -> Vec<ObjectRef> {
        let mut seen = HashSet::new();
        self.records
            .iter()
            .map(|record| ObjectRef {
                bucket: record.s3.bucket.name.clone(),
                key: decode_object_key(&record.s3.object.key),
            })
            .filter(|object| seen.insert(object.clone()))
            .collect()
    }
}

/// What the crash detector is asked to screen
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DetectionTrigger {
    /// Every frame of one video, named by the workflow payload
    Workflow(WorkflowInput),
    /// The frames named by a storage event
    Frames(S3EventNotification),
}

impl DetectionTrigger {
    pub fn from_slice(payload: &[u8]) -> Result<Self, PipelineError> {
        serde_json::from_slice(payload).map_err(|_| {
            PipelineError::MalformedEvent(
                "payload is neither a storage event nor a workflow input".to_string(),
            )
        })
    }
}

/// Decode an event object key: `+` is a space and `%XX` an escaped byte.
/// Malformed escapes are kept literally.
pub fn decode_object_key(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                decoded.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        decoded.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        decoded.push(b'%');
                        i += 1;
                    }
                }
            }
            byte => {
                decoded.push(byte);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
