use crate::config::StorageConfig;
use crate::error::{PipelineError, TransferOp};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use tracing::{debug, info, instrument};

/// Object storage as the pipeline sees it: whole objects addressed by
/// bucket and key.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch an object's bytes
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Vec<u8>, PipelineError>;

    /// Store an object, replacing any existing one
    async fn store(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), PipelineError>;

    /// Delete an object. Deleting a missing key succeeds.
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), PipelineError>;

    /// List every key under a prefix, in the store's key order
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, PipelineError>;
}

/// S3-backed blob store
pub struct S3BlobStore {
    client: S3Client,
}

impl S3BlobStore {
    /// Create a new S3 blob store from a shared SDK config
    pub fn new(sdk_config: &SdkConfig, config: &StorageConfig) -> Self {
        let mut s3_config_builder = S3ConfigBuilder::from(sdk_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            raw_bucket = %config.raw_bucket,
            processed_bucket = %config.processed_bucket,
            region = %config.region,
            "S3 blob store initialized"
        );

        Self { client }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self))]
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Vec<u8>, PipelineError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                PipelineError::transfer(
                    TransferOp::Fetch,
                    bucket,
                    key,
                    DisplayErrorContext(&e).to_string(),
                )
            })?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| PipelineError::transfer(TransferOp::Fetch, bucket, key, e.to_string()))?;

        let bytes = data.into_bytes().to_vec();
        debug!(size_bytes = bytes.len(), "Object fetched");
        Ok(bytes)
    }

    #[instrument(skip(self, body), fields(size_bytes = body.len()))]
    async fn store(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), PipelineError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type_for(key))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                PipelineError::transfer(
                    TransferOp::Store,
                    bucket,
                    key,
                    DisplayErrorContext(&e).to_string(),
                )
            })?;

        debug!("Object stored");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), PipelineError> {
        match self.client.delete_object().bucket(bucket).key(key).send().await {
            Ok(_) => {
                debug!("Object deleted");
                Ok(())
            }
            Err(e) if e.as_service_error().and_then(|se| se.code()) == Some("NoSuchKey") => {
                debug!("Object already absent");
                Ok(())
            }
            Err(e) => Err(PipelineError::transfer(
                TransferOp::Delete,
                bucket,
                key,
                DisplayErrorContext(&e).to_string(),
            )),
        }
    }

    #[instrument(skip(self))]
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, PipelineError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| {
                    PipelineError::transfer(
                        TransferOp::List,
                        bucket,
                        prefix,
                        DisplayErrorContext(&e).to_string(),
                    )
                })?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(String::from)),
            );

            match response.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        debug!(count = keys.len(), "Listed objects");
        Ok(keys)
    }
}

/// Content type from the key's extension
fn content_type_for(key: &str) -> &'static str {
    let extension = key.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();
    match extension.to_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

/// In-memory store used by handler tests
#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct MemoryBlobStore {
        objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
        failing: Mutex<HashSet<(TransferOp, String)>>,
        calls: Mutex<Vec<(TransferOp, String)>>,
    }

    impl MemoryBlobStore {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn with_object(self, bucket: &str, key: &str, body: &[u8]) -> Self {
            self.objects
                .lock()
                .unwrap()
                .insert((bucket.to_string(), key.to_string()), body.to_vec());
            self
        }

        /// Make every `op` on `key` fail from now on
        pub(crate) fn fail_on(&self, op: TransferOp, key: &str) {
            self.failing.lock().unwrap().insert((op, key.to_string()));
        }

        pub(crate) fn contains(&self, bucket: &str, key: &str) -> bool {
            self.objects
                .lock()
                .unwrap()
                .contains_key(&(bucket.to_string(), key.to_string()))
        }

        pub(crate) fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
            self.objects
                .lock()
                .unwrap()
                .get(&(bucket.to_string(), key.to_string()))
                .cloned()
        }

        pub(crate) fn keys(&self, bucket: &str) -> Vec<String> {
            self.objects
                .lock()
                .unwrap()
                .keys()
                .filter(|(b, _)| b == bucket)
                .map(|(_, k)| k.clone())
                .collect()
        }

        /// Keys passed to `op`, in call order
        pub(crate) fn calls(&self, op: TransferOp) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(o, _)| *o == op)
                .map(|(_, k)| k.clone())
                .collect()
        }

        fn record(&self, op: TransferOp, bucket: &str, key: &str) -> Result<(), PipelineError> {
            self.calls.lock().unwrap().push((op, key.to_string()));
            if self.failing.lock().unwrap().contains(&(op, key.to_string())) {
                return Err(PipelineError::transfer(op, bucket, key, "injected failure"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl BlobStore for MemoryBlobStore {
        async fn fetch(&self, bucket: &str, key: &str) -> Result<Vec<u8>, PipelineError> {
            self.record(TransferOp::Fetch, bucket, key)?;
            self.get(bucket, key).ok_or_else(|| {
                PipelineError::transfer(TransferOp::Fetch, bucket, key, "NoSuchKey")
            })
        }

        async fn store(
            &self,
            bucket: &str,
            key: &str,
            body: Vec<u8>,
        ) -> Result<(), PipelineError> {
            self.record(TransferOp::Store, bucket, key)?;
            self.objects
                .lock()
                .unwrap()
                .insert((bucket.to_string(), key.to_string()), body);
            Ok(())
        }

        async fn delete(&self, bucket: &str, key: &str) -> Result<(), PipelineError> {
            self.record(TransferOp::Delete, bucket, key)?;
            self.objects
                .lock()
                .unwrap()
                .remove(&(bucket.to_string(), key.to_string()));
            Ok(())
        }

        async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, PipelineError> {
            self.record(TransferOp::List, bucket, prefix)?;
            Ok(self
                .keys(bucket)
                .into_iter()
                .filter(|k| k.starts_with(prefix))
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryBlobStore;
    use super::*;

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("frames/clip.mp4/frame_000001.jpg"), "image/jpeg");
        assert_eq!(content_type_for("frames/a.JPEG"), "image/jpeg");
        assert_eq!(content_type_for("raw/clip.mp4"), "video/mp4");
        assert_eq!(content_type_for("raw/noextension"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_memory_store_delete_missing_is_noop() {
        let store = MemoryBlobStore::new().with_object("b", "frames/a.jpg", b"a");

        store.delete("b", "frames/a.jpg").await.unwrap();
        store.delete("b", "frames/a.jpg").await.unwrap();

        assert!(!store.contains("b", "frames/a.jpg"));
        assert_eq!(store.calls(TransferOp::Delete).len(), 2);
    }

    #[tokio::test]
    async fn test_memory_store_list_prefix() {
        let store = MemoryBlobStore::new()
            .with_object("b", "frames/clip.mp4/frame_000002.jpg", b"2")
            .with_object("b", "frames/clip.mp4/frame_000001.jpg", b"1")
            .with_object("b", "frames/other.mp4/frame_000001.jpg", b"x")
            .with_object("c", "frames/clip.mp4/frame_000003.jpg", b"3");

        let keys = store.list("b", "frames/clip.mp4/").await.unwrap();
        assert_eq!(
            keys,
            vec![
                "frames/clip.mp4/frame_000001.jpg".to_string(),
                "frames/clip.mp4/frame_000002.jpg".to_string(),
            ]
        );
    }
}
