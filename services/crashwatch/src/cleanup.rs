use crate::blob_store::BlobStore;
use crate::resolver::RetentionPlan;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Outcome of executing a retention plan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    /// Keys confirmed absent after cleanup
    pub deleted: Vec<String>,
    /// Keys that could not be deleted, with the reason
    pub failed: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Best-effort deletion of the frames a retention plan discards.
///
/// Deletions are independent: one failure never stops the others, and only
/// keys named by the plan are touched. The report lists keys in plan order.
pub struct CleanupExecutor {
    store: Arc<dyn BlobStore>,
    concurrency: usize,
}

impl CleanupExecutor {
    pub fn new(store: Arc<dyn BlobStore>, concurrency: usize) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
        }
    }

    #[instrument(skip(self, plan), fields(to_delete = plan.delete.len()))]
    pub async fn execute(&self, bucket: &str, plan: &RetentionPlan) -> CleanupReport {
        let mut report = CleanupReport::default();
        if plan.delete.is_empty() {
            return report;
        }

        let store = self.store.clone();
        let results: Vec<_> = stream::iter(plan.delete.iter().cloned())
            .map(move |key| {
                let store = store.clone();
                async move {
                    let result = store.delete(bucket, &key).await;
                    (key, result)
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        for (key, result) in results {
            match result {
                Ok(()) => {
                    metrics::counter!("crashwatch.frames.deleted").increment(1);
                    report.deleted.push(key);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to delete frame");
                    metrics::counter!("crashwatch.cleanup.failed").increment(1);
                    report.failed.push((key, e.to_string()));
                }
            }
        }

        info!(
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            kept = ?plan.keep,
            "Cleanup finished"
        );

        report
    }
}
