use crate::error::PipelineError;
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sfn::error::DisplayErrorContext;
use aws_sdk_sfn::Client as SfnClient;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

/// Payload handed to the downstream workflow once a video's frames exist.
///
/// Every field is a string on the wire, threshold included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInput {
    pub video_key: String,
    pub bucket: String,
    pub min_confidence: String,
}

/// Starts the downstream workflow
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Start one execution, returning its identifier
    async fn start(&self, input: &WorkflowInput) -> Result<String, PipelineError>;
}

/// Orchestrator starting Step Functions executions
pub struct StepFunctionsOrchestrator {
    client: SfnClient,
    state_machine_arn: String,
}

impl StepFunctionsOrchestrator {
    pub fn new(sdk_config: &SdkConfig, state_machine_arn: impl Into<String>) -> Self {
        let state_machine_arn = state_machine_arn.into();
        info!(state_machine_arn = %state_machine_arn, "Step Functions orchestrator initialized");

        Self {
            client: SfnClient::new(sdk_config),
            state_machine_arn,
        }
    }
}

#[async_trait]
impl Orchestrator for StepFunctionsOrchestrator {
    #[instrument(skip(self, input), fields(video_key = %input.video_key))]
    async fn start(&self, input: &WorkflowInput) -> Result<String, PipelineError> {
        let payload = serde_json::to_string(input)
            .map_err(|e| PipelineError::Orchestration(format!("failed to encode input: {e}")))?;

        let response = self
            .client
            .start_execution()
            .state_machine_arn(&self.state_machine_arn)
            .name(Uuid::new_v4().to_string())
            .input(payload)
            .send()
            .await
            .map_err(|e| PipelineError::Orchestration(DisplayErrorContext(&e).to_string()))?;

        let execution_arn = response.execution_arn().to_string();
        info!(execution_arn = %execution_arn, "Workflow execution started");
        Ok(execution_arn)
    }
}
