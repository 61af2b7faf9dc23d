use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};
use triage_flow::{Context, GraphError, NextAction, Result, Task, TaskResult};

use super::{IMAGE_KEY, PIPELINE_KEY, load_pipeline, prompts};
use crate::clients::InferenceModel;

/// Stage 1: multimodal description of the patient text and optional image
pub struct DescribeTask {
    model: Arc<dyn InferenceModel>,
}

impl DescribeTask {
    pub fn new(model: Arc<dyn InferenceModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Task for DescribeTask {
    async fn run(&self, context: Context) -> Result<TaskResult> {
        let mut pipeline = load_pipeline(&context).await?;
        let request = &pipeline.request;
        let image = context.attachment(IMAGE_KEY);

        info!(
            department = %request.department,
            image_bytes = image.as_ref().map_or(0, |i| i.len()),
            "Generating multimodal description"
        );

        let prompt = prompts::description_prompt(&request.patient_text, image.is_some());
        let description = self
            .model
            .describe_image(&prompt, image.as_deref())
            .await
            .map_err(|e| {
                error!("Description stage failed: {}", e);
                GraphError::TaskExecutionFailed(format!("Description generation failed: {e}"))
            })?;

        info!(chars = description.chars().count(), "Description generated");
        pipeline.description_block = Some(description);
        context.set(PIPELINE_KEY, pipeline).await;

        Ok(TaskResult::new_with_status(
            None,
            NextAction::Continue,
            Some("Patient description generated".to_string()),
        ))
    }
}
