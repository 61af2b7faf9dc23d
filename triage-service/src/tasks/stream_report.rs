use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};
use triage_flow::{Context, GraphError, NextAction, Result, Task, TaskResult};

use super::{load_pipeline, prompts, stage_output};
use crate::clients::InferenceModel;

/// Stage 3, streaming mode: forwards model deltas into the context's delta sink.
///
/// The task ends when the model reports completion; the end-of-stream marker
/// is emitted by the caller once the graph has returned.
pub struct StreamReportTask {
    model: Arc<dyn InferenceModel>,
}

impl StreamReportTask {
    pub fn new(model: Arc<dyn InferenceModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Task for StreamReportTask {
    async fn run(&self, context: Context) -> Result<TaskResult> {
        let deltas = context
            .delta_sink()
            .ok_or_else(|| GraphError::ContextError("No delta sink attached for streaming".to_string()))?;

        let pipeline = load_pipeline(&context).await?;
        let prompt = prompts::final_report_prompt(
            &pipeline.request.patient_text,
            stage_output(&pipeline.description_block, "Description")?,
            stage_output(&pipeline.retrieved_context, "Retrieved context")?,
            &pipeline.request.department,
        );

        info!(department = %pipeline.request.department, "Streaming final report");
        self.model
            .complete_stream(&prompt, deltas)
            .await
            .map_err(|e| {
                error!("Report stream failed: {}", e);
                GraphError::TaskExecutionFailed(format!("Report streaming failed: {e}"))
            })?;

        Ok(TaskResult::new_with_status(
            None,
            NextAction::End,
            Some("Final report streamed".to_string()),
        ))
    }
}
