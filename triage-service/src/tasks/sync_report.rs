use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};
use triage_flow::{Context, GraphError, NextAction, Result, Task, TaskResult};

use super::{load_pipeline, prompts, stage_output};
use crate::clients::InferenceModel;

/// Stage 3, sync mode: the whole report in one completion
pub struct SyncReportTask {
    model: Arc<dyn InferenceModel>,
}

impl SyncReportTask {
    pub fn new(model: Arc<dyn InferenceModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Task for SyncReportTask {
    async fn run(&self, context: Context) -> Result<TaskResult> {
        let pipeline = load_pipeline(&context).await?;
        let prompt = prompts::final_report_prompt(
            &pipeline.request.patient_text,
            stage_output(&pipeline.description_block, "Description")?,
            stage_output(&pipeline.retrieved_context, "Retrieved context")?,
            &pipeline.request.department,
        );

        let report = self.model.complete(&prompt).await.map_err(|e| {
            error!("Report generation failed: {}", e);
            GraphError::TaskExecutionFailed(format!("Report generation failed: {e}"))
        })?;

        info!(chars = report.chars().count(), "Final report generated");
        Ok(TaskResult::new_with_status(
            Some(report),
            NextAction::End,
            Some("Final report generated".to_string()),
        ))
    }
}
