use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};
use triage_flow::{Context, GraphError, NextAction, Result, Task, TaskResult};

use super::{PIPELINE_KEY, load_pipeline, prompts, stage_output};
use crate::clients::{InferenceModel, Retriever};

/// Separator placed between retrieved passages
pub const PASSAGE_SEPARATOR: &str = "\n---\n";

/// Stage 2: derive search keywords from the description and fetch supporting passages
pub struct RetrieveTask {
    model: Arc<dyn InferenceModel>,
    retriever: Arc<dyn Retriever>,
    top_k: usize,
}

impl RetrieveTask {
    pub fn new(model: Arc<dyn InferenceModel>, retriever: Arc<dyn Retriever>, top_k: usize) -> Self {
        Self {
            model,
            retriever,
            top_k,
        }
    }
}

#[async_trait]
impl Task for RetrieveTask {
    async fn run(&self, context: Context) -> Result<TaskResult> {
        let mut pipeline = load_pipeline(&context).await?;
        let description = stage_output(&pipeline.description_block, "Description")?;

        let keywords = self
            .model
            .complete(&prompts::keyword_prompt(description))
            .await
            .map_err(|e| {
                error!("Keyword extraction failed: {}", e);
                GraphError::TaskExecutionFailed(format!("Keyword extraction failed: {e}"))
            })?;
        let keywords = keywords.trim();
        info!(%keywords, top_k = self.top_k, "Searching knowledge base");

        let passages = self
            .retriever
            .retrieve(keywords, self.top_k)
            .await
            .map_err(|e| {
                error!("Retrieval failed: {}", e);
                GraphError::TaskExecutionFailed(format!("Context retrieval failed: {e}"))
            })?;

        info!(passages = passages.len(), "Context retrieved");
        pipeline.retrieved_context = Some(passages.join(PASSAGE_SEPARATOR));
        context.set(PIPELINE_KEY, pipeline).await;

        Ok(TaskResult::new(None, NextAction::Continue))
    }
}
