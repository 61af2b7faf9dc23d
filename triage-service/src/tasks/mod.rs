pub mod describe;
pub mod prompts;
pub mod retrieve;
pub mod stream_report;
pub mod sync_report;

pub use describe::DescribeTask;
pub use retrieve::RetrieveTask;
pub use stream_report::StreamReportTask;
pub use sync_report::SyncReportTask;

use triage_flow::{Context, GraphError};

use crate::models::PipelineContext;

/// Context key holding the [`PipelineContext`] of the running request
pub const PIPELINE_KEY: &str = "pipeline";
/// Attachment key holding the request's raw image bytes, when present
pub const IMAGE_KEY: &str = "image";
/// Context key holding the request's streaming flag, read by the stage-3 branch
pub const STREAM_REQUESTED_KEY: &str = "stream_requested";

pub(crate) async fn load_pipeline(context: &Context) -> triage_flow::Result<PipelineContext> {
    context
        .get(PIPELINE_KEY)
        .await
        .ok_or_else(|| GraphError::ContextError("Pipeline context not found".to_string()))
}

pub(crate) fn stage_output<'a>(value: &'a Option<String>, name: &str) -> triage_flow::Result<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| GraphError::ContextError(format!("{name} not found in pipeline context")))
}
