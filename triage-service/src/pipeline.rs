//! Pipeline coordinator.
//!
//! Runs the pre-flight checks, then drives the three-stage task graph for one
//! request. Both entry points always resolve to an [`AnalysisOutcome`]; no
//! error escapes past this module.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use triage_flow::{Context, Graph, GraphBuilder, Task};

use crate::clients::{InferenceModel, Retriever};
use crate::department::DepartmentValidator;
use crate::fallback::{ReportVerdict, classify_report, outcome_for_error};
use crate::models::{AnalysisOutcome, AnalysisRequest, PipelineContext, StreamFragment};
use crate::report_parser::parse_report;
use crate::tasks::{
    DescribeTask, IMAGE_KEY, PIPELINE_KEY, RetrieveTask, STREAM_REQUESTED_KEY, StreamReportTask, SyncReportTask,
};

pub const DEFAULT_TOP_K: usize = 5;

/// Buffer between the streaming task and the forwarding loop
const DELTA_BUFFER: usize = 64;

/// Process-wide collaborators, built once at startup.
///
/// A `None` slot means that subsystem failed to initialise; the pipeline then
/// reports itself unready and answers every request with `ServiceUnavailable`.
#[derive(Clone)]
pub struct Services {
    pub model: Option<Arc<dyn InferenceModel>>,
    pub retriever: Option<Arc<dyn Retriever>>,
    pub top_k: usize,
}

impl Services {
    pub fn new(model: Arc<dyn InferenceModel>, retriever: Arc<dyn Retriever>) -> Self {
        Self {
            model: Some(model),
            retriever: Some(retriever),
            top_k: DEFAULT_TOP_K,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            model: None,
            retriever: None,
            top_k: DEFAULT_TOP_K,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }
}

pub struct Pipeline {
    graph: Option<Graph>,
    validator: DepartmentValidator,
}

impl Pipeline {
    pub fn new(services: Services, validator: DepartmentValidator) -> Self {
        let graph = match (services.model, services.retriever) {
            (Some(model), Some(retriever)) => Some(build_analysis_graph(model, retriever, services.top_k)),
            _ => {
                warn!("Analysis services incomplete, pipeline will report unavailable");
                None
            }
        };
        Self { graph, validator }
    }

    pub fn is_ready(&self) -> bool {
        self.graph.is_some()
    }

    pub fn validator(&self) -> &DepartmentValidator {
        &self.validator
    }

    /// Sync mode: run all three stages and classify the final report.
    pub async fn analyze(&self, request: AnalysisRequest, cancel: CancellationToken) -> AnalysisOutcome {
        let graph = match self.preflight(&request) {
            Ok(graph) => graph,
            Err(outcome) => return outcome,
        };
        let department = request.department.clone();

        let context = self.context_for(request, false).with_cancellation(cancel);
        let result = match graph.execute(context).await {
            Ok(result) => result,
            Err(e) => return outcome_for_error(&e),
        };
        debug!(visited = ?result.visited, "Analysis graph finished");

        let report = result.response.unwrap_or_default();
        match classify_report(&report) {
            ReportVerdict::DepartmentRejected => {
                info!(%department, chars = report.chars().count(), "Report rejected the chosen department");
                AnalysisOutcome::DepartmentError { raw_text: report }
            }
            ReportVerdict::Plausible => {
                let parsed = parse_report(&report, &department);
                info!(
                    %department,
                    risk_level = %parsed.key_info.risk_level,
                    is_department_match = parsed.is_department_match,
                    "Analysis completed"
                );
                AnalysisOutcome::Success {
                    report,
                    key_info: parsed.key_info,
                    is_department_match: parsed.is_department_match,
                }
            }
        }
    }

    /// Stream mode: forward report deltas into `fragments` as they arrive.
    ///
    /// On success the last fragment sent is [`StreamFragment::end`]. On
    /// failure no end fragment is sent and the outcome describing the failure
    /// is returned instead. Dropping the receiver cancels the run.
    pub async fn analyze_stream(
        &self,
        request: AnalysisRequest,
        fragments: mpsc::Sender<StreamFragment>,
        cancel: CancellationToken,
    ) -> Result<(), AnalysisOutcome> {
        let graph = self.preflight(&request)?;

        let (delta_tx, mut delta_rx) = mpsc::channel::<String>(DELTA_BUFFER);
        let context = self
            .context_for(request, true)
            .with_delta_sink(delta_tx)
            .with_cancellation(cancel.clone());

        let execution = graph.execute(context);
        tokio::pin!(execution);

        let mut forwarded = 0usize;
        let result = loop {
            tokio::select! {
                biased;
                Some(delta) = delta_rx.recv() => {
                    forwarded += 1;
                    if !send_fragment(&fragments, StreamFragment::delta(delta), &cancel).await
                        && !cancel.is_cancelled()
                    {
                        info!(forwarded, "Stream consumer went away, cancelling");
                        cancel.cancel();
                    }
                }
                result = &mut execution => break result,
                _ = fragments.closed(), if !cancel.is_cancelled() => {
                    info!(forwarded, "Stream consumer closed, cancelling");
                    cancel.cancel();
                }
            }
        };

        if let Err(e) = result {
            return Err(outcome_for_error(&e));
        }

        // Deltas sent just before the task returned
        while let Ok(delta) = delta_rx.try_recv() {
            forwarded += 1;
            if !send_fragment(&fragments, StreamFragment::delta(delta), &cancel).await {
                info!(forwarded, "Stream consumer went away during drain");
                return Ok(());
            }
        }

        info!(forwarded, "Report stream completed");
        let _ = fragments.send(StreamFragment::end()).await;
        Ok(())
    }

    /// Department check first, then readiness; no model call happens unless both pass.
    fn preflight(&self, request: &AnalysisRequest) -> Result<&Graph, AnalysisOutcome> {
        if !self.validator.is_serviceable(&request.department) {
            info!(department = %request.department, "Department not serviceable, skipping analysis");
            return Err(AnalysisOutcome::DepartmentMismatch {
                message: format!("当前科室暂不支持AI分析：{}", request.department),
            });
        }

        self.graph.as_ref().ok_or_else(|| {
            warn!("Analysis requested before services were ready");
            AnalysisOutcome::ServiceUnavailable
        })
    }

    fn context_for(&self, request: AnalysisRequest, stream_requested: bool) -> Context {
        let context = Context::new();
        if let Some(image) = &request.image {
            context.attach(IMAGE_KEY, image.clone());
        }
        context.set_sync(STREAM_REQUESTED_KEY, stream_requested);
        context.set_sync(PIPELINE_KEY, PipelineContext::new(request));
        context
    }
}

/// Send one fragment unless the run is cancelled first.
///
/// A full buffer on a consumer that has stopped reading must not pin the
/// worker, so the send races the cancellation token.
async fn send_fragment(
    fragments: &mpsc::Sender<StreamFragment>,
    fragment: StreamFragment,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        sent = fragments.send(fragment) => sent.is_ok(),
        _ = cancel.cancelled() => false,
    }
}

pub fn build_analysis_graph(
    model: Arc<dyn InferenceModel>,
    retriever: Arc<dyn Retriever>,
    top_k: usize,
) -> Graph {
    let describe_task = Arc::new(DescribeTask::new(Arc::clone(&model)));
    let describe_id = describe_task.id().to_string();

    let retrieve_task = Arc::new(RetrieveTask::new(Arc::clone(&model), retriever, top_k));
    let retrieve_id = retrieve_task.id().to_string();

    let stream_task = Arc::new(StreamReportTask::new(Arc::clone(&model)));
    let stream_id = stream_task.id().to_string();

    let sync_task = Arc::new(SyncReportTask::new(model));
    let sync_id = sync_task.id().to_string();

    GraphBuilder::new("triage_analysis")
        .add_task(describe_task)
        .add_task(retrieve_task)
        .add_task(stream_task)
        .add_task(sync_task)
        .add_edge(&describe_id, &retrieve_id)
        .add_conditional_edge(
            &retrieve_id,
            |ctx| ctx.get_sync::<bool>(STREAM_REQUESTED_KEY).unwrap_or(false),
            &stream_id,
            &sync_id,
        )
        .build()
}
