//! Streaming delivery adapter.
//!
//! Maps pipeline outcomes and stream fragments onto [`ResponseFrame`]s. Every
//! request ends with exactly one final frame, whatever happens on the way.

use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::models::{AnalysisOutcome, AnalysisRequest, StreamFragment};
use crate::pipeline::Pipeline;
use crate::wire::{AnalysisReport, ResponseFrame};

/// Frames buffered between a worker and the transport
pub const FRAME_BUFFER: usize = 32;

/// Run one request and write its frames into `frames`.
///
/// Closing the receiving side cancels the request.
pub async fn deliver(
    pipeline: &Pipeline,
    request: AnalysisRequest,
    frames: mpsc::Sender<ResponseFrame>,
    cancel: CancellationToken,
) {
    if request.stream_requested {
        deliver_stream(pipeline, request, frames, cancel).await;
    } else {
        deliver_sync(pipeline, request, frames, cancel).await;
    }
}

async fn deliver_sync(
    pipeline: &Pipeline,
    request: AnalysisRequest,
    frames: mpsc::Sender<ResponseFrame>,
    cancel: CancellationToken,
) {
    let outcome = tokio::select! {
        outcome = pipeline.analyze(request, cancel.clone()) => outcome,
        _ = frames.closed() => {
            info!("Caller disconnected before the report was ready");
            cancel.cancel();
            return;
        }
    };

    send_outcome(&frames, outcome).await;
}

async fn deliver_stream(
    pipeline: &Pipeline,
    request: AnalysisRequest,
    frames: mpsc::Sender<ResponseFrame>,
    cancel: CancellationToken,
) {
    let (fragment_tx, fragment_rx) = mpsc::channel::<StreamFragment>(FRAME_BUFFER);
    let forward = forward_fragments(fragment_rx, frames.clone(), cancel.clone());

    let (result, sent) = tokio::join!(
        pipeline.analyze_stream(request, fragment_tx, cancel.clone()),
        forward
    );
    debug!(sent, "Stream forwarding finished");

    if let Err(outcome) = result {
        if cancel.is_cancelled() {
            debug!("Stream cancelled, no final frame");
            return;
        }
        send_outcome(&frames, outcome).await;
    }
}

/// Copy fragments onto the caller's frames until either side closes.
///
/// Owns the fragment receiver so that leaving the loop closes it and unblocks
/// a pipeline parked on a full buffer.
async fn forward_fragments(
    mut fragment_rx: mpsc::Receiver<StreamFragment>,
    frames: mpsc::Sender<ResponseFrame>,
    cancel: CancellationToken,
) -> usize {
    let mut sent = 0usize;
    loop {
        tokio::select! {
            fragment = fragment_rx.recv() => {
                let Some(fragment) = fragment else { break };
                if frames.send(ResponseFrame::from(fragment)).await.is_err() {
                    info!(sent, "Caller disconnected mid-stream");
                    cancel.cancel();
                    break;
                }
                sent += 1;
            }
            _ = frames.closed() => {
                info!(sent, "Caller disconnected mid-stream");
                cancel.cancel();
                break;
            }
        }
    }
    sent
}

async fn send_outcome(frames: &mpsc::Sender<ResponseFrame>, outcome: AnalysisOutcome) {
    let report = AnalysisReport::from_outcome(outcome);
    debug!(status = ?report.status, "Sending final report frame");
    if frames.send(ResponseFrame::report(&report)).await.is_err() {
        debug!("Caller gone before the final frame");
    }
}

/// Bounded worker pool: each request holds one permit until its last frame is written.
#[derive(Clone)]
pub struct WorkerPool {
    pipeline: Arc<Pipeline>,
    permits: Arc<Semaphore>,
    max_workers: usize,
}

impl WorkerPool {
    pub fn new(pipeline: Arc<Pipeline>, max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            pipeline,
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn idle_workers(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Start a request on the pool and return the receiving end of its frames.
    ///
    /// A panic inside the request is converted into the degraded report frame.
    pub fn spawn(&self, request: AnalysisRequest) -> mpsc::Receiver<ResponseFrame> {
        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let pipeline = Arc::clone(&self.pipeline);
        let permits = Arc::clone(&self.permits);

        tokio::spawn(async move {
            let permit = tokio::select! {
                permit = permits.acquire_owned() => permit,
                _ = tx.closed() => {
                    debug!("Caller left while queued for a worker");
                    return;
                }
            };
            let Ok(permit) = permit else {
                warn!("Worker pool closed");
                send_degraded(&tx).await;
                return;
            };

            let cancel = CancellationToken::new();
            let worker_tx = tx.clone();
            let worker = tokio::spawn(async move {
                deliver(&pipeline, request, worker_tx, cancel).await;
            });

            if let Err(e) = worker.await {
                error!(error = %e, "Analysis worker failed");
                send_degraded(&tx).await;
            }
            drop(permit);
        });

        rx
    }
}

async fn send_degraded(frames: &mpsc::Sender<ResponseFrame>) {
    let _ = frames.send(ResponseFrame::report(&AnalysisReport::degraded())).await;
}
