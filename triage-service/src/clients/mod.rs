//! Narrow contracts for the external services the pipeline calls.

pub mod llm;
pub mod retriever;
pub mod sse;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use llm::LlmGateway;
pub use retriever::PgVectorRetriever;

/// Language model used by every inference stage
#[async_trait]
pub trait InferenceModel: Send + Sync {
    /// Multimodal call: a text prompt plus an optional clinical image
    async fn describe_image(&self, prompt: &str, image: Option<&[u8]>) -> anyhow::Result<String>;

    /// Plain prompt in, full completion out
    async fn complete(&self, prompt: &str) -> anyhow::Result<String>;

    /// Streamed completion. Text deltas are pushed into `deltas` in order;
    /// returns once the model reports completion or the receiver is dropped.
    async fn complete_stream(&self, prompt: &str, deltas: mpsc::Sender<String>) -> anyhow::Result<()>;
}

/// Similarity search over the medical knowledge base
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Up to `k` passages, in the order the index ranks them
    async fn retrieve(&self, query: &str, k: usize) -> anyhow::Result<Vec<String>>;
}
