use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Scratch space shared by the tasks of one graph execution.
///
/// A context is created per execution and never shared across executions.
/// Besides the key/value store it holds raw byte attachments that stay out of
/// the JSON values, and it can carry a sink for incremental text produced by
/// streaming tasks and a cancellation token the graph checks before and
/// during every task run.
#[derive(Clone, Debug)]
pub struct Context {
    data: Arc<DashMap<String, Value>>,
    attachments: Arc<DashMap<String, Bytes>>,
    deltas: Option<mpsc::Sender<String>>,
    cancellation: CancellationToken,
}

impl Context {
    pub fn new() -> Self {
        Self {
            data: Arc::new(DashMap::new()),
            attachments: Arc::new(DashMap::new()),
            deltas: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Attach a sink that streaming tasks push text deltas into.
    pub fn with_delta_sink(mut self, sink: mpsc::Sender<String>) -> Self {
        self.deltas = Some(sink);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn delta_sink(&self) -> Option<mpsc::Sender<String>> {
        self.deltas.clone()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub async fn set(&self, key: impl Into<String>, value: impl serde::Serialize) {
        self.set_sync(key, value);
    }

    pub fn set_sync(&self, key: impl Into<String>, value: impl serde::Serialize) {
        let key = key.into();
        match serde_json::to_value(value) {
            Ok(value) => {
                self.data.insert(key, value);
            }
            Err(e) => warn!(key = %key, error = %e, "Failed to serialize context value"),
        }
    }

    pub async fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_sync(key)
    }

    pub fn get_sync<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub async fn remove(&self, key: &str) -> Option<Value> {
        self.data.remove(key).map(|(_, v)| v)
    }

    /// Store binary data as-is, without a JSON round trip.
    pub fn attach(&self, key: impl Into<String>, data: Bytes) {
        self.attachments.insert(key.into(), data);
    }

    pub fn attachment(&self, key: &str) -> Option<Bytes> {
        self.attachments.get(key).map(|data| data.clone())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
