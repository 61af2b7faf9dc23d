//! Scripted collaborators for tests.

use anyhow::bail;
use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

use super::{InferenceModel, Retriever};

pub(crate) const THROAT_REPORT: &str = "### 1. 【患者主诉 (Chief Complaint)】\n咽喉剧烈疼痛三天，吞咽时加重\n\
### 2. 【关键症状 (Key Symptoms)】\n咽痛，吞咽困难，低热\n\
### 3. 【影像总结 (Image Summary)】\n咽部充血，扁桃体Ⅰ度肿大\n\
### 4. 【重要笔记 (Important Notes)】\n注意体温变化，避免辛辣饮食\n\
### 5. 【风险等级 (Risk Level)】\n低\n\
### 6. 【建议科室 (Suggested Department)】\n耳鼻喉科\n";

pub(crate) struct ScriptedModel {
    pub description: String,
    pub keywords: String,
    pub report: String,
    pub stream_deltas: Vec<String>,
    pub fail_describe: bool,
    /// Fail the stream after sending this many deltas
    pub stream_fail_after: Option<usize>,
    /// Keep the stream open after the scripted deltas
    pub stream_hangs: bool,
    pub describe_calls: AtomicUsize,
    pub complete_calls: AtomicUsize,
    pub stream_calls: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
    pub images: Mutex<Vec<Option<Vec<u8>>>>,
}

impl ScriptedModel {
    pub fn new(report: &str) -> Self {
        Self {
            description: "【文本要点】咽痛三天\n【影像观察】咽部充血".to_string(),
            keywords: "咽痛 咽部充血 吞咽困难".to_string(),
            report: report.to_string(),
            stream_deltas: Vec::new(),
            fail_describe: false,
            stream_fail_after: None,
            stream_hangs: false,
            describe_calls: AtomicUsize::new(0),
            complete_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            images: Mutex::new(Vec::new()),
        }
    }

    pub fn streaming(mut self, deltas: &[&str]) -> Self {
        self.stream_deltas = deltas.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn total_calls(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
            + self.complete_calls.load(Ordering::SeqCst)
            + self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().cloned()
    }

    /// Image bytes seen by the most recent description call
    pub fn last_image(&self) -> Option<Vec<u8>> {
        self.images.lock().unwrap().last().cloned().flatten()
    }

    fn record(&self, prompt: &str) {
        self.prompts.lock().unwrap().push(prompt.to_string());
    }
}

#[async_trait]
impl InferenceModel for ScriptedModel {
    async fn describe_image(&self, prompt: &str, image: Option<&[u8]>) -> anyhow::Result<String> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        self.record(prompt);
        self.images.lock().unwrap().push(image.map(<[u8]>::to_vec));
        if self.fail_describe {
            bail!("vision endpoint returned HTTP 502");
        }
        Ok(self.description.clone())
    }

    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        self.record(prompt);
        if prompt.starts_with("根据以下病情描述") {
            Ok(self.keywords.clone())
        } else {
            Ok(self.report.clone())
        }
    }

    async fn complete_stream(&self, prompt: &str, deltas: mpsc::Sender<String>) -> anyhow::Result<()> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.record(prompt);
        for (sent, delta) in self.stream_deltas.iter().enumerate() {
            if self.stream_fail_after == Some(sent) {
                bail!("stream read error: connection reset");
            }
            if deltas.send(delta.clone()).await.is_err() {
                return Ok(());
            }
        }
        if self.stream_hangs {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

pub(crate) struct ScriptedRetriever {
    pub passages: Vec<String>,
    pub fail: bool,
    pub calls: AtomicUsize,
    pub last_k: AtomicUsize,
}

impl ScriptedRetriever {
    pub fn new(passages: &[&str]) -> Self {
        Self {
            passages: passages.iter().map(|p| p.to_string()).collect(),
            fail: false,
            calls: AtomicUsize::new(0),
            last_k: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(&[])
        }
    }
}

#[async_trait]
impl Retriever for ScriptedRetriever {
    async fn retrieve(&self, _query: &str, k: usize) -> anyhow::Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.last_k.store(k, Ordering::SeqCst);
        if self.fail {
            bail!("knowledge query failed: connection refused");
        }
        Ok(self.passages.iter().take(k).cloned().collect())
    }
}
