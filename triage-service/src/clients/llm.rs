use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, stream::Stream};
use reqwest::Client;
use rig::{agent::Agent, client::CompletionClient, completion::Prompt, providers::openrouter};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::InferenceModel;
use super::sse::{SseEvent, parse_sse_line};
use crate::config::LlmSettings;
use crate::tasks::prompts::SYSTEM_PREAMBLE;

/// Model client shared by all requests.
///
/// Text completions go through a rig agent; the multimodal and streaming
/// calls talk to the chat-completions endpoint directly.
pub struct LlmGateway {
    agent: Agent<openrouter::CompletionModel>,
    http: Client,
    settings: LlmSettings,
}

impl LlmGateway {
    pub fn new(settings: LlmSettings) -> anyhow::Result<Self> {
        let client = openrouter::Client::new(&settings.api_key);
        let agent = client
            .agent(&settings.text_model)
            .preamble(SYSTEM_PREAMBLE)
            .temperature(settings.temperature)
            .max_tokens(settings.max_tokens)
            .build();

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        info!(
            base_url = %settings.base_url,
            text_model = %settings.text_model,
            vision_model = %settings.vision_model,
            stream_model = %settings.stream_model,
            "LLM gateway initialized"
        );

        Ok(Self {
            agent,
            http,
            settings,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/'))
    }

    async fn post_chat(&self, payload: &Value) -> anyhow::Result<reqwest::Response> {
        let response = self
            .http
            .post(self.completions_url())
            .header("Authorization", format!("Bearer {}", self.settings.api_key))
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("LLM API request failed: HTTP {status}: {body}"));
        }
        Ok(response)
    }
}

#[async_trait]
impl InferenceModel for LlmGateway {
    async fn describe_image(&self, prompt: &str, image: Option<&[u8]>) -> anyhow::Result<String> {
        let mut content = vec![json!({ "type": "text", "text": prompt })];
        if let Some(image) = image {
            content.push(json!({
                "type": "image_url",
                "image_url": {
                    "url": format!("data:{};base64,{}", image_mime(image), STANDARD.encode(image))
                }
            }));
        }

        let payload = json!({
            "model": self.settings.vision_model,
            "messages": [
                { "role": "system", "content": SYSTEM_PREAMBLE },
                { "role": "user", "content": content }
            ],
            "temperature": self.settings.temperature,
            "max_tokens": self.settings.max_tokens
        });

        debug!(has_image = image.is_some(), "Sending multimodal description request");
        let response_json: Value = self.post_chat(&payload).await?.json().await?;

        let text = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow!("Invalid response format from LLM"))?;
        Ok(text.to_string())
    }

    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        self.agent
            .prompt(prompt.to_string())
            .await
            .map_err(|e| anyhow!("LLM prompt failed: {e}"))
    }

    async fn complete_stream(&self, prompt: &str, deltas: mpsc::Sender<String>) -> anyhow::Result<()> {
        let payload = json!({
            "model": self.settings.stream_model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": self.settings.temperature,
            "max_tokens": self.settings.max_tokens,
            "stream": true
        });

        let response = self.post_chat(&payload).await?;
        forward_sse(response.bytes_stream(), &deltas).await
    }
}

enum LineOutcome {
    More,
    Finished,
    ReceiverGone,
}

/// Forward the deltas of an SSE byte stream until the model reports completion.
///
/// Bytes are buffered until a full line is present, so a multi-byte character
/// split across network chunks is decoded whole. A stream that closes without
/// `finish_reason` or `[DONE]` is an error: the report is truncated.
async fn forward_sse<S, E>(byte_stream: S, deltas: &mpsc::Sender<String>) -> anyhow::Result<()>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut byte_stream = std::pin::pin!(byte_stream);
    let mut buffer = BytesMut::new();
    let mut forwarded = 0usize;

    while let Some(chunk) = byte_stream.next().await {
        let bytes = chunk.map_err(|e| anyhow!("stream read error: {e}"))?;
        buffer.extend_from_slice(&bytes);

        while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
            let line = buffer.split_to(newline + 1);
            match forward_line(&line, deltas, &mut forwarded).await {
                LineOutcome::More => {}
                LineOutcome::Finished => {
                    debug!(deltas = forwarded, "Model reported completion");
                    return Ok(());
                }
                LineOutcome::ReceiverGone => {
                    debug!("Delta receiver dropped, stopping stream");
                    return Ok(());
                }
            }
        }
    }

    // Last line without a trailing newline
    if !buffer.is_empty() {
        match forward_line(&buffer, deltas, &mut forwarded).await {
            LineOutcome::More => {}
            LineOutcome::Finished | LineOutcome::ReceiverGone => return Ok(()),
        }
    }

    warn!(deltas = forwarded, "Model stream closed without a finish marker");
    Err(anyhow!("model stream ended before completion after {forwarded} deltas"))
}

async fn forward_line(line: &[u8], deltas: &mpsc::Sender<String>, forwarded: &mut usize) -> LineOutcome {
    let line = String::from_utf8_lossy(line);
    let event = match parse_sse_line(&line) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "SSE parse error, skipping line");
            return LineOutcome::More;
        }
    };

    let (text, finished) = match event {
        SseEvent::Skip => return LineOutcome::More,
        SseEvent::Delta(text) => (Some(text), false),
        SseEvent::Final(text) => (text, true),
        SseEvent::Done => (None, true),
    };

    if let Some(text) = text {
        *forwarded += 1;
        if deltas.send(text).await.is_err() {
            return LineOutcome::ReceiverGone;
        }
    }
    if finished { LineOutcome::Finished } else { LineOutcome::More }
}

/// Best-effort MIME type from the image's magic bytes
fn image_mime(image: &[u8]) -> &'static str {
    match image {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xff, 0xd8, ..] => "image/jpeg",
        [b'G', b'I', b'F', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, routing::post};
    use std::convert::Infallible;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_stream::wrappers::ReceiverStream;

    fn delta_line(text: &str, finish_reason: Option<&str>) -> String {
        let event = json!({ "choices": [{ "delta": { "content": text }, "finish_reason": finish_reason }] });
        format!("data: {event}\n\n")
    }

    fn settings(base_url: String) -> LlmSettings {
        LlmSettings {
            api_key: "sk-test".to_string(),
            base_url,
            text_model: "test/text".to_string(),
            vision_model: "test/vision".to_string(),
            stream_model: "test/stream".to_string(),
            max_tokens: 64,
            temperature: 0.0,
        }
    }

    /// Serve one chat-completions body made of `chunks`, pausing between them
    async fn sse_server(chunks: Vec<Bytes>) -> String {
        let chunks = Arc::new(chunks);
        let app = Router::new().route(
            "/chat/completions",
            post(move || {
                let chunks = Arc::clone(&chunks);
                async move {
                    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(4);
                    tokio::spawn(async move {
                        for chunk in chunks.iter() {
                            if tx.send(Ok(chunk.clone())).await.is_err() {
                                return;
                            }
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    });
                    Body::from_stream(ReceiverStream::new(rx))
                }
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn stream_over_http(chunks: Vec<Bytes>) -> (anyhow::Result<()>, Vec<String>) {
        let gateway = LlmGateway::new(settings(sse_server(chunks).await)).unwrap();
        let (tx, mut rx) = mpsc::channel(16);

        let result = gateway.complete_stream("咽痛三天", tx).await;

        let mut received = Vec::new();
        while let Ok(delta) = rx.try_recv() {
            received.push(delta);
        }
        (result, received)
    }

    #[tokio::test]
    async fn character_split_across_chunks_arrives_intact() {
        let line = delta_line("咽痛", None);
        let split = line.find('咽').unwrap() + 1;
        let chunks = vec![
            Bytes::copy_from_slice(&line.as_bytes()[..split]),
            Bytes::copy_from_slice(&line.as_bytes()[split..]),
            Bytes::from_static(b"data: [DONE]\n\n"),
        ];

        let (result, received) = stream_over_http(chunks).await;

        assert!(result.is_ok());
        assert_eq!(received, ["咽痛"]);
    }

    #[tokio::test]
    async fn done_sentinel_ends_the_stream() {
        let chunks = vec![
            Bytes::from(delta_line("咽部", None)),
            Bytes::from(delta_line("充血", None)),
            Bytes::from_static(b"data: [DONE]\n\n"),
            Bytes::from(delta_line("多余", None)),
        ];

        let (result, received) = stream_over_http(chunks).await;

        assert!(result.is_ok());
        assert_eq!(received, ["咽部", "充血"]);
    }

    #[tokio::test]
    async fn finish_reason_ends_the_stream() {
        let chunks = vec![
            Bytes::from(delta_line("咽痛", None)),
            Bytes::from(delta_line("。", Some("stop"))),
        ];

        let (result, received) = stream_over_http(chunks).await;

        assert!(result.is_ok());
        assert_eq!(received, ["咽痛", "。"]);
    }

    #[tokio::test]
    async fn close_without_finish_marker_is_an_error() {
        let chunks = vec![Bytes::from(delta_line("咽痛", None))];

        let (result, received) = stream_over_http(chunks).await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("before completion"));
        assert_eq!(received, ["咽痛"]);
    }

    #[tokio::test]
    async fn final_line_without_newline_is_flushed() {
        let last = delta_line("。", Some("stop"));
        let chunks = vec![
            Ok::<_, Infallible>(Bytes::from(delta_line("咽痛", None))),
            Ok(Bytes::copy_from_slice(last.trim_end().as_bytes())),
        ];
        let (tx, mut rx) = mpsc::channel(4);

        forward_sse(futures_util::stream::iter(chunks), &tx).await.unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("咽痛"));
        assert_eq!(rx.recv().await.as_deref(), Some("。"));
    }

    #[test]
    fn mime_from_magic_bytes() {
        assert_eq!(image_mime(&[0x89, b'P', b'N', b'G', 0x0d]), "image/png");
        assert_eq!(image_mime(&[0xff, 0xd8, 0xff]), "image/jpeg");
        assert_eq!(image_mime(b"RIFF\0\0\0\0WEBPVP8"), "image/webp");
        assert_eq!(image_mime(&[]), "image/jpeg");
    }
}
