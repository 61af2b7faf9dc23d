//! Parser for the `data:` lines of an OpenAI-compatible streaming response.

use serde::Deserialize;

const DONE_SENTINEL: &str = "[DONE]";

/// What one SSE line means for the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Nothing to forward (blank line, comment, empty delta)
    Skip,
    Delta(String),
    /// Text followed by a finish reason in the same event
    Final(Option<String>),
    Done,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: DeltaContent,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DeltaContent {
    content: Option<String>,
}

pub fn parse_sse_line(line: &str) -> anyhow::Result<SseEvent> {
    let line = line.trim_end();
    if line.is_empty() || line.starts_with(':') {
        return Ok(SseEvent::Skip);
    }

    // event:, id:, retry: lines carry nothing we use
    let Some(payload) = line.strip_prefix("data:").map(str::trim_start) else {
        return Ok(SseEvent::Skip);
    };

    if payload.is_empty() {
        return Ok(SseEvent::Skip);
    }
    if payload == DONE_SENTINEL {
        return Ok(SseEvent::Done);
    }

    let delta: StreamDelta = serde_json::from_str(payload)
        .map_err(|e| anyhow::anyhow!("failed to parse SSE delta: {e}"))?;

    let Some(choice) = delta.choices.into_iter().next() else {
        return Ok(SseEvent::Skip);
    };
    let text = choice.delta.content.filter(|t| !t.is_empty());

    Ok(match (text, choice.finish_reason) {
        (text, Some(_)) => SseEvent::Final(text),
        (Some(text), None) => SseEvent::Delta(text),
        (None, None) => SseEvent::Skip,
    })
}
