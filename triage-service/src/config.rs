use anyhow::anyhow;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::pipeline::DEFAULT_TOP_K;

pub const DEFAULT_ADDR: &str = "127.0.0.1:50051";
pub const DEFAULT_MAX_WORKERS: usize = 10;
pub const DEFAULT_DEPARTMENTS: &str = "耳鼻喉科,呼吸内科";
pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_TEXT_MODEL: &str = "openai/gpt-4.1-mini";
pub const DEFAULT_VISION_MODEL: &str = "openai/gpt-4.1-mini";
pub const DEFAULT_STREAM_MODEL: &str = "openai/gpt-4.1-mini";
pub const DEFAULT_MAX_TOKENS: u64 = 2048;
pub const DEFAULT_TEMPERATURE: f64 = 0.0;
pub const DEFAULT_KNOWLEDGE_TABLE: &str = "medical_passages";

/// Model endpoint settings shared by every inference stage
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub api_key: String,
    pub base_url: String,
    pub text_model: String,
    pub vision_model: String,
    pub stream_model: String,
    pub max_tokens: u64,
    pub temperature: f64,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub addr: SocketAddr,
    pub max_workers: usize,
    pub departments: Vec<String>,
    /// `None` when no API key is configured; the service starts unready
    pub llm: Option<LlmSettings>,
    /// `None` leaves retrieval uninitialised and the service unready
    pub knowledge_database_url: Option<String>,
    pub knowledge_table: String,
    pub top_k: usize,
    pub directory_path: Option<PathBuf>,
}

impl ServiceConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let settings = |api_key| -> anyhow::Result<LlmSettings> {
            Ok(LlmSettings {
                api_key,
                base_url: get("LLM_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
                text_model: get("TRIAGE_TEXT_MODEL").unwrap_or_else(|| DEFAULT_TEXT_MODEL.to_string()),
                vision_model: get("TRIAGE_VISION_MODEL").unwrap_or_else(|| DEFAULT_VISION_MODEL.to_string()),
                stream_model: get("TRIAGE_STREAM_MODEL").unwrap_or_else(|| DEFAULT_STREAM_MODEL.to_string()),
                max_tokens: parse_or(get("LLM_MAX_TOKENS"), "LLM_MAX_TOKENS", DEFAULT_MAX_TOKENS)?,
                temperature: parse_or(get("LLM_TEMPERATURE"), "LLM_TEMPERATURE", DEFAULT_TEMPERATURE)?,
            })
        };
        let llm = get("OPENROUTER_API_KEY").map(settings).transpose()?;

        let departments: Vec<String> = get("TRIAGE_DEPARTMENTS")
            .unwrap_or_else(|| DEFAULT_DEPARTMENTS.to_string())
            .split([',', '，'])
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .collect();
        if departments.is_empty() {
            return Err(anyhow!("TRIAGE_DEPARTMENTS lists no departments"));
        }

        let max_workers = parse_or(get("TRIAGE_MAX_WORKERS"), "TRIAGE_MAX_WORKERS", DEFAULT_MAX_WORKERS)?;
        if max_workers == 0 {
            return Err(anyhow!("TRIAGE_MAX_WORKERS must be at least 1"));
        }

        Ok(Self {
            addr: parse_or(get("TRIAGE_ADDR"), "TRIAGE_ADDR", DEFAULT_ADDR.parse()?)?,
            max_workers,
            departments,
            llm,
            knowledge_database_url: get("KNOWLEDGE_DATABASE_URL"),
            knowledge_table: get("KNOWLEDGE_TABLE").unwrap_or_else(|| DEFAULT_KNOWLEDGE_TABLE.to_string()),
            top_k: parse_or(get("RETRIEVAL_TOP_K"), "RETRIEVAL_TOP_K", DEFAULT_TOP_K)?,
            directory_path: get("TRIAGE_DIRECTORY_PATH").map(PathBuf::from),
        })
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow!("invalid {key} value {raw:?}: {e}")),
        None => Ok(default),
    }
}
