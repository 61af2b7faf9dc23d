//! Wire-level types exchanged with callers.
//!
//! A response is a sequence of [`ResponseFrame`]s. Sync requests get exactly
//! one final frame whose payload is a JSON [`AnalysisReport`]; streamed
//! requests get raw UTF-8 text frames followed by one final frame carrying
//! the end-of-stream token. Frames travel as newline-delimited JSON with the
//! payload base64 encoded.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::models::{AnalysisOutcome, KeyInfo, StreamFragment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisStatus {
    Success,
    DepartmentMismatch,
    DepartmentError,
    ServiceUnavailable,
    InternalError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub text: String,
    pub status: AnalysisStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_info: Option<KeyInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_department: Option<bool>,
}

impl AnalysisReport {
    fn plain(text: impl Into<String>, status: AnalysisStatus, message: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status,
            message: message.into(),
            key_info: None,
            is_department: None,
        }
    }

    /// Render an outcome the way callers see it
    pub fn from_outcome(outcome: AnalysisOutcome) -> Self {
        match outcome {
            AnalysisOutcome::Success {
                report,
                key_info,
                is_department_match,
            } => Self {
                text: report,
                status: AnalysisStatus::Success,
                message: "AI分析完成".to_string(),
                key_info: Some(key_info),
                is_department: Some(is_department_match),
            },
            AnalysisOutcome::DepartmentMismatch { message } => {
                Self::plain("", AnalysisStatus::DepartmentMismatch, message)
            }
            AnalysisOutcome::DepartmentError { raw_text } => Self::plain(
                raw_text,
                AnalysisStatus::DepartmentError,
                "科室选择错误，请重新选择",
            ),
            AnalysisOutcome::ServiceUnavailable => Self::plain(
                "医疗分析服务未就绪，请检查初始化状态。",
                AnalysisStatus::ServiceUnavailable,
                "AI服务暂不可用，请稍后重试",
            ),
            AnalysisOutcome::InternalError { detail } => Self::plain(
                "",
                AnalysisStatus::InternalError,
                format!("AI分析失败: {detail}"),
            ),
        }
    }

    /// The placeholder returned when a failure escapes to the transport boundary
    pub fn degraded() -> Self {
        Self::plain(
            "",
            AnalysisStatus::ServiceUnavailable,
            "AI服务繁忙，请稍后重试",
        )
    }

    pub fn to_bytes(&self) -> Bytes {
        // A struct of strings, enums and options always serializes.
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }
}

/// One unit of the response stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub payload: Bytes,
    pub is_final: bool,
}

impl ResponseFrame {
    pub fn report(report: &AnalysisReport) -> Self {
        Self {
            payload: report.to_bytes(),
            is_final: true,
        }
    }

    /// Decode the payload of a sync-mode frame
    pub fn decode_report(&self) -> serde_json::Result<AnalysisReport> {
        serde_json::from_slice(&self.payload)
    }

    /// Encode as one newline-terminated JSON line
    pub fn to_ndjson(&self) -> Bytes {
        let line = NdjsonFrame {
            payload: STANDARD.encode(&self.payload),
            is_final: self.is_final,
        };
        let mut encoded = serde_json::to_vec(&line).unwrap_or_default();
        encoded.push(b'\n');
        Bytes::from(encoded)
    }

    pub fn from_ndjson(line: &[u8]) -> anyhow::Result<Self> {
        let frame: NdjsonFrame = serde_json::from_slice(line)?;
        Ok(Self {
            payload: Bytes::from(STANDARD.decode(frame.payload)?),
            is_final: frame.is_final,
        })
    }
}

impl From<StreamFragment> for ResponseFrame {
    fn from(fragment: StreamFragment) -> Self {
        Self {
            payload: Bytes::from(fragment.text),
            is_final: fragment.is_final,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct NdjsonFrame {
    payload: String,
    is_final: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::END_OF_STREAM;

    #[test]
    fn status_uses_screaming_case_on_the_wire() {
        let json = serde_json::to_string(&AnalysisStatus::DepartmentMismatch).unwrap();
        assert_eq!(json, "\"DEPARTMENT_MISMATCH\"");
    }

    #[test]
    fn success_report_carries_key_info() {
        let report = AnalysisReport::from_outcome(AnalysisOutcome::Success {
            report: "完整报告".to_string(),
            key_info: KeyInfo {
                chief_complaint: "咽痛".to_string(),
                risk_level: "低".to_string(),
                ..Default::default()
            },
            is_department_match: true,
        });

        assert_eq!(report.status, AnalysisStatus::Success);
        assert_eq!(report.is_department, Some(true));
        assert_eq!(report.key_info.unwrap().chief_complaint, "咽痛");
    }

    #[test]
    fn error_reports_omit_structured_fields() {
        let report = AnalysisReport::from_outcome(AnalysisOutcome::InternalError {
            detail: "timeout".to_string(),
        });
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["status"], "INTERNAL_ERROR");
        assert_eq!(json["message"], "AI分析失败: timeout");
        assert!(json.get("key_info").is_none());
    }

    #[test]
    fn ndjson_line_decodes_back_to_the_frame() {
        let frame = ResponseFrame::from(StreamFragment::end());
        let line = frame.to_ndjson();

        assert_eq!(line.last(), Some(&b'\n'));
        let decoded = ResponseFrame::from_ndjson(&line[..line.len() - 1]).unwrap();
        assert!(decoded.is_final);
        assert_eq!(&decoded.payload[..], END_OF_STREAM.as_bytes());
    }

    #[test]
    fn report_frame_is_final_and_decodable() {
        let frame = ResponseFrame::report(&AnalysisReport::degraded());
        assert!(frame.is_final);
        assert_eq!(
            frame.decode_report().unwrap().status,
            AnalysisStatus::ServiceUnavailable
        );
    }
}
