use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Payload of the terminal fragment of a streamed analysis.
pub const END_OF_STREAM: &str = "[STREAM_END]";

/// One intake to analyse. Immutable once built.
///
/// The image never enters the serialized form; the pipeline hands it to the
/// flow context as a raw attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub patient_text: String,
    #[serde(skip)]
    pub image: Option<Bytes>,
    pub stream_requested: bool,
    pub department: String,
}

impl AnalysisRequest {
    pub fn new(patient_text: impl Into<String>, department: impl Into<String>) -> Self {
        Self {
            patient_text: patient_text.into(),
            image: None,
            stream_requested: false,
            department: department.into(),
        }
    }

    pub fn with_image(mut self, image: impl Into<Bytes>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn streaming(mut self, stream_requested: bool) -> Self {
        self.stream_requested = stream_requested;
        self
    }
}

/// Scratch record threaded through the pipeline stages of one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineContext {
    pub request: AnalysisRequest,
    pub description_block: Option<String>,
    pub retrieved_context: Option<String>,
}

impl PipelineContext {
    pub fn new(request: AnalysisRequest) -> Self {
        Self {
            request,
            description_block: None,
            retrieved_context: None,
        }
    }
}

/// Canonical structured summary extracted from a final report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyInfo {
    pub chief_complaint: String,
    pub key_symptoms: String,
    pub image_summary: Option<String>,
    pub important_notes: String,
    pub risk_level: String,
    pub suggested_department: String,
}

/// Result of one completed analysis request
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    Success {
        report: String,
        key_info: KeyInfo,
        is_department_match: bool,
    },
    /// The requested department is not served; no model was called
    DepartmentMismatch { message: String },
    /// The report author judged the chosen department wrong for the symptoms
    DepartmentError { raw_text: String },
    /// A required subsystem never became ready
    ServiceUnavailable,
    InternalError { detail: String },
}

impl AnalysisOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AnalysisOutcome::Success { .. })
    }
}

/// One element of a streamed analysis.
///
/// Non-final fragments carry raw model text; the final fragment carries
/// [`END_OF_STREAM`] and is always the last one produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFragment {
    pub text: String,
    pub is_final: bool,
}

impl StreamFragment {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn end() -> Self {
        Self {
            text: END_OF_STREAM.to_string(),
            is_final: true,
        }
    }
}
