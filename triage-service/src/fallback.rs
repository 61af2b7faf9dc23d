//! Failure classification for the analysis pipeline.
//!
//! Every error raised by a stage is turned into an [`AnalysisOutcome`] here
//! before it can reach a caller. Successful reports also pass through
//! [`classify_report`], which decides whether the report author rejected the
//! chosen department.

use tracing::warn;
use triage_flow::GraphError;

use crate::models::AnalysisOutcome;

/// Longest error detail passed on to callers, in characters
pub const MAX_DETAIL_CHARS: usize = 200;

/// Reports shorter than this (after trimming) are treated as a department rejection
pub const MIN_REPORT_CHARS: usize = 50;

/// Phrases the final-report prompt asks the model to emit when the department is wrong
const DEPARTMENT_ERROR_PHRASES: &[&str] = &["科室选择错误，请重新选择", "科室选择错误"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportVerdict {
    Plausible,
    DepartmentRejected,
}

// Phrase matching and the length floor are known to misfire on unusual
// phrasing; both are kept as-is until there is labelled data to tune against.
pub fn classify_report(report: &str) -> ReportVerdict {
    let trimmed = report.trim();
    if DEPARTMENT_ERROR_PHRASES.iter().any(|p| trimmed.contains(p))
        || trimmed.chars().count() < MIN_REPORT_CHARS
    {
        ReportVerdict::DepartmentRejected
    } else {
        ReportVerdict::Plausible
    }
}

/// Cut an error message down to [`MAX_DETAIL_CHARS`] characters, marking the cut
pub fn truncate_detail(message: &str) -> String {
    if message.chars().count() <= MAX_DETAIL_CHARS {
        return message.to_string();
    }
    let mut truncated: String = message.chars().take(MAX_DETAIL_CHARS).collect();
    truncated.push_str("...");
    truncated
}

/// Convert a failed graph execution into the outcome callers receive
pub fn outcome_for_error(error: &GraphError) -> AnalysisOutcome {
    warn!(error = %error, "Analysis pipeline failed");
    AnalysisOutcome::InternalError {
        detail: truncate_detail(&error.to_string()),
    }
}
