//! Turns a free-text final report into a [`KeyInfo`] record.
//!
//! Two strategies run in order: the whole text as JSON carrying a `key_info`
//! object, then a scan for numbered markdown section headers such as
//! `### 1. 【患者主诉 (Chief Complaint)】`. Parsing never fails; whatever
//! cannot be extracted is filled with defaults.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use tracing::debug;

use crate::department::matches_suggestion;
use crate::models::KeyInfo;

pub const DEFAULT_CHIEF_COMPLAINT: &str = "AI分析完成";
pub const DEFAULT_RISK_LEVEL: &str = "中等";
pub const DEFAULT_IMPORTANT_NOTES: &str = "请查看详细报告";

static SECTION_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*#{1,6}[ \t]*\d+[ \t]*[.、．]?[ \t]*【[ \t]*([^】(（]+?)[ \t]*(?:[(（][^】]*?[)）])?[ \t]*】[^\n]*$")
        .expect("section header pattern is valid")
});

#[derive(Debug, Clone, Copy)]
enum Field {
    ChiefComplaint,
    KeySymptoms,
    ImageSummary,
    ImportantNotes,
    RiskLevel,
    SuggestedDepartment,
}

const SECTION_LABELS: &[(&str, Field)] = &[
    ("患者主诉", Field::ChiefComplaint),
    ("关键症状", Field::KeySymptoms),
    ("影像总结", Field::ImageSummary),
    ("重要笔记", Field::ImportantNotes),
    ("风险等级", Field::RiskLevel),
    ("建议科室", Field::SuggestedDepartment),
];

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReport {
    pub key_info: KeyInfo,
    pub is_department_match: bool,
}

/// Extract the structured summary of `report` and compare its suggested
/// department with the one the patient chose.
pub fn parse_report(report: &str, user_department: &str) -> ParsedReport {
    let key_info = extract_key_info(report);
    let is_department_match = matches_suggestion(user_department, &key_info.suggested_department);

    ParsedReport {
        key_info,
        is_department_match,
    }
}

pub fn extract_key_info(report: &str) -> KeyInfo {
    let mut key_info = if let Some(info) = from_json(report) {
        debug!("Report parsed as JSON");
        info
    } else if let Some(info) = from_markdown(report) {
        debug!("Report parsed from markdown sections");
        info
    } else {
        debug!("Report unstructured, using first line as chief complaint");
        KeyInfo {
            chief_complaint: first_non_empty_line(report).unwrap_or_default(),
            ..Default::default()
        }
    };

    fill_defaults(&mut key_info);
    key_info
}

fn from_json(report: &str) -> Option<KeyInfo> {
    let trimmed = report.trim();
    let cleaned = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.strip_suffix("```").unwrap_or(rest))
        .unwrap_or(trimmed)
        .trim();

    let value: Value = serde_json::from_str(cleaned).ok()?;
    let key_info = value.get("key_info")?;
    serde_json::from_value(key_info.clone()).ok()
}

fn from_markdown(report: &str) -> Option<KeyInfo> {
    let headers: Vec<_> = SECTION_HEADER.captures_iter(report).collect();
    let mut key_info = KeyInfo::default();
    let mut recognized = false;

    for (i, caps) in headers.iter().enumerate() {
        let (Some(whole), Some(label)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let body_end = headers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(report.len(), |next| next.start());
        let body = report[whole.end()..body_end].trim().to_string();

        let Some((_, field)) = SECTION_LABELS.iter().find(|(name, _)| *name == label.as_str().trim())
        else {
            continue;
        };
        recognized = true;

        match field {
            Field::ChiefComplaint => key_info.chief_complaint = body,
            Field::KeySymptoms => key_info.key_symptoms = body,
            Field::ImageSummary => key_info.image_summary = Some(body).filter(|b| !b.is_empty()),
            Field::ImportantNotes => key_info.important_notes = body,
            Field::RiskLevel => key_info.risk_level = body,
            Field::SuggestedDepartment => key_info.suggested_department = body,
        }
    }

    recognized.then_some(key_info)
}

fn fill_defaults(key_info: &mut KeyInfo) {
    if key_info.chief_complaint.trim().is_empty() {
        key_info.chief_complaint = DEFAULT_CHIEF_COMPLAINT.to_string();
    }
    if key_info.risk_level.trim().is_empty() {
        key_info.risk_level = DEFAULT_RISK_LEVEL.to_string();
    }
    if key_info.important_notes.trim().is_empty() {
        key_info.important_notes = DEFAULT_IMPORTANT_NOTES.to_string();
    }
}

fn first_non_empty_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
