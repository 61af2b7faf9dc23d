//! Questionnaire intake composition.
//!
//! Turns a questionnaire submission into the free-text patient description
//! the pipeline consumes. Labels, department names and user profiles come
//! from a [`Directory`], which stands in for the persistence layer.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fallback::truncate_detail;
use crate::models::{AnalysisOutcome, AnalysisRequest};

const LIST_SEPARATOR: &str = "、";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionLabel {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    pub name: String,
    pub gender: String,
    pub age: Option<u32>,
}

#[async_trait]
pub trait Directory: Send + Sync {
    /// Questions of a form in display order
    async fn question_labels(&self, questionnaire_id: &str) -> anyhow::Result<Vec<QuestionLabel>>;

    async fn department_name(&self, department_id: &str) -> anyhow::Result<Option<String>>;

    async fn user_profile(&self, user_id: &str) -> anyhow::Result<Option<UserProfile>>;
}

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Unknown department: {0}")]
    UnknownDepartment(String),

    #[error("Directory lookup failed: {0}")]
    Lookup(#[from] anyhow::Error),
}

impl From<IntakeError> for AnalysisOutcome {
    fn from(error: IntakeError) -> Self {
        match error {
            IntakeError::UnknownDepartment(id) => AnalysisOutcome::DepartmentMismatch {
                message: format!("未找到科室：{id}"),
            },
            IntakeError::Lookup(e) => AnalysisOutcome::InternalError {
                detail: truncate_detail(&e.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntakeSubmission {
    pub questionnaire_id: String,
    pub department_id: String,
    pub user_id: String,
    #[serde(default)]
    pub answers: BTreeMap<String, Value>,
}

/// Patient text and resolved department name of one submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedIntake {
    pub department: String,
    pub patient_text: String,
}

impl ComposedIntake {
    pub fn into_request(self) -> AnalysisRequest {
        AnalysisRequest::new(self.patient_text, self.department)
    }
}

pub async fn compose_patient_text(
    directory: &dyn Directory,
    submission: &IntakeSubmission,
) -> Result<ComposedIntake, IntakeError> {
    let department = directory
        .department_name(&submission.department_id)
        .await?
        .ok_or_else(|| IntakeError::UnknownDepartment(submission.department_id.clone()))?;

    let profile = match directory.user_profile(&submission.user_id).await? {
        Some(profile) => profile,
        None => {
            warn!(user_id = %submission.user_id, "No profile for user, composing without one");
            UserProfile::default()
        }
    };
    let labels = directory.question_labels(&submission.questionnaire_id).await?;

    let mut text = String::from("**患者基本信息**\n");
    text.push_str(&format!("姓名：{}\n", or_unknown(&profile.name)));
    text.push_str(&format!("性别：{}\n", or_unknown(&profile.gender)));
    match profile.age {
        Some(age) => text.push_str(&format!("年龄：{age} 岁\n")),
        None => text.push_str("年龄：未知\n"),
    }
    text.push_str(&format!("就诊科室：{department}\n"));

    text.push_str("\n**问卷回答**\n");
    let mut seen = HashSet::new();
    let mut answered = 0usize;
    for question in &labels {
        seen.insert(question.id.as_str());
        if let Some(answer) = submission.answers.get(&question.id).and_then(render_answer) {
            text.push_str(&format!("{}：{answer}\n", question.label));
            answered += 1;
        }
    }
    // Answers to questions the form no longer lists keep their id as label
    for (id, value) in &submission.answers {
        if seen.contains(id.as_str()) {
            continue;
        }
        if let Some(answer) = render_answer(value) {
            text.push_str(&format!("{id}：{answer}\n"));
            answered += 1;
        }
    }

    debug!(
        questionnaire_id = %submission.questionnaire_id,
        %department,
        answered,
        "Composed patient text"
    );

    Ok(ComposedIntake {
        department,
        patient_text: text,
    })
}

fn or_unknown(value: &str) -> &str {
    if value.trim().is_empty() { "未知" } else { value.trim() }
}

fn render_answer(value: &Value) -> Option<String> {
    let rendered = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        Value::Bool(true) => "是".to_string(),
        Value::Bool(false) => "否".to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(render_answer)
            .collect::<Vec<_>>()
            .join(LIST_SEPARATOR),
        Value::Object(_) => value.to_string(),
    };
    (!rendered.is_empty()).then_some(rendered)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DirectorySeed {
    questionnaires: HashMap<String, Vec<QuestionLabel>>,
    departments: HashMap<String, String>,
    users: HashMap<String, UserProfile>,
}

/// Directory held in memory, optionally seeded from a JSON file
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    questionnaires: DashMap<String, Vec<QuestionLabel>>,
    departments: DashMap<String, String>,
    users: DashMap<String, UserProfile>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Departments addressable by their own name
    pub fn with_departments<I, S>(departments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let directory = Self::new();
        for name in departments {
            let name = name.into();
            directory.departments.insert(name.clone(), name);
        }
        directory
    }

    pub async fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await?;
        let directory = Self::from_json(&raw)?;
        info!(
            path = %path.display(),
            questionnaires = directory.questionnaires.len(),
            departments = directory.departments.len(),
            users = directory.users.len(),
            "Directory loaded"
        );
        Ok(directory)
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let seed: DirectorySeed = serde_json::from_str(raw)?;
        Ok(Self {
            questionnaires: seed.questionnaires.into_iter().collect(),
            departments: seed.departments.into_iter().collect(),
            users: seed.users.into_iter().collect(),
        })
    }

    pub fn insert_questionnaire(&self, id: impl Into<String>, questions: Vec<QuestionLabel>) {
        self.questionnaires.insert(id.into(), questions);
    }

    pub fn insert_department(&self, id: impl Into<String>, name: impl Into<String>) {
        self.departments.insert(id.into(), name.into());
    }

    pub fn insert_user(&self, id: impl Into<String>, profile: UserProfile) {
        self.users.insert(id.into(), profile);
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn question_labels(&self, questionnaire_id: &str) -> anyhow::Result<Vec<QuestionLabel>> {
        Ok(self
            .questionnaires
            .get(questionnaire_id)
            .map(|q| q.value().clone())
            .unwrap_or_default())
    }

    async fn department_name(&self, department_id: &str) -> anyhow::Result<Option<String>> {
        Ok(self.departments.get(department_id).map(|d| d.value().clone()))
    }

    async fn user_profile(&self, user_id: &str) -> anyhow::Result<Option<UserProfile>> {
        Ok(self.users.get(user_id).map(|u| u.value().clone()))
    }
}
