use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    #[default]
    Success,
    Failed,
    Cancelled,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Failed => write!(f, "failed"),
            Outcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResponseHeaders {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requires_reload: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requires_restart: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ResponseHeaders {
    pub fn is_empty(&self) -> bool {
        !self.requires_reload && !self.requires_restart && self.warnings.is_empty()
    }

    /// Drop repeated warnings, keeping the first occurrence of each.
    pub fn dedup_warnings(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.warnings.retain(|w| seen.insert(w.clone()));
    }
}

/// The stable result contract of an executed operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Response {
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_description: Option<Value>,
    #[serde(default)]
    pub rolled_back: bool,
    #[serde(default, skip_serializing_if = "ResponseHeaders::is_empty")]
    pub response_headers: ResponseHeaders,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn is_failed(&self) -> bool {
        self.failure_description.is_some() || self.outcome != Outcome::Success
    }

    /// Record a failure. The first description wins; later ones are ignored.
    pub fn fail(&mut self, description: impl Into<Value>) {
        if self.failure_description.is_none() {
            self.failure_description = Some(description.into());
        }
        if self.outcome == Outcome::Success {
            self.outcome = Outcome::Failed;
        }
    }

    pub fn failure_message(&self) -> Option<String> {
        self.failure_description.as_ref().map(|d| match d {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.response_headers.warnings.push(warning.into());
    }
}
