//! Error taxonomy and problem documents.
//!
//! Load-time errors (`SpecError`, `RuleError`) halt startup. Runtime errors
//! are folded into `EngineError` by the request pipeline and shaped as
//! RFC 7807 `application/problem+json` bodies; they never crash the server.

use serde::Serialize;
use thiserror::Error;

use crate::schema::ValidationIssue;
use crate::store::StoreError;
use crate::template::TemplateError;

/// Errors raised while loading and indexing the OpenAPI document.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("failed to read spec file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse spec document: {0}")]
    Parse(String),
    #[error("dangling reference: {0}")]
    DanglingRef(String),
    #[error("non-local reference not supported: {0}")]
    NonLocalRef(String),
    #[error("invalid spec document: {0}")]
    Invalid(String),
    #[error("invalid path template {template}: {reason}")]
    BadPathTemplate { template: String, reason: String },
}

/// Errors raised while loading the scenarios file.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("failed to read rules file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse rules document: {0}")]
    Parse(String),
    #[error("scenario #{index}: {message}")]
    Malformed { index: usize, message: String },
}

/// Runtime error categories observed while serving a single request.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no operation matches {method} {path}")]
    MatchMiss { method: String, path: String },
    #[error("request validation failed ({} issue(s))", .0.len())]
    RequestInvalid(Vec<ValidationIssue>),
    #[error("rule action failed: {0}")]
    RuleFailure(String),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("response validation failed ({} issue(s))", .0.len())]
    ResponseInvalid(Vec<ValidationIssue>),
    #[error("request deadline exceeded")]
    Deadline,
}

impl EngineError {
    /// HTTP status carried by the problem document for this category.
    pub fn status(&self) -> u16 {
        match self {
            EngineError::MatchMiss { .. } => 404,
            EngineError::RequestInvalid(_) => 400,
            EngineError::Deadline => 504,
            _ => 500,
        }
    }

    /// Category tag used in structured log lines.
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::MatchMiss { .. } => "match-miss",
            EngineError::RequestInvalid(_) => "request-invalid",
            EngineError::RuleFailure(_) => "rule-failure",
            EngineError::Template(_) => "template-failure",
            EngineError::Store(_) => "store-failure",
            EngineError::ResponseInvalid(_) => "response-invalid",
            EngineError::Deadline => "deadline",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            EngineError::MatchMiss { .. } => "Not Found",
            EngineError::RequestInvalid(_) => "Bad Request",
            EngineError::RuleFailure(_) => "Rule Execution Failed",
            EngineError::Template(_) => "Template Evaluation Failed",
            EngineError::Store(_) => "State Store Failure",
            EngineError::ResponseInvalid(_) => "Response Validation Failed",
            EngineError::Deadline => "Gateway Timeout",
        }
    }

    /// Shape this error as an RFC 7807 problem document.
    pub fn into_problem(self, instance: Option<String>) -> Problem {
        let status = self.status();
        let title = self.title();
        let type_uri = format!("urn:sandbox:{}", self.category());
        let details = match &self {
            EngineError::RequestInvalid(issues) | EngineError::ResponseInvalid(issues) => {
                Some(issues.clone())
            }
            _ => None,
        };
        Problem {
            type_uri,
            title: title.to_string(),
            status,
            detail: Some(self.to_string()),
            instance,
            details,
        }
    }
}

/// RFC 7807 problem document with a `details` extension carrying validator
/// issues.
#[derive(Debug, Clone, Serialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub type_uri: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<ValidationIssue>>,
}

impl Problem {
    pub fn new(status: u16, type_uri: &str, title: &str) -> Self {
        Problem {
            type_uri: type_uri.to_string(),
            title: title.to_string(),
            status,
            detail: None,
            instance: None,
            details: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({
                "type": "about:blank",
                "title": self.title,
                "status": self.status,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_status_mapping() {
        let miss = EngineError::MatchMiss {
            method: "GET".into(),
            path: "/nope".into(),
        };
        assert_eq!(miss.status(), 404);
        assert_eq!(EngineError::RequestInvalid(vec![]).status(), 400);
        assert_eq!(EngineError::RuleFailure("boom".into()).status(), 500);
        assert_eq!(EngineError::Deadline.status(), 504);
    }

    #[test]
    fn test_problem_serialization_skips_empty_fields() {
        let problem = Problem::new(404, "urn:sandbox:match-miss", "Not Found");
        let value = problem.to_value();
        assert_eq!(value["status"], 404);
        assert_eq!(value["type"], "urn:sandbox:match-miss");
        assert!(value.get("detail").is_none());
        assert!(value.get("details").is_none());
    }

    #[test]
    fn test_into_problem_carries_validation_details() {
        let issue = ValidationIssue {
            instance_path: "/body/name".into(),
            schema_path: "/properties/name/type".into(),
            keyword: "type".into(),
            message: "expected string".into(),
            params: serde_json::json!({"type": "string"}),
        };
        let problem = EngineError::RequestInvalid(vec![issue]).into_problem(Some("/users".into()));
        assert_eq!(problem.status, 400);
        assert_eq!(problem.details.as_ref().map(Vec::len), Some(1));
        assert_eq!(problem.instance.as_deref(), Some("/users"));
    }
}
