//! Structured results returned by the agent for test and review work.
//!
//! The agent answers these instructions with JSON, sometimes wrapped in a
//! Markdown fence or preceded by prose. `extract_json` finds the payload
//! and deserializes it into the typed records below.

use crate::stream::truncate_output;
use crate::types::CheckOutcome;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Characters of the offending text quoted in parse errors.
const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum ResultParseError {
    #[error("no JSON payload found in agent output: {0}")]
    NoPayload(String),
    #[error("invalid JSON payload ({source}): {preview}")]
    Invalid {
        preview: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Locate and deserialize the JSON payload in agent text.
pub fn extract_json<T: DeserializeOwned>(text: &str) -> Result<T, ResultParseError> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    let candidate = fenced_block(trimmed)
        .or_else(|| bracketed(trimmed))
        .ok_or_else(|| ResultParseError::NoPayload(truncate_output(trimmed, PREVIEW_CHARS)))?;

    serde_json::from_str(candidate).map_err(|source| ResultParseError::Invalid {
        preview: truncate_output(candidate, PREVIEW_CHARS),
        source,
    })
}

/// Contents of the first ```` ``` ```` fence, language tag dropped.
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

/// From the first `[`/`{` to the last matching closer.
fn bracketed(text: &str) -> Option<&str> {
    let start = text.find(['[', '{'])?;
    let closer = if text[start..].starts_with('[') { ']' } else { '}' };
    let end = text.rfind(closer)?;
    (end > start).then(|| &text[start..=end])
}

/// One unit-style test as reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_name: String,
    pub passed: bool,
    #[serde(default)]
    pub execution_command: String,
    #[serde(default)]
    pub test_purpose: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl From<&TestResult> for CheckOutcome {
    fn from(test: &TestResult) -> Self {
        Self {
            name: test.test_name.clone(),
            passed: test.passed,
            error: test.error.clone(),
        }
    }
}

/// One browser-driven test as reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct E2eTestResult {
    pub test_name: String,
    /// `passed` or `failed`.
    pub status: String,
    #[serde(default)]
    pub test_path: String,
    #[serde(default)]
    pub screenshots: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl E2eTestResult {
    pub fn passed(&self) -> bool {
        self.status.eq_ignore_ascii_case("passed")
    }
}

impl From<&E2eTestResult> for CheckOutcome {
    fn from(test: &E2eTestResult) -> Self {
        Self {
            name: test.test_name.clone(),
            passed: test.passed(),
            error: test.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Skippable,
    TechDebt,
    Blocker,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub review_issue_number: u32,
    #[serde(default)]
    pub screenshot_path: String,
    pub issue_description: String,
    #[serde(default)]
    pub issue_resolution: String,
    pub issue_severity: IssueSeverity,
}

impl ReviewIssue {
    pub fn is_blocker(&self) -> bool {
        self.issue_severity == IssueSeverity::Blocker
    }
}

impl From<&ReviewIssue> for CheckOutcome {
    fn from(issue: &ReviewIssue) -> Self {
        Self {
            name: format!("review issue #{}", issue.review_issue_number),
            passed: !issue.is_blocker(),
            error: Some(issue.issue_description.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub success: bool,
    #[serde(default)]
    pub review_summary: String,
    #[serde(default)]
    pub review_issues: Vec<ReviewIssue>,
    #[serde(default)]
    pub screenshots: Vec<PathBuf>,
}

impl ReviewResult {
    pub fn blockers(&self) -> impl Iterator<Item = &ReviewIssue> {
        self.review_issues.iter().filter(|i| i.is_blocker())
    }
}
