//! Core types for the pipeline orchestrator.
//!
//! Run identifiers, the stage and classification enums, and the records
//! exchanged with the agent executor.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Length of generated run identifiers.
pub const RUN_ID_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("run id is empty")]
    EmptyRunId,
    #[error("run id {0:?} contains invalid character {1:?}")]
    InvalidRunIdChar(String, char),
    #[error("unknown {kind}: {value}")]
    Unknown { kind: &'static str, value: String },
}

/// Identifier for one end-to-end run of the pipeline.
///
/// Run IDs name directories (`agents/<id>`, `trees/<id>`) so they are
/// restricted to ASCII alphanumerics, `-` and `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh 8-character run ID.
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(hex[..RUN_ID_LEN].to_string())
    }

    pub fn parse(value: &str) -> Result<Self, ParseError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(ParseError::EmptyRunId);
        }
        if let Some(bad) = value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(ParseError::InvalidRunIdChar(value.to_string(), bad));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RunId {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

impl FromStr for RunId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Issue classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueClass {
    Feature,
    Bug,
    Chore,
}

impl IssueClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feature => "feature",
            Self::Bug => "bug",
            Self::Chore => "chore",
        }
    }

    /// Branch name prefix (e.g., `feat-issue-12-...`).
    pub fn branch_prefix(&self) -> &'static str {
        match self {
            Self::Feature => "feat",
            Self::Bug => "bug",
            Self::Chore => "chore",
        }
    }

    /// Planning instruction for this class of issue.
    pub fn plan_instruction(&self) -> Instruction {
        match self {
            Self::Feature => Instruction::Feature,
            Self::Bug => Instruction::Bug,
            Self::Chore => Instruction::Chore,
        }
    }

    /// Interpret the classifier's answer (`/feature`, `bug`, ...).
    ///
    /// Returns `None` for `0` or anything unrecognised.
    pub fn from_classifier_output(output: &str) -> Option<Self> {
        output.split_whitespace().find_map(|word| {
            word.trim_matches(|c: char| !c.is_ascii_alphanumeric())
                .parse()
                .ok()
        })
    }
}

impl FromStr for IssueClass {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches('/').to_ascii_lowercase().as_str() {
            "feature" | "feat" => Ok(Self::Feature),
            "bug" => Ok(Self::Bug),
            "chore" => Ok(Self::Chore),
            other => Err(ParseError::Unknown {
                kind: "issue class",
                value: other.to_string(),
            }),
        }
    }
}

/// Quality/cost tier selecting which model the agent uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSet {
    #[default]
    Base,
    Heavy,
}

impl ModelSet {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Heavy => "heavy",
        }
    }
}

impl FromStr for ModelSet {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "base" => Ok(Self::Base),
            "heavy" => Ok(Self::Heavy),
            other => Err(ParseError::Unknown {
                kind: "model set",
                value: other.to_string(),
            }),
        }
    }
}

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Plan,
    Build,
    Test,
    Review,
    Document,
    Ship,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 6] = [
        Stage::Plan,
        Stage::Build,
        Stage::Test,
        Stage::Review,
        Stage::Document,
        Stage::Ship,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Build => "build",
            Self::Test => "test",
            Self::Review => "review",
            Self::Document => "document",
            Self::Ship => "ship",
        }
    }

    /// The stage that follows this one, if any.
    pub fn next(&self) -> Option<Stage> {
        let idx = Self::ALL.iter().position(|s| s == self)?;
        Self::ALL.get(idx + 1).copied()
    }

    /// Stages from `from` through `to` inclusive, in pipeline order.
    pub fn range(from: Stage, to: Stage) -> Vec<Stage> {
        Self::ALL
            .iter()
            .copied()
            .filter(|s| *s >= from && *s <= to)
            .collect()
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s.trim())
            .ok_or_else(|| ParseError::Unknown {
                kind: "stage",
                value: s.to_string(),
            })
    }
}

/// Pipeline state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Planning,
    Building,
    Testing,
    Reviewing,
    Documenting,
    Shipping,
    Done,
    Failed,
}

impl PipelineState {
    /// State while `stage` executes.
    pub fn running(stage: Stage) -> Self {
        match stage {
            Stage::Plan => Self::Planning,
            Stage::Build => Self::Building,
            Stage::Test => Self::Testing,
            Stage::Review => Self::Reviewing,
            Stage::Document => Self::Documenting,
            Stage::Ship => Self::Shipping,
        }
    }

    /// State after `stage` completes successfully.
    pub fn after(stage: Stage) -> Self {
        stage.next().map_or(Self::Done, Self::running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Named unit of work sent to the external agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Instruction {
    ClassifyIssue,
    Feature,
    Bug,
    Chore,
    Implement,
    Test,
    ResolveFailedTest,
    TestE2e,
    ResolveFailedE2eTest,
    Review,
    Patch,
    Document,
    Commit,
}

impl Instruction {
    pub const ALL: [Instruction; 13] = [
        Instruction::ClassifyIssue,
        Instruction::Feature,
        Instruction::Bug,
        Instruction::Chore,
        Instruction::Implement,
        Instruction::Test,
        Instruction::ResolveFailedTest,
        Instruction::TestE2e,
        Instruction::ResolveFailedE2eTest,
        Instruction::Review,
        Instruction::Patch,
        Instruction::Document,
        Instruction::Commit,
    ];

    /// Slash-command form passed to the agent.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClassifyIssue => "/classify_issue",
            Self::Feature => "/feature",
            Self::Bug => "/bug",
            Self::Chore => "/chore",
            Self::Implement => "/implement",
            Self::Test => "/test",
            Self::ResolveFailedTest => "/resolve_failed_test",
            Self::TestE2e => "/test_e2e",
            Self::ResolveFailedE2eTest => "/resolve_failed_e2e_test",
            Self::Review => "/review",
            Self::Patch => "/patch",
            Self::Document => "/document",
            Self::Commit => "/commit",
        }
    }

    /// Name without the leading slash, for filenames.
    pub fn slug(&self) -> &'static str {
        &self.as_str()[1..]
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Instruction {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().trim_start_matches('/');
        Self::ALL
            .iter()
            .copied()
            .find(|i| i.slug() == wanted)
            .ok_or_else(|| ParseError::Unknown {
                kind: "instruction",
                value: s.to_string(),
            })
    }
}

/// Retry classification of an agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryCode {
    /// The agent process exited non-zero or reported an internal fault.
    TransientToolError,
    /// The agent process exceeded its time bound.
    Timeout,
    /// Invoking or parsing failed unexpectedly on our side.
    ExecutionError,
    /// The agent started but produced no usable result.
    ErrorDuringExecution,
    /// Success, or a failure retrying cannot fix.
    #[default]
    None,
}

impl RetryCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientToolError => "transient-tool-error",
            Self::Timeout => "timeout",
            Self::ExecutionError => "execution-error",
            Self::ErrorDuringExecution => "error-during-execution",
            Self::None => "none",
        }
    }
}

/// A request to run one instruction through the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub run_id: RunId,
    /// Agent name; scopes the artifact directory (`agents/<run>/<agent>/`).
    pub agent_name: String,
    pub instruction: Instruction,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub model_set: ModelSet,
}

impl AgentRequest {
    pub fn new(
        run_id: RunId,
        agent_name: impl Into<String>,
        instruction: Instruction,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            run_id,
            agent_name: agent_name.into(),
            instruction,
            args: Vec::new(),
            working_dir: working_dir.into(),
            model_set: ModelSet::Base,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn model_set(mut self, model_set: ModelSet) -> Self {
        self.model_set = model_set;
        self
    }

    /// The single textual instruction handed to the agent.
    pub fn prompt(&self) -> String {
        if self.args.is_empty() {
            self.instruction.as_str().to_string()
        } else {
            format!("{} {}", self.instruction.as_str(), self.args.join(" "))
        }
    }
}

/// Outcome of one agent invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub success: bool,
    /// Result text, or bounded error text on failure.
    pub output: String,
    pub session_id: Option<String>,
    pub retry_code: RetryCode,
}

impl AgentResponse {
    pub fn succeeded(output: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            session_id,
            retry_code: RetryCode::None,
        }
    }

    pub fn failed(output: impl Into<String>, retry_code: RetryCode) -> Self {
        Self {
            success: false,
            output: output.into(),
            session_id: None,
            retry_code,
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

/// Issue as seen by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
}

impl Issue {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"number\":{}}}", self.number))
    }
}

/// Outcome of a single check inside the test or review stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub name: String,
    pub passed: bool,
    pub error: Option<String>,
}

impl CheckOutcome {
    pub fn pass(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            error: None,
        }
    }

    pub fn fail(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            error: Some(error.into()),
        }
    }
}

/// Ordered check outcomes from one stage loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub checks: Vec<CheckOutcome>,
}

impl StageResult {
    pub fn new(checks: Vec<CheckOutcome>) -> Self {
        Self { checks }
    }

    pub fn passed_count(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }

    pub fn failed_count(&self) -> usize {
        self.checks.len() - self.passed_count()
    }

    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.checks.iter().filter(|c| !c.passed)
    }

    /// `"2/3 passed"`.
    pub fn summary(&self) -> String {
        format!("{}/{} passed", self.passed_count(), self.checks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_run_ids_are_eight_hex_chars() {
        let id = RunId::generate();
        assert_eq!(id.as_str().len(), RUN_ID_LEN);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn run_id_rejects_path_separators() {
        assert!(matches!(
            RunId::parse("../etc"),
            Err(ParseError::InvalidRunIdChar(_, '.'))
        ));
        assert_eq!(RunId::parse("  "), Err(ParseError::EmptyRunId));
        assert_eq!(RunId::parse("abc12345").unwrap().as_str(), "abc12345");
    }

    #[test]
    fn run_id_serializes_as_plain_string() {
        let id = RunId::parse("abc12345").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc12345\"");
        let bad: Result<RunId, _> = serde_json::from_str("\"a/b\"");
        assert!(bad.is_err());
    }

    #[test]
    fn classifier_output_variants() {
        assert_eq!(
            IssueClass::from_classifier_output("/feature"),
            Some(IssueClass::Feature)
        );
        assert_eq!(
            IssueClass::from_classifier_output("  /bug\n"),
            Some(IssueClass::Bug)
        );
        assert_eq!(
            IssueClass::from_classifier_output("chore"),
            Some(IssueClass::Chore)
        );
        assert_eq!(IssueClass::from_classifier_output("0"), None);
        assert_eq!(IssueClass::from_classifier_output(""), None);
    }

    #[test]
    fn stage_order_and_range() {
        assert_eq!(Stage::Plan.next(), Some(Stage::Build));
        assert_eq!(Stage::Ship.next(), None);
        assert_eq!(
            Stage::range(Stage::Test, Stage::Document),
            vec![Stage::Test, Stage::Review, Stage::Document]
        );
        assert!(Stage::range(Stage::Ship, Stage::Plan).is_empty());
    }

    #[test]
    fn pipeline_state_advances_to_done() {
        assert_eq!(PipelineState::after(Stage::Plan), PipelineState::Building);
        assert_eq!(PipelineState::after(Stage::Ship), PipelineState::Done);
        assert!(PipelineState::Failed.is_terminal());
        assert!(!PipelineState::running(Stage::Test).is_terminal());
    }

    #[test]
    fn instruction_parses_with_or_without_slash() {
        assert_eq!("/implement".parse::<Instruction>().unwrap(), Instruction::Implement);
        assert_eq!("test_e2e".parse::<Instruction>().unwrap(), Instruction::TestE2e);
        assert!("/nope".parse::<Instruction>().is_err());
        assert_eq!(Instruction::ResolveFailedTest.slug(), "resolve_failed_test");
    }

    #[test]
    fn request_prompt_joins_args() {
        let req = AgentRequest::new(
            RunId::parse("abc12345").unwrap(),
            "sdlc_implementor",
            Instruction::Implement,
            "/tmp",
        )
        .arg("specs/plan.md");
        assert_eq!(req.prompt(), "/implement specs/plan.md");
    }

    #[test]
    fn retry_code_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&RetryCode::ErrorDuringExecution).unwrap(),
            "\"error-during-execution\""
        );
        assert_eq!(RetryCode::TransientToolError.as_str(), "transient-tool-error");
    }

    #[test]
    fn stage_result_counts() {
        let result = StageResult::new(vec![
            CheckOutcome::pass("a"),
            CheckOutcome::fail("b", "boom"),
            CheckOutcome::pass("c"),
        ]);
        assert_eq!(result.passed_count(), 2);
        assert_eq!(result.failed_count(), 1);
        assert!(!result.all_passed());
        assert_eq!(result.summary(), "2/3 passed");
        assert_eq!(result.failures().next().unwrap().name, "b");
    }
}
