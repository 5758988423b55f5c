//! Issue-tracker boundary.
//!
//! Stages read the issue, post progress comments and open a pull request
//! through `IssueTracker`. The production implementation shells out to the
//! `gh` CLI inside the repository; tests use in-memory fakes.

use adw_core::types::{Issue, RunId};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Bound on any single `gh` call.
const GH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("failed to run gh: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("gh {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("gh {command} timed out after {}s", GH_TIMEOUT.as_secs())]
    Timeout { command: String },
    #[error("unexpected gh output: {0}")]
    Parse(#[source] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrackerError>;

/// Pull request to open for a run branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

pub trait IssueTracker: Send + Sync {
    fn fetch_issue(&self, number: u64) -> impl Future<Output = Result<Issue>> + Send;

    fn post_comment(&self, number: u64, body: &str) -> impl Future<Output = Result<()>> + Send;

    /// Returns the pull request URL.
    fn open_pull_request(&self, pr: &PullRequest) -> impl Future<Output = Result<String>> + Send;
}

/// `<bot> <run_id>_<agent>: <message>`.
pub fn format_comment(bot_identifier: &str, run_id: &RunId, agent: &str, message: &str) -> String {
    format!("{bot_identifier} {run_id}_{agent}: {message}")
}

/// Post a status comment; failures are logged and swallowed.
pub async fn post_status<T: IssueTracker>(
    tracker: &T,
    bot_identifier: &str,
    issue_number: u64,
    run_id: &RunId,
    agent: &str,
    message: &str,
) {
    let body = format_comment(bot_identifier, run_id, agent, message);
    if let Err(e) = tracker.post_comment(issue_number, &body).await {
        warn!(
            run_id = %run_id,
            issue = issue_number,
            error = %e,
            "failed to post status comment"
        );
    }
}

/// Tracker backed by the GitHub CLI.
#[derive(Debug, Clone)]
pub struct GhCliTracker {
    repo_root: PathBuf,
    gh_bin: PathBuf,
}

impl GhCliTracker {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            gh_bin: PathBuf::from("gh"),
        }
    }

    pub fn with_bin(mut self, gh_bin: impl Into<PathBuf>) -> Self {
        self.gh_bin = gh_bin.into();
        self
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    async fn gh(&self, args: &[&str]) -> Result<String> {
        let command = args.iter().take(2).copied().collect::<Vec<_>>().join(" ");
        debug!(command = %command, "running gh");

        let output = Command::new(&self.gh_bin)
            .args(args)
            .current_dir(&self.repo_root)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(GH_TIMEOUT, output)
            .await
            .map_err(|_| TrackerError::Timeout {
                command: command.clone(),
            })?
            .map_err(TrackerError::Spawn)?;

        if !output.status.success() {
            return Err(TrackerError::CommandFailed {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl IssueTracker for GhCliTracker {
    async fn fetch_issue(&self, number: u64) -> Result<Issue> {
        let number = number.to_string();
        let json = self
            .gh(&["issue", "view", &number, "--json", "number,title,body"])
            .await?;
        serde_json::from_str(&json).map_err(TrackerError::Parse)
    }

    async fn post_comment(&self, number: u64, body: &str) -> Result<()> {
        let number = number.to_string();
        self.gh(&["issue", "comment", &number, "--body", body])
            .await
            .map(|_| ())
    }

    async fn open_pull_request(&self, pr: &PullRequest) -> Result<String> {
        self.gh(&[
            "pr", "create", "--head", &pr.head, "--base", &pr.base, "--title", &pr.title,
            "--body", &pr.body,
        ])
        .await
    }
}
