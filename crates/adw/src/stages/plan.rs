//! Plan stage: classify the issue, prepare the run's worktree and write the plan.

use adw_core::naming;
use adw_core::ports::PortPair;
use adw_core::state::RunStateUpdate;
use adw_core::types::{Instruction, Issue, IssueClass, RunId, Stage};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{Result, StageError, StageOutcome, StageRunner, OPS_AGENT};
use crate::executor::AgentInvoker;
use crate::git;
use crate::tracker::{IssueTracker, PullRequest};

pub const CLASSIFIER_AGENT: &str = "issue_classifier";
pub const PLANNER_AGENT: &str = "sdlc_planner";

/// Directory the planner writes plans into.
const SPECS_DIR: &str = "specs";

impl<A: AgentInvoker, T: IssueTracker> StageRunner<A, T> {
    pub(super) async fn plan(&self, issue_number: u64, run_id: &RunId) -> Result<StageOutcome> {
        let (mut state, created) = self.store.load_or_create(run_id)?;
        if created {
            state.model_set = self.config.model_set;
        }
        self.check_issue(&mut state, issue_number)?;
        self.post(issue_number, run_id, OPS_AGENT, "Starting planning").await;

        let issue = self.tracker.fetch_issue(issue_number).await?;
        let repo_root = self.paths.repo_root().to_path_buf();

        let class = match (state.issue_class, self.options.issue_class) {
            (Some(class), _) | (None, Some(class)) => class,
            (None, None) => self.classify(&state, &issue, &repo_root).await?,
        };
        self.post(
            issue_number,
            run_id,
            CLASSIFIER_AGENT,
            &format!("Issue classified as {}", class.as_str()),
        )
        .await;

        let branch = match &state.branch_name {
            Some(branch) => branch.clone(),
            None => naming::branch_name(class, issue_number, run_id, &issue.title),
        };
        let ports = match state.ports() {
            Some(ports) => ports,
            None => self.ports.allocate(run_id, &self.reserved_ports(run_id)?)?,
        };

        let worktree = self.worktrees.create(run_id, &branch)?;
        state.update(RunStateUpdate {
            issue_class: Some(class),
            branch_name: Some(branch.clone()),
            worktree_path: Some(worktree.clone()),
            ports: Some(ports),
            ..Default::default()
        })?;
        // Persist the worktree linkage before anything else can fail.
        self.store.save(&state, Stage::Plan)?;
        self.post(
            issue_number,
            run_id,
            OPS_AGENT,
            &format!(
                "Working on branch {branch} in {} (ports {ports})",
                worktree.display()
            ),
        )
        .await;

        self.worktrees
            .setup_environment(&worktree, ports, &self.config)
            .await?;

        let request = self
            .request(&state, PLANNER_AGENT, class.plan_instruction(), &worktree)
            .arg(issue_number.to_string())
            .arg(run_id.as_str())
            .arg(issue.to_json());
        let response = self.invoke_required(&request).await?;
        let plan_file = locate_plan_file(&worktree, &response.output, run_id).ok_or_else(|| {
            StageError::PlanMissing {
                worktree: worktree.clone(),
                output: adw_core::stream::truncate_output(
                    response.output.trim(),
                    self.config.max_error_chars,
                ),
            }
        })?;
        info!(run_id = %run_id, plan = %plan_file.display(), "plan written");

        state.update(RunStateUpdate {
            plan_file: Some(plan_file.clone()),
            ..Default::default()
        })?;
        self.post(
            issue_number,
            run_id,
            PLANNER_AGENT,
            &format!("Plan created: {}", plan_file.display()),
        )
        .await;

        let committed = self
            .commit_stage(&state, &worktree, PLANNER_AGENT, &issue.title)
            .await?;
        self.publish(&state, &worktree, &branch, &issue, &plan_file).await;

        self.finish(&mut state, Stage::Plan)?;
        self.post(issue_number, run_id, OPS_AGENT, "Planning complete").await;

        let mut outcome = StageOutcome::new(Stage::Plan, state);
        outcome.committed = committed;
        Ok(outcome)
    }

    async fn classify(
        &self,
        state: &adw_core::state::RunState,
        issue: &Issue,
        dir: &Path,
    ) -> Result<IssueClass> {
        let request = self
            .request(state, CLASSIFIER_AGENT, Instruction::ClassifyIssue, dir)
            .arg(issue.to_json());
        let response = self.invoke_required(&request).await?;
        IssueClass::from_classifier_output(&response.output).ok_or_else(|| {
            StageError::Classification {
                issue: issue.number,
                output: adw_core::stream::truncate_output(
                    response.output.trim(),
                    self.config.max_error_chars,
                ),
            }
        })
    }

    /// Port pairs held by other runs that are still active.
    fn reserved_ports(&self, run_id: &RunId) -> Result<Vec<PortPair>> {
        Ok(self
            .store
            .list()?
            .iter()
            .filter(|s| &s.run_id != run_id && self.worktrees.is_active(s))
            .filter_map(adw_core::state::RunState::ports)
            .collect())
    }

    /// Push the branch and open a pull request. Failures are reported, not fatal.
    async fn publish(
        &self,
        state: &adw_core::state::RunState,
        worktree: &Path,
        branch: &str,
        issue: &Issue,
        plan_file: &Path,
    ) {
        if !self.config.push_branches {
            return;
        }
        match git::has_remote(worktree, "origin") {
            Ok(true) => {}
            Ok(false) => {
                info!(run_id = %state.run_id, "no origin remote; not pushing");
                return;
            }
            Err(e) => {
                warn!(run_id = %state.run_id, error = %e, "could not inspect remotes");
                return;
            }
        }
        if let Err(e) = git::push_branch(worktree, branch) {
            warn!(run_id = %state.run_id, branch, error = %e, "push failed");
            return;
        }

        let class = state.issue_class.map_or("chore", |c| c.as_str());
        let pr = PullRequest {
            head: branch.to_string(),
            base: self.worktrees.base_branch().to_string(),
            title: format!("{class}: #{} - {}", issue.number, issue.title),
            body: format!(
                "Closes #{}\n\nRun: `{}`\nPlan: `{}`",
                issue.number,
                state.run_id,
                plan_file.display()
            ),
        };
        match self.tracker.open_pull_request(&pr).await {
            Ok(url) => {
                self.post(issue.number, &state.run_id, OPS_AGENT, &format!("Pull request: {url}"))
                    .await;
            }
            Err(e) => warn!(run_id = %state.run_id, error = %e, "failed to open pull request"),
        }
    }
}

/// Find the plan the planner wrote, relative to the worktree.
///
/// Prefers a path named in the agent's answer (last matching line wins),
/// then any `specs/*.md` whose name mentions the run ID.
fn locate_plan_file(worktree: &Path, output: &str, run_id: &RunId) -> Option<PathBuf> {
    let named = output.lines().rev().find_map(|line| {
        let candidate = line
            .trim()
            .trim_matches(|c: char| c == '`' || c == '"' || c == '\'' || c.is_whitespace());
        if candidate.is_empty() {
            return None;
        }
        let path = Path::new(candidate);
        let relative = path.strip_prefix(worktree).unwrap_or(path);
        worktree
            .join(relative)
            .is_file()
            .then(|| relative.to_path_buf())
    });
    if named.is_some() {
        return named;
    }

    let marker = format!("adw-{run_id}");
    let mut matches: Vec<PathBuf> = std::fs::read_dir(worktree.join(SPECS_DIR))
        .ok()?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".md") && name.contains(&marker))
        .map(|name| Path::new(SPECS_DIR).join(name))
        .collect();
    matches.sort();
    matches.pop()
}
