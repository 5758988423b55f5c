//! Pipeline stages: plan, build, test, review, document, ship.
//!
//! `StageRunner` owns everything a stage needs (state store, worktree
//! manager, port allocator, agent, issue tracker) and runs one stage, or a
//! contiguous range of stages, for a single run. Each stage:
//! - loads the run state and checks its predecessors' outputs
//! - invokes the agent one or more times inside the run's worktree
//! - commits what it produced
//! - appends itself to the stage history and saves the state
//!
//! Failures abort the stage, post the bounded error to the issue and leave
//! previously saved state untouched.

mod build;
mod document;
mod plan;
mod review;
mod ship;
mod testing;

use adw_core::config::Config;
use adw_core::paths::RunPaths;
use adw_core::ports::{PortAllocator, PortError};
use adw_core::retry::RetryPolicy;
use adw_core::state::{RunState, StateError, StateStore};
use adw_core::stream::truncate_output;
use adw_core::types::{
    AgentRequest, AgentResponse, Instruction, IssueClass, PipelineState, RunId, Stage, StageResult,
};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::executor::{execute_with_retry, AgentInvoker};
use crate::git::{self, GitError};
use crate::logging::RunLog;
use crate::tracker::{self, IssueTracker, TrackerError};
use crate::worktree::{WorktreeError, WorktreeManager};

pub use review::REVIEW_AGENT;
pub use testing::{E2E_RUNNER_AGENT, TEST_RUNNER_AGENT};

/// Agent name used for pipeline-level status comments.
pub const OPS_AGENT: &str = "ops";

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("port allocation failed: {0}")]
    Ports(#[from] PortError),
    #[error("issue tracker error: {0}")]
    Tracker(#[from] TrackerError),
    #[error("run {run_id} not found; run the {stage} stage first")]
    UnknownRun { run_id: RunId, stage: Stage },
    #[error("the {0} stage needs an existing run id")]
    RunIdRequired(Stage),
    #[error("run {run_id} belongs to issue {recorded}, not {requested}")]
    IssueMismatch {
        run_id: RunId,
        recorded: u64,
        requested: u64,
    },
    #[error("agent {agent} failed {instruction}: {message}")]
    Agent {
        agent: String,
        instruction: Instruction,
        message: String,
    },
    #[error("could not classify issue {issue}: {output}")]
    Classification { issue: u64, output: String },
    #[error("plan file not found in {}: agent answered {output}", worktree.display())]
    PlanMissing { worktree: PathBuf, output: String },
    #[error("plan file {} recorded in state does not exist; run the plan stage again", path.display())]
    PlanFileGone { path: PathBuf },
    #[error("agent {agent} returned unreadable results: {message}")]
    InvalidResult { agent: String, message: String },
    #[error("run {run_id} is incomplete, missing: {}", fields.join(", "))]
    Incomplete {
        run_id: RunId,
        fields: Vec<&'static str>,
    },
}

pub type Result<T> = std::result::Result<T, StageError>;

/// Switches that change stage behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageOptions {
    /// Test stage: run only the unit loop.
    pub skip_e2e: bool,
    /// Review stage: report blockers without patching them.
    pub skip_resolution: bool,
    /// Plan stage: use this class instead of asking the classifier.
    pub issue_class: Option<IssueClass>,
}

/// Result of one check-and-resolve loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    /// `unit`, `e2e` or `review`.
    pub name: &'static str,
    /// Checks from the last attempt.
    pub result: StageResult,
    pub attempts: u32,
    /// Resolution invocations made across all attempts.
    pub resolutions: u32,
}

impl LoopOutcome {
    pub fn summary(&self) -> String {
        format!(
            "{}: {} after {} attempt(s), {} resolution(s)",
            self.name,
            self.result.summary(),
            self.attempts,
            self.resolutions
        )
    }
}

/// What a completed stage left behind.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub stage: Stage,
    pub state: RunState,
    /// Test and review loops, in the order they ran.
    pub loops: Vec<LoopOutcome>,
    /// The stage had nothing to do (e.g. document with no diff).
    pub skipped: bool,
    /// Whether the stage produced a commit.
    pub committed: bool,
}

impl StageOutcome {
    fn new(stage: Stage, state: RunState) -> Self {
        Self {
            stage,
            state,
            loops: Vec::new(),
            skipped: false,
            committed: false,
        }
    }

    pub fn all_checks_passed(&self) -> bool {
        self.loops.iter().all(|l| l.result.all_passed())
    }
}

#[derive(Debug)]
pub struct StageRunner<A, T> {
    config: Config,
    paths: RunPaths,
    store: StateStore,
    worktrees: WorktreeManager,
    ports: PortAllocator,
    agent: A,
    tracker: T,
    retry: RetryPolicy,
    options: StageOptions,
    run_log: Option<RunLog>,
}

impl<A: AgentInvoker, T: IssueTracker> StageRunner<A, T> {
    pub fn new(config: Config, repo_root: impl Into<PathBuf>, agent: A, tracker: T) -> Result<Self> {
        let paths = RunPaths::from_config(repo_root, &config);
        let worktrees = WorktreeManager::from_config(paths.clone(), &config)?;
        let ports = PortAllocator::new(config.port_ranges())?;
        Ok(Self {
            store: StateStore::new(paths.clone()),
            retry: config.retry_policy(),
            config,
            paths,
            worktrees,
            ports,
            agent,
            tracker,
            options: StageOptions::default(),
            run_log: None,
        })
    }

    pub fn with_options(mut self, options: StageOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Mirror each stage's events into its `execution.log`.
    pub fn with_run_log(mut self, run_log: RunLog) -> Self {
        self.run_log = Some(run_log);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn worktrees(&self) -> &WorktreeManager {
        &self.worktrees
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    /// Run a single stage, posting the error to the issue if it fails.
    ///
    /// `run_id` may be omitted only for the plan stage, which then starts a
    /// new run.
    pub async fn run_stage(
        &self,
        stage: Stage,
        issue_number: u64,
        run_id: Option<RunId>,
    ) -> Result<StageOutcome> {
        let run_id = match (stage, run_id) {
            (_, Some(run_id)) => run_id,
            (Stage::Plan, None) => RunId::generate(),
            (_, None) => return Err(StageError::RunIdRequired(stage)),
        };
        self.open_stage_log(&run_id, stage);

        info!(
            run_id = %run_id,
            issue = issue_number,
            stage = %stage,
            state = ?PipelineState::running(stage),
            "stage starting"
        );

        let result = match stage {
            Stage::Plan => self.plan(issue_number, &run_id).await,
            Stage::Build => self.build(issue_number, &run_id).await,
            Stage::Test => self.test(issue_number, &run_id).await,
            Stage::Review => self.review(issue_number, &run_id).await,
            Stage::Document => self.document(issue_number, &run_id).await,
            Stage::Ship => self.ship(issue_number, &run_id).await,
        };

        match &result {
            Ok(outcome) => info!(
                run_id = %run_id,
                stage = %stage,
                state = ?PipelineState::after(stage),
                skipped = outcome.skipped,
                committed = outcome.committed,
                "stage completed"
            ),
            Err(e) => {
                error!(
                    run_id = %run_id,
                    stage = %stage,
                    state = ?PipelineState::Failed,
                    error = %e,
                    "stage failed"
                );
                let message = truncate_output(
                    &format!("{stage} stage failed: {e}"),
                    self.config.max_error_chars,
                );
                self.post(issue_number, &run_id, OPS_AGENT, &message).await;
            }
        }
        result
    }

    /// Run `from..=to` in order for one run, stopping at the first failure.
    pub async fn run_pipeline(
        &self,
        issue_number: u64,
        run_id: Option<RunId>,
        from: Stage,
        to: Stage,
    ) -> Result<Vec<StageOutcome>> {
        let stages = Stage::range(from, to);
        if from != Stage::Plan && run_id.is_none() {
            return Err(StageError::RunIdRequired(from));
        }

        let mut run_id = run_id;
        let mut outcomes = Vec::with_capacity(stages.len());
        for stage in stages {
            let outcome = self.run_stage(stage, issue_number, run_id.clone()).await?;
            run_id = Some(outcome.state.run_id.clone());
            outcomes.push(outcome);
        }
        if let Some(run_id) = &run_id {
            info!(run_id = %run_id, from = %from, to = %to, "pipeline finished");
        }
        Ok(outcomes)
    }

    /// Remove a run's worktree, and its state directory when `purge_state`.
    pub fn cleanup(&self, run_id: &RunId, purge_state: bool) -> Result<()> {
        self.worktrees.remove(run_id)?;
        if purge_state {
            info!(run_id = %run_id, "removing run state");
            self.store.remove(run_id)?;
        }
        Ok(())
    }

    fn open_stage_log(&self, run_id: &RunId, stage: Stage) {
        if let Some(log) = &self.run_log {
            let path = self.paths.stage_log_file(run_id, stage);
            if let Err(e) = log.open(&path) {
                warn!(path = %path.display(), error = %e, "failed to open stage log");
            }
        }
    }

    /// State of an existing run for a stage that is not plan.
    fn load_run(&self, issue_number: u64, run_id: &RunId) -> Result<RunState> {
        let mut state = self
            .store
            .load(run_id)?
            .ok_or_else(|| StageError::UnknownRun {
                run_id: run_id.clone(),
                stage: Stage::Plan,
            })?;
        self.check_issue(&mut state, issue_number)?;
        Ok(state)
    }

    fn check_issue(&self, state: &mut RunState, issue_number: u64) -> Result<()> {
        match state.issue_number {
            Some(recorded) if recorded != issue_number => Err(StageError::IssueMismatch {
                run_id: state.run_id.clone(),
                recorded,
                requested: issue_number,
            }),
            Some(_) => Ok(()),
            None => {
                state.issue_number = Some(issue_number);
                Ok(())
            }
        }
    }

    /// Validated worktree of an existing run.
    fn worktree(&self, state: &RunState) -> Result<PathBuf> {
        state.require_worktree()?;
        Ok(self.worktrees.validate(&state.run_id, state)?)
    }

    /// Plan file of an existing run, confirmed present in the worktree.
    fn plan_file(&self, state: &RunState, worktree: &Path) -> Result<PathBuf> {
        let plan = state.require_plan_file()?;
        if !worktree.join(plan).is_file() {
            return Err(StageError::PlanFileGone {
                path: worktree.join(plan),
            });
        }
        Ok(plan.to_path_buf())
    }

    fn request(
        &self,
        state: &RunState,
        agent: &str,
        instruction: Instruction,
        dir: &Path,
    ) -> AgentRequest {
        AgentRequest::new(state.run_id.clone(), agent, instruction, dir).model_set(state.model_set)
    }

    async fn invoke(&self, request: &AgentRequest) -> AgentResponse {
        execute_with_retry(&self.agent, request, &self.retry).await
    }

    /// Invoke and turn a final failure into a stage error.
    async fn invoke_required(&self, request: &AgentRequest) -> Result<AgentResponse> {
        let response = self.invoke(request).await;
        if response.success {
            Ok(response)
        } else {
            Err(StageError::Agent {
                agent: request.agent_name.clone(),
                instruction: request.instruction,
                message: response.output,
            })
        }
    }

    async fn post(&self, issue_number: u64, run_id: &RunId, agent: &str, message: &str) {
        tracker::post_status(
            &self.tracker,
            &self.config.bot_identifier,
            issue_number,
            run_id,
            agent,
            message,
        )
        .await;
    }

    /// Commit the worktree's changes for `agent`.
    ///
    /// The message comes from `/commit`; if the agent fails the fallback is
    /// `<agent>: <class>: <summary>`. Returns `false` when there was nothing
    /// to commit.
    async fn commit_stage(
        &self,
        state: &RunState,
        worktree: &Path,
        agent: &str,
        summary: &str,
    ) -> Result<bool> {
        if git::is_working_tree_clean(worktree)? {
            debug!(run_id = %state.run_id, agent, "nothing to commit");
            return Ok(false);
        }

        let class = state.issue_class.map_or("chore", |c| c.as_str());
        let request = self
            .request(state, &format!("{agent}_committer"), Instruction::Commit, worktree)
            .arg(agent)
            .arg(class)
            .arg(summary);
        let response = self.invoke(&request).await;

        let message = response
            .success
            .then(|| commit_message_from(&response.output))
            .flatten()
            .unwrap_or_else(|| {
                warn!(
                    run_id = %state.run_id,
                    agent,
                    error = %response.output,
                    "commit message agent failed; using fallback"
                );
                format!("{agent}: {class}: {summary}")
            });

        let committed = git::commit_all(worktree, &message)?;
        if committed {
            info!(run_id = %state.run_id, agent, message = %message, "committed stage changes");
        }
        Ok(committed)
    }

    /// Record the stage and persist the whole record.
    fn finish(&self, state: &mut RunState, stage: Stage) -> Result<()> {
        state.append_stage(stage);
        self.store.save(state, stage)?;
        Ok(())
    }
}

/// First non-empty line of the agent's answer, stripped of quoting.
fn commit_message_from(output: &str) -> Option<String> {
    output
        .lines()
        .map(|l| l.trim().trim_matches(|c| c == '`' || c == '"' || c == '\''))
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_message_takes_first_line() {
        assert_eq!(
            commit_message_from("\n`sdlc_implementor: feat: add login`\n\nbody").as_deref(),
            Some("sdlc_implementor: feat: add login")
        );
        assert_eq!(commit_message_from("  \n "), None);
    }

    #[test]
    fn loop_summary() {
        let outcome = LoopOutcome {
            name: "unit",
            result: StageResult::new(vec![
                adw_core::types::CheckOutcome::pass("a"),
                adw_core::types::CheckOutcome::fail("b", "boom"),
            ]),
            attempts: 2,
            resolutions: 1,
        };
        assert_eq!(
            outcome.summary(),
            "unit: 1/2 passed after 2 attempt(s), 1 resolution(s)"
        );
    }
}
