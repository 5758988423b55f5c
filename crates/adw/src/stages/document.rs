//! Document stage: write documentation for what the branch changed.

use adw_core::stream::truncate_output;
use adw_core::types::{Instruction, RunId, Stage};
use tracing::info;

use super::{Result, StageOutcome, StageRunner, OPS_AGENT};
use crate::executor::AgentInvoker;
use crate::git;
use crate::tracker::IssueTracker;

pub const DOCUMENTER_AGENT: &str = "documenter";

impl<A: AgentInvoker, T: IssueTracker> StageRunner<A, T> {
    pub(super) async fn document(&self, issue_number: u64, run_id: &RunId) -> Result<StageOutcome> {
        let mut state = self.load_run(issue_number, run_id)?;
        let worktree = self.worktree(&state)?;
        let plan_file = self.plan_file(&state, &worktree)?;
        let base = self.worktrees.base_branch();

        if !git::has_changes_since(&worktree, base)? {
            info!(run_id = %run_id, base, "branch has no changes; skipping documentation");
            self.post(
                issue_number,
                run_id,
                DOCUMENTER_AGENT,
                &format!("No changes against {base}; nothing to document"),
            )
            .await;
            self.finish(&mut state, Stage::Document)?;
            let mut outcome = StageOutcome::new(Stage::Document, state);
            outcome.skipped = true;
            return Ok(outcome);
        }

        self.post(issue_number, run_id, OPS_AGENT, "Starting documentation").await;
        let request = self
            .request(&state, DOCUMENTER_AGENT, Instruction::Document, &worktree)
            .arg(run_id.as_str())
            .arg(plan_file.display().to_string());
        let response = self.invoke_required(&request).await?;
        let doc = truncate_output(response.output.trim(), self.config.max_error_chars);
        self.post(
            issue_number,
            run_id,
            DOCUMENTER_AGENT,
            &format!("Documentation written: {doc}"),
        )
        .await;

        let committed = self
            .commit_stage(&state, &worktree, DOCUMENTER_AGENT, "add documentation")
            .await?;
        self.finish(&mut state, Stage::Document)?;
        self.post(issue_number, run_id, OPS_AGENT, "Documentation complete").await;

        let mut outcome = StageOutcome::new(Stage::Document, state);
        outcome.committed = committed;
        Ok(outcome)
    }
}
