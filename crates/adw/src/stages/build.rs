//! Build stage: implement the plan inside the run's worktree.

use adw_core::types::{Instruction, RunId, Stage};
use tracing::info;

use super::{Result, StageOutcome, StageRunner, OPS_AGENT};
use crate::executor::AgentInvoker;
use crate::tracker::IssueTracker;

pub const IMPLEMENTOR_AGENT: &str = "sdlc_implementor";

impl<A: AgentInvoker, T: IssueTracker> StageRunner<A, T> {
    pub(super) async fn build(&self, issue_number: u64, run_id: &RunId) -> Result<StageOutcome> {
        let mut state = self.load_run(issue_number, run_id)?;
        let worktree = self.worktree(&state)?;
        let plan_file = self.plan_file(&state, &worktree)?;
        self.post(issue_number, run_id, OPS_AGENT, "Starting implementation").await;

        let request = self
            .request(&state, IMPLEMENTOR_AGENT, Instruction::Implement, &worktree)
            .arg(plan_file.display().to_string());
        let response = self.invoke_required(&request).await?;
        info!(run_id = %run_id, plan = %plan_file.display(), "plan implemented");
        self.post(issue_number, run_id, IMPLEMENTOR_AGENT, "Implementation complete")
            .await;

        let summary = first_line(&response.output).unwrap_or("implement plan");
        let committed = self
            .commit_stage(&state, &worktree, IMPLEMENTOR_AGENT, summary)
            .await?;

        self.finish(&mut state, Stage::Build)?;
        self.post(issue_number, run_id, OPS_AGENT, "Build complete").await;

        let mut outcome = StageOutcome::new(Stage::Build, state);
        outcome.committed = committed;
        Ok(outcome)
    }
}

fn first_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|l| !l.is_empty())
}
