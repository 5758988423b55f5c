//! Ship stage: merge the run branch into the base branch of the main checkout.

use adw_core::types::{RunId, Stage};
use std::path::Path;
use tracing::{info, warn};

use super::{Result, StageError, StageOutcome, StageRunner, OPS_AGENT};
use crate::executor::AgentInvoker;
use crate::git;
use crate::tracker::IssueTracker;

pub const SHIPPER_AGENT: &str = "shipper";

impl<A: AgentInvoker, T: IssueTracker> StageRunner<A, T> {
    pub(super) async fn ship(&self, issue_number: u64, run_id: &RunId) -> Result<StageOutcome> {
        let mut state = self.load_run(issue_number, run_id)?;
        let missing = state.missing_fields();
        if !missing.is_empty() {
            return Err(StageError::Incomplete {
                run_id: run_id.clone(),
                fields: missing,
            });
        }
        let worktree = self.worktree(&state)?;
        let branch = state.require_branch()?.to_string();
        self.post(issue_number, run_id, OPS_AGENT, "Starting ship").await;

        let committed = self
            .commit_stage(&state, &worktree, SHIPPER_AGENT, "final changes")
            .await?;

        let base = self.worktrees.base_branch();
        let repo_root = self.paths.repo_root();
        let message = format!("Merge {branch} (issue #{issue_number}, run {run_id})");
        merge_into_base(repo_root, base, &branch, &message)?;
        info!(run_id = %run_id, branch = %branch, base, "branch merged");

        if self.config.push_branches && git::has_remote(repo_root, "origin")? {
            if let Err(e) = git::push_branch(repo_root, base) {
                warn!(run_id = %run_id, base, error = %e, "push of base branch failed");
                self.post(
                    issue_number,
                    run_id,
                    SHIPPER_AGENT,
                    &format!("Merged locally but push failed: {e}"),
                )
                .await;
            }
        }

        self.finish(&mut state, Stage::Ship)?;
        self.post(
            issue_number,
            run_id,
            SHIPPER_AGENT,
            &format!("Shipped: {branch} merged into {base}"),
        )
        .await;

        let mut outcome = StageOutcome::new(Stage::Ship, state);
        outcome.committed = committed;
        Ok(outcome)
    }
}

/// Merge `branch` into `base` in the main checkout, restoring whatever
/// branch was checked out before.
fn merge_into_base(repo_root: &Path, base: &str, branch: &str, message: &str) -> git::Result<()> {
    let original = git::current_branch(repo_root)?;
    let switched = original.as_deref() != Some(base);
    if switched {
        git::checkout_branch(repo_root, base)?;
    }

    let merged = git::merge_no_ff(repo_root, branch, message);

    if switched {
        if let Some(original) = &original {
            if let Err(e) = git::checkout_branch(repo_root, original) {
                warn!(branch = %original, error = %e, "failed to restore original branch");
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::{run, setup_test_repo};

    #[test]
    fn merge_restores_original_branch() {
        let repo = setup_test_repo();
        let root = repo.path();
        let base = git::detect_default_branch(root).unwrap();

        git::create_branch(root, "feat-x", &base).unwrap();
        git::checkout_branch(root, "feat-x").unwrap();
        std::fs::write(root.join("feature.txt"), "x").unwrap();
        run(root, &["add", "feature.txt"]);
        run(root, &["commit", "-m", "add feature"]);
        git::create_branch(root, "other", &base).unwrap();
        git::checkout_branch(root, "other").unwrap();

        merge_into_base(root, &base, "feat-x", "Merge feat-x").unwrap();

        assert_eq!(git::current_branch(root).unwrap().as_deref(), Some("other"));
        git::checkout_branch(root, &base).unwrap();
        assert!(root.join("feature.txt").exists());
    }
}
