//! Review stage: review the branch against its plan and patch blockers.

use adw_core::results::{extract_json, ReviewIssue, ReviewResult};
use adw_core::state::RunState;
use adw_core::types::{CheckOutcome, Instruction, RunId, Stage, StageResult};
use std::path::Path;
use tracing::{info, warn};

use super::{LoopOutcome, Result, StageError, StageOutcome, StageRunner, OPS_AGENT};
use crate::executor::AgentInvoker;
use crate::tracker::IssueTracker;

pub const REVIEW_AGENT: &str = "reviewer";
pub const PATCH_PLANNER_AGENT: &str = "review_patch_planner";
pub const PATCH_IMPLEMENTOR_AGENT: &str = "review_implementor";

impl<A: AgentInvoker, T: IssueTracker> StageRunner<A, T> {
    pub(super) async fn review(&self, issue_number: u64, run_id: &RunId) -> Result<StageOutcome> {
        let mut state = self.load_run(issue_number, run_id)?;
        let worktree = self.worktree(&state)?;
        let plan_file = self.plan_file(&state, &worktree)?;
        self.post(issue_number, run_id, OPS_AGENT, "Starting review").await;

        let max_attempts = self.config.review_max_attempts.max(1);
        let mut resolutions = 0;
        let mut attempt = 0;
        let (review, result) = loop {
            attempt += 1;
            let review = self.run_review(&state, &worktree, &plan_file).await?;
            let result = StageResult::new(review.review_issues.iter().map(CheckOutcome::from).collect());
            let blockers = review.blockers().count();
            info!(
                run_id = %run_id,
                attempt,
                issues = review.review_issues.len(),
                blockers,
                "review finished"
            );

            if blockers == 0 {
                break (review, result);
            }
            if self.options.skip_resolution {
                info!(run_id = %run_id, "skipping blocker resolution");
                break (review, result);
            }
            if attempt >= max_attempts {
                warn!(run_id = %run_id, attempt, "review attempts exhausted");
                break (review, result);
            }

            let mut resolved = 0;
            for (idx, issue) in review.blockers().enumerate() {
                resolutions += 1;
                if self
                    .patch_blocker(&state, &worktree, &plan_file, issue, attempt, idx)
                    .await
                {
                    resolved += 1;
                }
            }
            if resolved == 0 {
                info!(run_id = %run_id, attempt, "no blockers resolved; stopping");
                break (review, result);
            }
        };

        let outcome_loop = LoopOutcome {
            name: "review",
            result,
            attempts: attempt,
            resolutions,
        };
        self.post(
            issue_number,
            run_id,
            REVIEW_AGENT,
            &review_report(&review, &outcome_loop),
        )
        .await;

        let committed = self
            .commit_stage(
                &state,
                &worktree,
                REVIEW_AGENT,
                &format!("review {}", outcome_loop.result.summary()),
            )
            .await?;
        self.finish(&mut state, Stage::Review)?;
        self.post(issue_number, run_id, OPS_AGENT, "Review complete").await;

        let mut outcome = StageOutcome::new(Stage::Review, state);
        outcome.loops.push(outcome_loop);
        outcome.committed = committed;
        Ok(outcome)
    }

    async fn run_review(
        &self,
        state: &RunState,
        worktree: &Path,
        plan_file: &Path,
    ) -> Result<ReviewResult> {
        let request = self
            .request(state, REVIEW_AGENT, Instruction::Review, worktree)
            .arg(state.run_id.as_str())
            .arg(plan_file.display().to_string())
            .arg(REVIEW_AGENT);
        let response = self.invoke_required(&request).await?;
        extract_json(&response.output).map_err(|e| StageError::InvalidResult {
            agent: REVIEW_AGENT.to_string(),
            message: e.to_string(),
        })
    }

    /// `/patch` writes a patch plan for one blocker, `/implement` applies it.
    async fn patch_blocker(
        &self,
        state: &RunState,
        worktree: &Path,
        plan_file: &Path,
        issue: &ReviewIssue,
        attempt: u32,
        idx: usize,
    ) -> bool {
        let change_request = format!("{}\n\n{}", issue.issue_description, issue.issue_resolution);
        let planner = format!("{PATCH_PLANNER_AGENT}_{attempt}_{idx}");
        let request = self
            .request(state, &planner, Instruction::Patch, worktree)
            .arg(state.run_id.as_str())
            .arg(change_request.trim())
            .arg(plan_file.display().to_string());
        let patch = self.invoke(&request).await;
        if !patch.success {
            warn!(
                run_id = %state.run_id,
                issue = issue.review_issue_number,
                error = %patch.output,
                "patch planning failed"
            );
            return false;
        }

        let implementor = format!("{PATCH_IMPLEMENTOR_AGENT}_{attempt}_{idx}");
        let request = self
            .request(state, &implementor, Instruction::Implement, worktree)
            .arg(patch.output.trim());
        let applied = self.invoke(&request).await;
        if applied.success {
            info!(run_id = %state.run_id, issue = issue.review_issue_number, "blocker patched");
        } else {
            warn!(
                run_id = %state.run_id,
                issue = issue.review_issue_number,
                error = %applied.output,
                "patch implementation failed"
            );
        }
        applied.success
    }
}

fn review_report(review: &ReviewResult, outcome: &LoopOutcome) -> String {
    let mut report = format!(
        "Review {}: {}",
        if review.success { "passed" } else { "found issues" },
        outcome.summary()
    );
    if !review.review_summary.trim().is_empty() {
        report.push_str(&format!("\n\n{}", review.review_summary.trim()));
    }
    for issue in &review.review_issues {
        report.push_str(&format!(
            "\n- #{} [{:?}] {}",
            issue.review_issue_number, issue.issue_severity, issue.issue_description
        ));
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use adw_core::results::IssueSeverity;

    #[test]
    fn report_lists_every_issue() {
        let review = ReviewResult {
            success: false,
            review_summary: "Login works; styling off.".to_string(),
            review_issues: vec![ReviewIssue {
                review_issue_number: 1,
                screenshot_path: String::new(),
                issue_description: "Button misaligned".to_string(),
                issue_resolution: "Fix flex layout".to_string(),
                issue_severity: IssueSeverity::Blocker,
            }],
            screenshots: Vec::new(),
        };
        let outcome = LoopOutcome {
            name: "review",
            result: StageResult::new(review.review_issues.iter().map(CheckOutcome::from).collect()),
            attempts: 1,
            resolutions: 0,
        };
        let report = review_report(&review, &outcome);
        assert!(report.starts_with("Review found issues: review: 0/1 passed"));
        assert!(report.contains("- #1 [Blocker] Button misaligned"));
    }
}
