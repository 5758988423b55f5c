//! Test stage: unit-style checks, then browser-style checks, each with a
//! resolution loop.
//!
//! The stage completes (and commits) even when checks still fail after the
//! last attempt; the pass/fail counts go to the issue comment.

use adw_core::results::{extract_json, E2eTestResult, TestResult};
use adw_core::state::RunState;
use adw_core::types::{CheckOutcome, Instruction, RunId, Stage, StageResult};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{LoopOutcome, Result, StageError, StageOutcome, StageRunner, OPS_AGENT};
use crate::executor::AgentInvoker;
use crate::tracker::IssueTracker;

pub const TEST_RUNNER_AGENT: &str = "test_runner";
pub const TEST_RESOLVER_AGENT: &str = "test_resolver";
pub const E2E_RUNNER_AGENT: &str = "e2e_test_runner";
pub const E2E_RESOLVER_AGENT: &str = "e2e_test_resolver";

impl<A: AgentInvoker, T: IssueTracker> StageRunner<A, T> {
    pub(super) async fn test(&self, issue_number: u64, run_id: &RunId) -> Result<StageOutcome> {
        let mut state = self.load_run(issue_number, run_id)?;
        let worktree = self.worktree(&state)?;
        self.post(issue_number, run_id, OPS_AGENT, "Starting tests").await;

        let unit = self.unit_test_loop(&state, &worktree).await?;
        self.post(issue_number, run_id, TEST_RUNNER_AGENT, &loop_report(&unit))
            .await;
        let mut loops = vec![unit];

        if self.options.skip_e2e {
            info!(run_id = %run_id, "skipping e2e tests");
        } else if let Some(e2e) = self.e2e_test_loop(&state, &worktree).await? {
            self.post(issue_number, run_id, E2E_RUNNER_AGENT, &loop_report(&e2e))
                .await;
            loops.push(e2e);
        }

        let summary = loops
            .iter()
            .map(|l| format!("{} {}", l.name, l.result.summary()))
            .collect::<Vec<_>>()
            .join(", ");
        let committed = self
            .commit_stage(&state, &worktree, TEST_RUNNER_AGENT, &format!("test results: {summary}"))
            .await?;
        self.finish(&mut state, Stage::Test)?;

        let mut outcome = StageOutcome::new(Stage::Test, state);
        outcome.loops = loops;
        outcome.committed = committed;
        let status = if outcome.all_checks_passed() {
            format!("All tests passed ({summary})")
        } else {
            format!("Tests finished with failures ({summary})")
        };
        self.post(issue_number, run_id, OPS_AGENT, &status).await;
        Ok(outcome)
    }

    /// Run `/test`, resolve failures one by one, re-run. Bounded by
    /// `test_max_attempts`; stops early when nothing could be resolved.
    async fn unit_test_loop(&self, state: &RunState, worktree: &Path) -> Result<LoopOutcome> {
        let max_attempts = self.config.test_max_attempts.max(1);
        let mut resolutions = 0;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let tests = self.run_unit_tests(state, worktree).await?;
            let result = StageResult::new(tests.iter().map(CheckOutcome::from).collect());
            info!(
                run_id = %state.run_id,
                attempt,
                passed = result.passed_count(),
                failed = result.failed_count(),
                "unit tests ran"
            );

            let done = |result: StageResult, resolutions| LoopOutcome {
                name: "unit",
                result,
                attempts: attempt,
                resolutions,
            };
            if result.all_passed() {
                return Ok(done(result, resolutions));
            }
            if attempt >= max_attempts {
                warn!(run_id = %state.run_id, attempt, "unit test attempts exhausted");
                return Ok(done(result, resolutions));
            }

            let mut resolved = 0;
            for (idx, test) in tests.iter().filter(|t| !t.passed).enumerate() {
                let agent = format!("{TEST_RESOLVER_AGENT}_iter{attempt}_{idx}");
                let payload = serde_json::to_string(test).unwrap_or_else(|_| test.test_name.clone());
                let request = self
                    .request(state, &agent, Instruction::ResolveFailedTest, worktree)
                    .arg(payload);
                resolutions += 1;
                let response = self.invoke(&request).await;
                if response.success {
                    resolved += 1;
                    info!(run_id = %state.run_id, test = %test.test_name, "resolved failing test");
                } else {
                    warn!(
                        run_id = %state.run_id,
                        test = %test.test_name,
                        error = %response.output,
                        "failed to resolve test"
                    );
                }
            }
            if resolved == 0 {
                info!(run_id = %state.run_id, attempt, "no failures resolved; stopping");
                return Ok(done(result, resolutions));
            }
        }
    }

    async fn run_unit_tests(&self, state: &RunState, worktree: &Path) -> Result<Vec<TestResult>> {
        let request = self.request(state, TEST_RUNNER_AGENT, Instruction::Test, worktree);
        let response = self.invoke_required(&request).await?;
        extract_json(&response.output).map_err(|e| StageError::InvalidResult {
            agent: TEST_RUNNER_AGENT.to_string(),
            message: e.to_string(),
        })
    }

    /// Same loop shape as the unit tests, one agent call per scenario file.
    /// `None` when the worktree has no scenarios.
    async fn e2e_test_loop(&self, state: &RunState, worktree: &Path) -> Result<Option<LoopOutcome>> {
        let scenarios = e2e_scenarios(worktree, &self.config.e2e_tests_dir);
        if scenarios.is_empty() {
            debug!(run_id = %state.run_id, "no e2e scenarios found");
            return Ok(None);
        }

        let max_attempts = self.config.e2e_max_attempts.max(1);
        let app_url = format!("http://localhost:{}", state.require_ports()?.port_b);
        let mut resolutions = 0;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut results = Vec::with_capacity(scenarios.len());
            for (idx, scenario) in scenarios.iter().enumerate() {
                let agent = format!("{E2E_RUNNER_AGENT}_{}_{idx}", attempt - 1);
                let request = self
                    .request(state, &agent, Instruction::TestE2e, worktree)
                    .arg(state.run_id.as_str())
                    .arg(agent.as_str())
                    .arg(scenario.display().to_string())
                    .arg(app_url.as_str());
                results.push(self.run_e2e_scenario(&request, scenario).await);
            }

            let result = StageResult::new(results.iter().map(CheckOutcome::from).collect());
            info!(
                run_id = %state.run_id,
                attempt,
                passed = result.passed_count(),
                failed = result.failed_count(),
                "e2e tests ran"
            );

            let done = |result: StageResult, resolutions| LoopOutcome {
                name: "e2e",
                result,
                attempts: attempt,
                resolutions,
            };
            if result.all_passed() || attempt >= max_attempts {
                return Ok(Some(done(result, resolutions)));
            }

            let mut resolved = 0;
            for (idx, test) in results.iter().filter(|t| !t.passed()).enumerate() {
                let agent = format!("{E2E_RESOLVER_AGENT}_iter{attempt}_{idx}");
                let payload = serde_json::to_string(test).unwrap_or_else(|_| test.test_name.clone());
                let request = self
                    .request(state, &agent, Instruction::ResolveFailedE2eTest, worktree)
                    .arg(payload);
                resolutions += 1;
                if self.invoke(&request).await.success {
                    resolved += 1;
                }
            }
            if resolved == 0 {
                info!(run_id = %state.run_id, attempt, "no e2e failures resolved; stopping");
                return Ok(Some(done(result, resolutions)));
            }
        }
    }

    /// One scenario. Agent or parse failures count as a failing check.
    async fn run_e2e_scenario(
        &self,
        request: &adw_core::types::AgentRequest,
        scenario: &Path,
    ) -> E2eTestResult {
        let failed = |error: String| E2eTestResult {
            test_name: scenario
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            status: "failed".to_string(),
            test_path: scenario.display().to_string(),
            screenshots: Vec::new(),
            error: Some(error),
        };

        let response = self.invoke(request).await;
        if !response.success {
            return failed(response.output);
        }
        extract_json(&response.output).unwrap_or_else(|e| failed(e.to_string()))
    }
}

/// `*.md` scenario files under `dir`, relative to the worktree, sorted.
fn e2e_scenarios(worktree: &Path, dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(worktree.join(dir)) else {
        return Vec::new();
    };
    let mut scenarios: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "md"))
        .filter_map(|p| p.file_name().map(|name| dir.join(name)))
        .collect();
    scenarios.sort();
    scenarios
}

fn loop_report(outcome: &LoopOutcome) -> String {
    let mut report = outcome.summary();
    for failure in outcome.result.failures() {
        report.push_str(&format!(
            "\n- {}: {}",
            failure.name,
            failure.error.as_deref().unwrap_or("failed")
        ));
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn scenarios_are_sorted_markdown_files() {
        let dir = TempDir::new().unwrap();
        let e2e = dir.path().join(".claude/commands/e2e");
        std::fs::create_dir_all(&e2e).unwrap();
        std::fs::write(e2e.join("test_b.md"), "").unwrap();
        std::fs::write(e2e.join("test_a.md"), "").unwrap();
        std::fs::write(e2e.join("notes.txt"), "").unwrap();

        let found = e2e_scenarios(dir.path(), Path::new(".claude/commands/e2e"));
        assert_eq!(
            found,
            vec![
                PathBuf::from(".claude/commands/e2e/test_a.md"),
                PathBuf::from(".claude/commands/e2e/test_b.md"),
            ]
        );
        assert!(e2e_scenarios(dir.path(), Path::new("missing")).is_empty());
    }

    #[test]
    fn report_lists_failures() {
        let outcome = LoopOutcome {
            name: "unit",
            result: StageResult::new(vec![
                CheckOutcome::pass("test_api"),
                CheckOutcome::fail("test_login", "assertion failed"),
            ]),
            attempts: 4,
            resolutions: 3,
        };
        assert_eq!(
            loop_report(&outcome),
            "unit: 1/2 passed after 4 attempt(s), 3 resolution(s)\n- test_login: assertion failed"
        );
    }
}
