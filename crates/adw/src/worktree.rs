//! Per-run isolated worktrees.
//!
//! Each run gets `trees/<run_id>`, a git worktree checked out to the run's
//! branch. Creation is idempotent and every downstream stage validates the
//! recorded path before touching it.

use adw_core::config::Config;
use adw_core::paths::RunPaths;
use adw_core::ports::PortPair;
use adw_core::state::RunState;
use adw_core::types::{RunId, Stage};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::environment::{self, EnvironmentError, EnvironmentReport};
use crate::git;

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("environment setup failed: {0}")]
    Environment(#[from] EnvironmentError),
    #[error("run {0} has no worktree; run the plan stage first")]
    NotRecorded(RunId),
    #[error("worktree for run {run_id} is missing at {}", path.display())]
    Missing { run_id: RunId, path: PathBuf },
    #[error("{} exists but is not a git worktree of this repository", path.display())]
    NotAWorktree { path: PathBuf },
    #[error("worktree {} is checked out to {actual}, expected {expected}", path.display())]
    BranchMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("state for run {state_run} was passed to validate run {run_id}")]
    RunMismatch { run_id: RunId, state_run: RunId },
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

#[derive(Debug, Clone)]
pub struct WorktreeManager {
    paths: RunPaths,
    base_branch: String,
}

impl WorktreeManager {
    pub fn new(paths: RunPaths, base_branch: impl Into<String>) -> Self {
        Self {
            paths,
            base_branch: base_branch.into(),
        }
    }

    /// Build from config, detecting the base branch when none is configured.
    pub fn from_config(paths: RunPaths, config: &Config) -> Result<Self> {
        let base_branch = match &config.base_branch {
            Some(branch) => branch.clone(),
            None => git::detect_default_branch(paths.repo_root())?,
        };
        Ok(Self::new(paths, base_branch))
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    pub fn repo_root(&self) -> &Path {
        self.paths.repo_root()
    }

    pub fn path_for(&self, run_id: &RunId) -> PathBuf {
        self.paths.worktree_dir(run_id)
    }

    /// Create the run's worktree on `branch`, creating the branch from the
    /// base branch when needed. An existing worktree at the path is reused.
    pub fn create(&self, run_id: &RunId, branch: &str) -> Result<PathBuf> {
        let path = self.path_for(run_id);

        if path.exists() {
            self.ensure_registered(&path)?;
            info!(run_id = %run_id, path = %path.display(), "reusing existing worktree");
            return Ok(path);
        }

        info!(
            run_id = %run_id,
            branch,
            base = %self.base_branch,
            path = %path.display(),
            "creating worktree"
        );
        git::create_worktree(self.repo_root(), &path, branch, &self.base_branch)?;
        Ok(path)
    }

    /// Confirm the worktree recorded in `state` exists and is registered with git.
    pub fn validate(&self, run_id: &RunId, state: &RunState) -> Result<PathBuf> {
        if &state.run_id != run_id {
            return Err(WorktreeError::RunMismatch {
                run_id: run_id.clone(),
                state_run: state.run_id.clone(),
            });
        }
        let path = state
            .worktree_path
            .clone()
            .ok_or_else(|| WorktreeError::NotRecorded(run_id.clone()))?;
        if !path.is_dir() {
            return Err(WorktreeError::Missing {
                run_id: run_id.clone(),
                path,
            });
        }
        self.ensure_registered(&path)?;

        if let Some(expected) = &state.branch_name {
            if let Some(actual) = git::current_branch(&path)? {
                if &actual != expected {
                    return Err(WorktreeError::BranchMismatch {
                        path,
                        expected: expected.clone(),
                        actual,
                    });
                }
            }
        }
        Ok(path)
    }

    /// A run still holds its resources while its worktree is checked out and
    /// it has not shipped.
    pub fn is_active(&self, state: &RunState) -> bool {
        if state.stage_history.last() == Some(&Stage::Ship) {
            return false;
        }
        self.validate(&state.run_id, state).is_ok()
    }

    /// Write the ports descriptor, seed config files and run install steps.
    pub async fn setup_environment(
        &self,
        worktree_path: &Path,
        ports: PortPair,
        config: &Config,
    ) -> Result<EnvironmentReport> {
        let report =
            environment::setup(self.repo_root(), worktree_path, ports, config).await?;
        for warning in &report.warnings {
            warn!(worktree = %worktree_path.display(), "{warning}");
        }
        Ok(report)
    }

    /// Remove the run's worktree. A missing directory only prunes git's bookkeeping.
    pub fn remove(&self, run_id: &RunId) -> Result<()> {
        let path = self.path_for(run_id);
        if path.exists() {
            info!(run_id = %run_id, path = %path.display(), "removing worktree");
            git::remove_worktree(self.repo_root(), &path, true)?;
        } else {
            warn!(run_id = %run_id, path = %path.display(), "worktree already gone; pruning");
            git::prune_worktrees(self.repo_root())?;
        }
        Ok(())
    }

    fn ensure_registered(&self, path: &Path) -> Result<()> {
        let wanted = canonical(path);
        let registered = git::list_worktrees(self.repo_root())?
            .iter()
            .any(|w| canonical(&w.path) == wanted);
        if registered {
            Ok(())
        } else {
            Err(WorktreeError::NotAWorktree {
                path: path.to_path_buf(),
            })
        }
    }
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::setup_test_repo;
    use adw_core::state::RunStateUpdate;

    fn manager(repo: &Path) -> WorktreeManager {
        let paths = RunPaths::new(repo, Path::new("agents"), Path::new("trees"));
        let base = git::detect_default_branch(repo).unwrap();
        WorktreeManager::new(paths, base)
    }

    #[test]
    fn create_is_idempotent() {
        let repo = setup_test_repo();
        let wt = manager(repo.path());
        let run = RunId::parse("abc12345").unwrap();

        let first = wt.create(&run, "feat-issue-123-adw-abc12345-x").unwrap();
        let second = wt.create(&run, "feat-issue-123-adw-abc12345-x").unwrap();
        assert_eq!(first, second);
        assert_eq!(first, repo.path().join("trees").join("abc12345"));
        assert!(first.join("README.md").exists());
    }

    #[test]
    fn create_rejects_foreign_directory() {
        let repo = setup_test_repo();
        let wt = manager(repo.path());
        let run = RunId::parse("deadbeef").unwrap();
        std::fs::create_dir_all(wt.path_for(&run)).unwrap();

        let err = wt.create(&run, "branch").unwrap_err();
        assert!(matches!(err, WorktreeError::NotAWorktree { .. }));
    }

    #[test]
    fn validate_checks_recorded_path() {
        let repo = setup_test_repo();
        let wt = manager(repo.path());
        let run = RunId::parse("abc12345").unwrap();
        let mut state = RunState::new(run.clone());

        assert!(matches!(
            wt.validate(&run, &state),
            Err(WorktreeError::NotRecorded(_))
        ));

        let path = wt.create(&run, "feat-x").unwrap();
        state
            .update(RunStateUpdate {
                branch_name: Some("feat-x".to_string()),
                worktree_path: Some(path.clone()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(wt.validate(&run, &state).unwrap(), path);

        wt.remove(&run).unwrap();
        assert!(matches!(
            wt.validate(&run, &state),
            Err(WorktreeError::Missing { .. })
        ));
    }

    #[test]
    fn validate_detects_branch_mismatch() {
        let repo = setup_test_repo();
        let wt = manager(repo.path());
        let run = RunId::parse("abc12345").unwrap();
        let path = wt.create(&run, "feat-x").unwrap();

        let mut state = RunState::new(run.clone());
        state
            .update(RunStateUpdate {
                branch_name: Some("feat-y".to_string()),
                worktree_path: Some(path),
                ..Default::default()
            })
            .unwrap();
        assert!(matches!(
            wt.validate(&run, &state),
            Err(WorktreeError::BranchMismatch { .. })
        ));
    }

    #[test]
    fn shipped_or_removed_runs_are_inactive() {
        let repo = setup_test_repo();
        let wt = manager(repo.path());
        let run = RunId::parse("abc12345").unwrap();
        let mut state = RunState::new(run.clone());
        assert!(!wt.is_active(&state));

        let path = wt.create(&run, "feat-x").unwrap();
        state
            .update(RunStateUpdate {
                branch_name: Some("feat-x".to_string()),
                worktree_path: Some(path),
                ..Default::default()
            })
            .unwrap();
        state.append_stage(Stage::Plan);
        assert!(wt.is_active(&state));

        state.append_stage(Stage::Ship);
        assert!(!wt.is_active(&state));

        state.append_stage(Stage::Review);
        assert!(wt.is_active(&state));
        wt.remove(&run).unwrap();
        assert!(!wt.is_active(&state));
    }

    #[test]
    fn remove_missing_worktree_prunes() {
        let repo = setup_test_repo();
        let wt = manager(repo.path());
        let run = RunId::parse("gone1234").unwrap();
        wt.remove(&run).unwrap();
    }
}
