//! Git operations for the pipeline.
//!
//! Worktree creation and removal, branch management, commits, the ship
//! merge and pushes. Every call blocks on a `git` child process.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
    #[error("merge conflict: {0}")]
    MergeConflict(String),
    #[error("dirty working tree: {0}")]
    DirtyWorkingTree(String),
}

pub type Result<T> = std::result::Result<T, GitError>;

fn git(dir: &Path, args: &[&str]) -> Result<Output> {
    debug!(dir = %dir.display(), ?args, "git");
    Ok(Command::new("git").args(args).current_dir(dir).output()?)
}

/// Run git and fail with its stderr on a non-zero exit.
fn git_checked(dir: &Path, args: &[&str]) -> Result<String> {
    let output = git(dir, args)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)
}

/// Detect the default branch for a repository.
///
/// Tries `git symbolic-ref refs/remotes/origin/HEAD` first (tracks remote default),
/// then `main`, then `master`.
pub fn detect_default_branch(repo_root: &Path) -> Result<String> {
    let output = git(repo_root, &["symbolic-ref", "refs/remotes/origin/HEAD"])?;
    if output.status.success() {
        let full_ref = String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)?;
        if let Some(branch) = full_ref.trim().strip_prefix("refs/remotes/origin/") {
            return Ok(branch.to_string());
        }
    }

    for candidate in ["main", "master"] {
        if branch_exists(repo_root, candidate)? {
            return Ok(candidate.to_string());
        }
    }

    // Default to main even if it doesn't exist yet.
    Ok("main".to_string())
}

/// Branch checked out in `dir`, `None` when HEAD is detached.
pub fn current_branch(dir: &Path) -> Result<Option<String>> {
    let branch = git_checked(dir, &["branch", "--show-current"])?;
    let branch = branch.trim();
    Ok((!branch.is_empty()).then(|| branch.to_string()))
}

/// Check if a branch exists locally.
pub fn branch_exists(repo_root: &Path, branch: &str) -> Result<bool> {
    let output = git(
        repo_root,
        &["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")],
    )?;
    Ok(output.status.success())
}

/// Create a new branch from base without checking it out.
pub fn create_branch(repo_root: &Path, branch: &str, base: &str) -> Result<()> {
    git_checked(repo_root, &["branch", branch, base])?;
    Ok(())
}

/// Checkout a branch.
pub fn checkout_branch(dir: &Path, branch: &str) -> Result<()> {
    git_checked(dir, &["checkout", branch])?;
    Ok(())
}

/// Create a git worktree at `worktree_path` checked out to `branch`.
///
/// Creates the branch from `base_branch` if it doesn't exist.
pub fn create_worktree(
    repo_root: &Path,
    worktree_path: &Path,
    branch: &str,
    base_branch: &str,
) -> Result<()> {
    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            GitError::CommandFailed(format!("failed to create parent directory: {e}"))
        })?;
    }

    if !branch_exists(repo_root, branch)? {
        create_branch(repo_root, branch, base_branch)?;
    }

    git_checked(
        repo_root,
        &["worktree", "add", worktree_path.to_string_lossy().as_ref(), branch],
    )?;
    Ok(())
}

/// Remove a git worktree, discarding local changes when `force` is set.
pub fn remove_worktree(repo_root: &Path, worktree_path: &Path, force: bool) -> Result<()> {
    let path = worktree_path.to_string_lossy();
    let mut args = vec!["worktree", "remove"];
    if force {
        args.push("--force");
    }
    args.push(path.as_ref());
    git_checked(repo_root, &args)?;
    Ok(())
}

/// Drop bookkeeping for worktrees whose directories are gone.
pub fn prune_worktrees(repo_root: &Path) -> Result<()> {
    git_checked(repo_root, &["worktree", "prune"])?;
    Ok(())
}

/// Information about a git worktree.
#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub commit: String,
}

/// List all git worktrees for a repository.
pub fn list_worktrees(repo_root: &Path) -> Result<Vec<WorktreeInfo>> {
    let stdout = git_checked(repo_root, &["worktree", "list", "--porcelain"])?;
    Ok(parse_worktree_list(&stdout))
}

fn parse_worktree_list(porcelain: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_commit: Option<String> = None;
    let mut current_branch: Option<String> = None;

    for line in porcelain.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            // Save previous worktree if we have one
            if let (Some(path), Some(commit)) = (current_path.take(), current_commit.take()) {
                worktrees.push(WorktreeInfo {
                    path,
                    commit,
                    branch: current_branch.take(),
                });
            }
            current_branch = None;
            current_path = Some(PathBuf::from(path));
        } else if let Some(commit) = line.strip_prefix("HEAD ") {
            current_commit = Some(commit.to_string());
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            current_branch = Some(branch.to_string());
        }
    }

    if let (Some(path), Some(commit)) = (current_path, current_commit) {
        worktrees.push(WorktreeInfo {
            path,
            commit,
            branch: current_branch,
        });
    }

    worktrees
}

/// Check if the working tree is clean (no uncommitted changes).
pub fn is_working_tree_clean(dir: &Path) -> Result<bool> {
    let stdout = git_checked(dir, &["status", "--porcelain"])?;
    Ok(stdout.trim().is_empty())
}

/// Whether tracked files have uncommitted changes. Untracked files are ignored.
pub fn has_tracked_changes(dir: &Path) -> Result<bool> {
    let stdout = git_checked(dir, &["status", "--porcelain", "--untracked-files=no"])?;
    Ok(!stdout.trim().is_empty())
}

/// Stage everything and commit. Returns `false` when there was nothing to commit.
pub fn commit_all(dir: &Path, message: &str) -> Result<bool> {
    if is_working_tree_clean(dir)? {
        return Ok(false);
    }
    git_checked(dir, &["add", "-A"])?;
    git_checked(dir, &["commit", "-m", message])?;
    Ok(true)
}

/// Whether `HEAD` differs from `base` (changes made on this branch since it forked).
pub fn has_changes_since(dir: &Path, base: &str) -> Result<bool> {
    let stdout = git_checked(dir, &["diff", "--stat", &format!("{base}...HEAD")])?;
    Ok(!stdout.trim().is_empty())
}

/// Merge `source_branch` into the current branch with a merge commit.
///
/// Aborts the merge and returns `MergeConflict` on conflicts.
pub fn merge_no_ff(dir: &Path, source_branch: &str, message: &str) -> Result<()> {
    if has_tracked_changes(dir)? {
        return Err(GitError::DirtyWorkingTree(
            "cannot merge with uncommitted changes".to_string(),
        ));
    }

    let output = git(dir, &["merge", "--no-ff", "-m", message, source_branch])?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.contains("CONFLICT") || stderr.contains("Automatic merge failed") {
            // Abort the merge to leave the tree clean.
            if let Err(e) = git(dir, &["merge", "--abort"]) {
                warn!(error = %e, "git merge --abort failed");
            }
            return Err(GitError::MergeConflict(format!(
                "merge from {source_branch} failed: {}",
                stdout.trim()
            )));
        }
        return Err(GitError::CommandFailed(format!(
            "git merge --no-ff {source_branch}: {}",
            stderr.trim()
        )));
    }
    Ok(())
}

/// Whether a remote with this name is configured.
pub fn has_remote(dir: &Path, remote: &str) -> Result<bool> {
    let stdout = git_checked(dir, &["remote"])?;
    Ok(stdout.lines().any(|line| line.trim() == remote))
}

/// Push a branch to `origin`, setting upstream.
pub fn push_branch(dir: &Path, branch: &str) -> Result<()> {
    git_checked(dir, &["push", "-u", "origin", branch])?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::process::Command;
    use tempfile::TempDir;

    pub fn run(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap()
            .status;
        assert!(status.success(), "git {args:?} failed");
    }

    /// Create a test git repository with one commit.
    pub fn setup_test_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        run(dir.path(), &["init"]);
        run(dir.path(), &["config", "user.email", "test@test.com"]);
        run(dir.path(), &["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
        run(dir.path(), &["add", "."]);
        run(dir.path(), &["commit", "-m", "Initial commit"]);
        dir
    }
}
