//! Path resolution for run artifacts and worktrees.
//!
//! Every on-disk location derived from a run ID goes through `RunPaths`:
//!
//! ```text
//! <repo>/agents/<run_id>/adw_state.json
//! <repo>/agents/<run_id>/<agent>/prompts/<instruction>.txt
//! <repo>/agents/<run_id>/<agent>/raw_output.jsonl
//! <repo>/agents/<run_id>/<agent>/response.json
//! <repo>/agents/<run_id>/<stage>/execution.log
//! <repo>/trees/<run_id>/
//! ```

use crate::config::Config;
use crate::types::{Instruction, RunId, Stage};
use std::path::{Path, PathBuf};

/// Name of the per-run state document.
pub const STATE_FILENAME: &str = "adw_state.json";

/// Resolves run-scoped locations from typed parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    repo_root: PathBuf,
    agents_dir: PathBuf,
    trees_dir: PathBuf,
}

impl RunPaths {
    /// Relative `agents_dir` / `trees_dir` are resolved against `repo_root`.
    pub fn new(repo_root: impl Into<PathBuf>, agents_dir: &Path, trees_dir: &Path) -> Self {
        let repo_root = repo_root.into();
        let agents_dir = if agents_dir.is_relative() {
            repo_root.join(agents_dir)
        } else {
            agents_dir.to_path_buf()
        };
        let trees_dir = if trees_dir.is_relative() {
            repo_root.join(trees_dir)
        } else {
            trees_dir.to_path_buf()
        };
        Self {
            repo_root,
            agents_dir,
            trees_dir,
        }
    }

    pub fn from_config(repo_root: impl Into<PathBuf>, config: &Config) -> Self {
        Self::new(repo_root, &config.agents_dir, &config.trees_dir)
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn agents_dir(&self) -> &Path {
        &self.agents_dir
    }

    pub fn trees_dir(&self) -> &Path {
        &self.trees_dir
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.agents_dir.join(run_id.as_str())
    }

    pub fn state_file(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join(STATE_FILENAME)
    }

    pub fn agent_dir(&self, run_id: &RunId, agent_name: &str) -> PathBuf {
        self.run_dir(run_id).join(agent_name)
    }

    pub fn prompt_file(&self, run_id: &RunId, agent_name: &str, instruction: Instruction) -> PathBuf {
        self.agent_dir(run_id, agent_name)
            .join("prompts")
            .join(format!("{}.txt", instruction.slug()))
    }

    pub fn raw_output_file(&self, run_id: &RunId, agent_name: &str) -> PathBuf {
        self.agent_dir(run_id, agent_name).join("raw_output.jsonl")
    }

    pub fn response_file(&self, run_id: &RunId, agent_name: &str) -> PathBuf {
        self.agent_dir(run_id, agent_name).join("response.json")
    }

    pub fn stage_log_file(&self, run_id: &RunId, stage: Stage) -> PathBuf {
        self.run_dir(run_id)
            .join(stage.as_str())
            .join("execution.log")
    }

    pub fn worktree_dir(&self, run_id: &RunId) -> PathBuf {
        self.trees_dir.join(run_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> RunPaths {
        RunPaths::new("/repo", Path::new("agents"), Path::new("trees"))
    }

    #[test]
    fn state_and_worktree_paths() {
        let id = RunId::parse("abc12345").unwrap();
        assert_eq!(
            paths().state_file(&id),
            PathBuf::from("/repo/agents/abc12345/adw_state.json")
        );
        assert_eq!(
            paths().worktree_dir(&id),
            PathBuf::from("/repo/trees/abc12345")
        );
    }

    #[test]
    fn agent_artifacts_are_scoped_by_agent_and_instruction() {
        let id = RunId::parse("abc12345").unwrap();
        let p = paths();
        assert_eq!(
            p.prompt_file(&id, "sdlc_planner", Instruction::Feature),
            PathBuf::from("/repo/agents/abc12345/sdlc_planner/prompts/feature.txt")
        );
        assert_eq!(
            p.raw_output_file(&id, "sdlc_planner"),
            PathBuf::from("/repo/agents/abc12345/sdlc_planner/raw_output.jsonl")
        );
        assert_eq!(
            p.stage_log_file(&id, Stage::Test),
            PathBuf::from("/repo/agents/abc12345/test/execution.log")
        );
    }

    #[test]
    fn absolute_dirs_are_kept() {
        let p = RunPaths::new("/repo", Path::new("/var/adw"), Path::new("/scratch/trees"));
        let id = RunId::parse("x1").unwrap();
        assert_eq!(p.run_dir(&id), PathBuf::from("/var/adw/x1"));
        assert_eq!(p.worktree_dir(&id), PathBuf::from("/scratch/trees/x1"));
    }
}
