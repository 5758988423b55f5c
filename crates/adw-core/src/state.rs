//! Durable per-run state.
//!
//! One JSON document per run at `agents/<run_id>/adw_state.json`. Writes
//! replace the whole record (temp file + rename); there is no locking, so
//! concurrent writers to the same run ID are last-writer-wins.

use crate::paths::RunPaths;
use crate::ports::PortPair;
use crate::types::{IssueClass, ModelSet, RunId, Stage};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt state file {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("state file {} belongs to run {found}, expected {expected}", path.display())]
    RunMismatch {
        path: PathBuf,
        expected: RunId,
        found: RunId,
    },
    #[error("run {run_id} is on branch {current}; refusing to switch it to {requested}")]
    BranchImmutable {
        run_id: RunId,
        current: String,
        requested: String,
    },
    #[error("run {run_id} has no {field}; run the {stage} stage first")]
    MissingField {
        run_id: RunId,
        field: &'static str,
        stage: Stage,
    },
    #[error("failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StateError>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StateError + '_ {
    move |source| StateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Persisted record of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    #[serde(default)]
    pub issue_number: Option<u64>,
    #[serde(default)]
    pub branch_name: Option<String>,
    /// Plan file, relative to the worktree.
    #[serde(default)]
    pub plan_file: Option<PathBuf>,
    #[serde(default)]
    pub issue_class: Option<IssueClass>,
    #[serde(default)]
    pub worktree_path: Option<PathBuf>,
    #[serde(default)]
    pub port_a: Option<u16>,
    #[serde(default)]
    pub port_b: Option<u16>,
    #[serde(default)]
    pub model_set: ModelSet,
    /// Stages that have executed, in order. Duplicates are expected.
    #[serde(default)]
    pub stage_history: Vec<Stage>,
}

/// Additive patch for `RunState::update`. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStateUpdate {
    pub issue_number: Option<u64>,
    pub branch_name: Option<String>,
    pub plan_file: Option<PathBuf>,
    pub issue_class: Option<IssueClass>,
    pub worktree_path: Option<PathBuf>,
    pub ports: Option<PortPair>,
    pub model_set: Option<ModelSet>,
}

impl RunState {
    /// Fresh record with only the run ID populated.
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            issue_number: None,
            branch_name: None,
            plan_file: None,
            issue_class: None,
            worktree_path: None,
            port_a: None,
            port_b: None,
            model_set: ModelSet::default(),
            stage_history: Vec::new(),
        }
    }

    /// Apply a patch. Fields are filled in, never cleared.
    ///
    /// Fails if the patch would change an already-set branch name.
    pub fn update(&mut self, patch: RunStateUpdate) -> Result<()> {
        if let Some(requested) = patch.branch_name {
            match &self.branch_name {
                Some(current) if *current != requested => {
                    return Err(StateError::BranchImmutable {
                        run_id: self.run_id.clone(),
                        current: current.clone(),
                        requested,
                    });
                }
                _ => self.branch_name = Some(requested),
            }
        }
        if let Some(n) = patch.issue_number {
            self.issue_number = Some(n);
        }
        if let Some(plan) = patch.plan_file {
            self.plan_file = Some(plan);
        }
        if let Some(class) = patch.issue_class {
            self.issue_class = Some(class);
        }
        if let Some(path) = patch.worktree_path {
            self.worktree_path = Some(path);
        }
        if let Some(ports) = patch.ports {
            self.port_a = Some(ports.port_a);
            self.port_b = Some(ports.port_b);
        }
        if let Some(set) = patch.model_set {
            self.model_set = set;
        }
        Ok(())
    }

    /// Record that `stage` executed. Does not persist.
    pub fn append_stage(&mut self, stage: Stage) {
        self.stage_history.push(stage);
    }

    pub fn ports(&self) -> Option<PortPair> {
        Some(PortPair {
            port_a: self.port_a?,
            port_b: self.port_b?,
        })
    }

    fn missing(&self, field: &'static str, stage: Stage) -> StateError {
        StateError::MissingField {
            run_id: self.run_id.clone(),
            field,
            stage,
        }
    }

    pub fn require_branch(&self) -> Result<&str> {
        self.branch_name
            .as_deref()
            .ok_or_else(|| self.missing("branch_name", Stage::Plan))
    }

    pub fn require_plan_file(&self) -> Result<&Path> {
        self.plan_file
            .as_deref()
            .ok_or_else(|| self.missing("plan_file", Stage::Plan))
    }

    pub fn require_worktree(&self) -> Result<&Path> {
        self.worktree_path
            .as_deref()
            .ok_or_else(|| self.missing("worktree_path", Stage::Plan))
    }

    pub fn require_ports(&self) -> Result<PortPair> {
        self.ports().ok_or_else(|| self.missing("ports", Stage::Plan))
    }

    /// Names of fields that are still unset.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.issue_number.is_none() {
            missing.push("issue_number");
        }
        if self.branch_name.is_none() {
            missing.push("branch_name");
        }
        if self.plan_file.is_none() {
            missing.push("plan_file");
        }
        if self.issue_class.is_none() {
            missing.push("issue_class");
        }
        if self.worktree_path.is_none() {
            missing.push("worktree_path");
        }
        if self.port_a.is_none() {
            missing.push("port_a");
        }
        if self.port_b.is_none() {
            missing.push("port_b");
        }
        missing
    }

    pub fn from_json(content: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(StateError::Serialize)
    }
}

/// File-backed store of run records.
#[derive(Debug, Clone)]
pub struct StateStore {
    paths: RunPaths,
}

impl StateStore {
    pub fn new(paths: RunPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    /// Load a run's record. `Ok(None)` means the run has never been saved.
    ///
    /// An unreadable or unparseable file is an error; it is never replaced
    /// by a fresh record.
    pub fn load(&self, run_id: &RunId) -> Result<Option<RunState>> {
        let path = self.paths.state_file(run_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path)(e)),
        };
        let state = RunState::from_json(&content).map_err(|source| StateError::Corrupt {
            path: path.clone(),
            source,
        })?;
        if state.run_id != *run_id {
            return Err(StateError::RunMismatch {
                path,
                expected: run_id.clone(),
                found: state.run_id,
            });
        }
        debug!(run_id = %run_id, path = %path.display(), "loaded run state");
        Ok(Some(state))
    }

    /// Load a run, creating an in-memory record if none exists.
    ///
    /// Returns the state and whether it was newly created.
    pub fn load_or_create(&self, run_id: &RunId) -> Result<(RunState, bool)> {
        match self.load(run_id)? {
            Some(state) => Ok((state, false)),
            None => {
                info!(run_id = %run_id, "creating new run state");
                Ok((RunState::new(run_id.clone()), true))
            }
        }
    }

    /// Persist the whole record after `stage` touched it.
    pub fn save(&self, state: &RunState, stage: Stage) -> Result<PathBuf> {
        let path = self.paths.state_file(&state.run_id);
        let dir = self.paths.run_dir(&state.run_id);
        std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let content = state.to_json()?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content.as_bytes()).map_err(io_err(&tmp))?;
        std::fs::rename(&tmp, &path).map_err(io_err(&path))?;

        info!(
            run_id = %state.run_id,
            stage = %stage,
            path = %path.display(),
            "saved run state"
        );
        Ok(path)
    }

    /// All readable run records. Unreadable records are skipped with a warning.
    pub fn list(&self) -> Result<Vec<RunState>> {
        let dir = self.paths.agents_dir();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(dir)(e)),
        };

        let mut states = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(dir))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(run_id) = RunId::parse(&name) else {
                continue;
            };
            match self.load(&run_id) {
                Ok(Some(state)) => states.push(state),
                Ok(None) => {}
                Err(err) => warn!(run_id = %run_id, error = %err, "skipping unreadable run state"),
            }
        }
        states.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(states)
    }

    /// Delete a run's artifact directory, state included.
    pub fn remove(&self, run_id: &RunId) -> Result<()> {
        let dir = self.paths.run_dir(run_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&dir)(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> StateStore {
        StateStore::new(RunPaths::new(
            dir.path(),
            Path::new("agents"),
            Path::new("trees"),
        ))
    }

    fn id(s: &str) -> RunId {
        RunId::parse(s).unwrap()
    }

    #[test]
    fn load_missing_run_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(store(&dir).load(&id("abc12345")).unwrap().is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut state = RunState::new(id("abc12345"));
        state
            .update(RunStateUpdate {
                issue_number: Some(123),
                branch_name: Some("feat-issue-123-adw-abc12345-login".into()),
                plan_file: Some("specs/plan.md".into()),
                issue_class: Some(IssueClass::Feature),
                worktree_path: Some(dir.path().join("trees/abc12345")),
                ports: Some(PortPair {
                    port_a: 9103,
                    port_b: 9203,
                }),
                model_set: Some(ModelSet::Heavy),
            })
            .unwrap();
        state.append_stage(Stage::Plan);
        state.append_stage(Stage::Build);
        state.append_stage(Stage::Build);

        store(&dir).save(&state, Stage::Build).unwrap();
        // A second store instance stands in for a process restart.
        let loaded = store(&dir).load(&id("abc12345")).unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn corrupt_state_is_an_error_not_a_fresh_record() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let run = id("abc12345");
        let path = s.paths().state_file(&run);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(s.load(&run), Err(StateError::Corrupt { .. })));
        assert!(s.load_or_create(&run).is_err());
    }

    #[test]
    fn state_for_other_run_is_rejected() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.save(&RunState::new(id("other")), Stage::Plan).unwrap();
        let from = s.paths().state_file(&id("other"));
        let to = s.paths().state_file(&id("mine"));
        std::fs::create_dir_all(to.parent().unwrap()).unwrap();
        std::fs::copy(from, to).unwrap();

        assert!(matches!(
            s.load(&id("mine")),
            Err(StateError::RunMismatch { .. })
        ));
    }

    #[test]
    fn branch_name_is_immutable_once_set() {
        let mut state = RunState::new(id("abc12345"));
        state
            .update(RunStateUpdate {
                branch_name: Some("feat-a".into()),
                ..Default::default()
            })
            .unwrap();
        // Same value is fine.
        state
            .update(RunStateUpdate {
                branch_name: Some("feat-a".into()),
                ..Default::default()
            })
            .unwrap();
        let err = state
            .update(RunStateUpdate {
                branch_name: Some("feat-b".into()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, StateError::BranchImmutable { .. }));
        assert_eq!(state.branch_name.as_deref(), Some("feat-a"));
    }

    #[test]
    fn update_never_clears_fields() {
        let mut state = RunState::new(id("abc12345"));
        state
            .update(RunStateUpdate {
                issue_number: Some(7),
                ..Default::default()
            })
            .unwrap();
        state.update(RunStateUpdate::default()).unwrap();
        assert_eq!(state.issue_number, Some(7));
    }

    #[test]
    fn require_reports_the_predecessor_stage() {
        let state = RunState::new(id("abc12345"));
        let err = state.require_plan_file().unwrap_err();
        assert_eq!(
            err.to_string(),
            "run abc12345 has no plan_file; run the plan stage first"
        );
    }

    #[test]
    fn list_skips_corrupt_records() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.save(&RunState::new(id("aaa")), Stage::Plan).unwrap();
        s.save(&RunState::new(id("bbb")), Stage::Plan).unwrap();
        std::fs::write(s.paths().state_file(&id("bbb")), "garbage").unwrap();

        let listed = s.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].run_id, id("aaa"));
    }

    #[test]
    fn saved_document_has_exactly_the_run_fields() {
        let state = RunState::new(id("abc12345"));
        let value: serde_json::Value = serde_json::from_str(&state.to_json().unwrap()).unwrap();
        let mut keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "branch_name",
                "issue_class",
                "issue_number",
                "model_set",
                "plan_file",
                "port_a",
                "port_b",
                "run_id",
                "stage_history",
                "worktree_path",
            ]
        );
    }

    #[test]
    fn remove_deletes_run_directory() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let run = id("abc12345");
        s.save(&RunState::new(run.clone()), Stage::Plan).unwrap();
        s.remove(&run).unwrap();
        assert!(s.load(&run).unwrap().is_none());
        // Idempotent.
        s.remove(&run).unwrap();
    }
}
