//! adw - AI developer workflow runner
//!
//! Drives a GitHub issue through plan, build, test, review, document and
//! ship. Each run gets its own git worktree and port pair, so many runs can
//! proceed side by side against one repository.

pub mod environment;
pub mod executor;
pub mod git;
pub mod logging;
pub mod stages;
pub mod tracker;
pub mod worktree;

pub use executor::{execute_with_retry, AgentExecutor, AgentInvoker, ExecutorConfig};
pub use stages::{LoopOutcome, StageError, StageOptions, StageOutcome, StageRunner};
pub use tracker::{GhCliTracker, IssueTracker, PullRequest};
pub use worktree::WorktreeManager;
