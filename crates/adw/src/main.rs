//! adw - AI developer workflow runner
//!
//! Entry point for the `adw` binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use adw::logging::{self, RunLog};
use adw::{AgentExecutor, ExecutorConfig, GhCliTracker, StageOptions, StageOutcome, StageRunner};
use adw_core::config::Config;
use adw_core::paths::RunPaths;
use adw_core::ports::PortAllocator;
use adw_core::state::StateStore;
use adw_core::types::{IssueClass, ModelSet, RunId, Stage};
use clap::{Parser, Subcommand};
use eyre::{eyre, WrapErr};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Run AI developer workflow stages for a GitHub issue.
#[derive(Parser)]
#[command(name = "adw", about = "AI developer workflow runner", version)]
struct Cli {
    /// Config file path (overrides .adw/config)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Model tier: base or heavy
    #[arg(long, global = true)]
    model_set: Option<ModelSet>,

    /// Repository root (default: current directory)
    #[arg(long, global = true, env = "ADW_REPO")]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Classify the issue, create the run's worktree and write a plan
    Plan {
        issue: u64,
        /// Existing run to resume (default: start a new run)
        run_id: Option<RunId>,
        /// Skip classification and use this issue class
        #[arg(long)]
        class: Option<IssueClass>,
    },
    /// Implement the plan
    Build { issue: u64, run_id: Option<RunId> },
    /// Run tests and resolve failures
    Test {
        issue: u64,
        run_id: Option<RunId>,
        /// Only run unit tests
        #[arg(long)]
        skip_e2e: bool,
    },
    /// Review the branch and patch blockers
    Review {
        issue: u64,
        run_id: Option<RunId>,
        /// Report blockers without patching them
        #[arg(long)]
        skip_resolution: bool,
    },
    /// Document the branch's changes
    Document { issue: u64, run_id: Option<RunId> },
    /// Merge the run branch into the base branch
    Ship { issue: u64, run_id: Option<RunId> },
    /// Run a range of stages in order
    Pipeline {
        issue: u64,
        run_id: Option<RunId>,
        #[arg(long, default_value = "plan")]
        from: Stage,
        #[arg(long, default_value = "ship")]
        to: Stage,
        #[arg(long)]
        skip_e2e: bool,
        #[arg(long)]
        skip_resolution: bool,
    },
    /// Print a run's state as JSON
    State { run_id: RunId },
    /// Print a run's deterministic port pair
    Ports { run_id: RunId },
    /// Remove a run's worktree
    Cleanup {
        run_id: RunId,
        /// Also delete the run's state and artifacts
        #[arg(long)]
        purge_state: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let run_log = logging::init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to create tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli, run_log)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, run_log: RunLog) -> eyre::Result<()> {
    let repo = match cli.repo {
        Some(repo) => repo,
        None => std::env::current_dir().wrap_err("failed to read current directory")?,
    };
    let repo = repo
        .canonicalize()
        .wrap_err_with(|| format!("repository {} not found", repo.display()))?;

    let mut config = Config::load(&repo, cli.config.as_deref())?;
    if let Some(model_set) = cli.model_set {
        config.model_set = model_set;
    }

    let mut options = StageOptions::default();
    let (stages, issue, run_id) = match cli.command {
        Command::State { run_id } => return print_state(&repo, &config, &run_id),
        Command::Ports { run_id } => return print_ports(&config, &run_id),
        Command::Cleanup {
            run_id,
            purge_state,
        } => return cleanup(&repo, config, &run_id, purge_state),
        Command::Plan {
            issue,
            run_id,
            class,
        } => {
            options.issue_class = class;
            (vec![Stage::Plan], issue, run_id)
        }
        Command::Build { issue, run_id } => (vec![Stage::Build], issue, run_id),
        Command::Test {
            issue,
            run_id,
            skip_e2e,
        } => {
            options.skip_e2e = skip_e2e;
            (vec![Stage::Test], issue, run_id)
        }
        Command::Review {
            issue,
            run_id,
            skip_resolution,
        } => {
            options.skip_resolution = skip_resolution;
            (vec![Stage::Review], issue, run_id)
        }
        Command::Document { issue, run_id } => (vec![Stage::Document], issue, run_id),
        Command::Ship { issue, run_id } => (vec![Stage::Ship], issue, run_id),
        Command::Pipeline {
            issue,
            run_id,
            from,
            to,
            skip_e2e,
            skip_resolution,
        } => {
            if from > to {
                return Err(eyre!("--from {from} comes after --to {to}"));
            }
            options.skip_e2e = skip_e2e;
            options.skip_resolution = skip_resolution;
            (Stage::range(from, to), issue, run_id)
        }
    };

    let first = stages.first().copied().unwrap_or(Stage::Plan);
    if first != Stage::Plan && run_id.is_none() {
        return Err(eyre!(
            "usage: adw {first} <issue-number> <run-id>\n\
             the {first} stage needs the run id printed by `adw plan`"
        ));
    }

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());
    let runner = build_runner(&repo, config, cancel)?
        .with_options(options)
        .with_run_log(run_log);

    let outcomes = match stages.as_slice() {
        [stage] => vec![runner.run_stage(*stage, issue, run_id).await?],
        [from, .., to] => runner.run_pipeline(issue, run_id, *from, *to).await?,
        [] => Vec::new(),
    };
    for outcome in &outcomes {
        print_outcome(outcome);
    }
    Ok(())
}

fn build_runner(
    repo: &Path,
    config: Config,
    cancel: CancellationToken,
) -> eyre::Result<StageRunner<AgentExecutor, GhCliTracker>> {
    let executor = AgentExecutor::new(
        ExecutorConfig::from_config(&config),
        config.model_table.clone(),
        RunPaths::from_config(repo, &config),
        cancel,
    );
    let tracker = GhCliTracker::new(repo);
    Ok(StageRunner::new(config, repo, executor, tracker)?)
}

/// Kill the in-flight agent on SIGINT/SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let (Ok(mut sigterm), Ok(mut sigint)) = (
                signal(SignalKind::terminate()),
                signal(SignalKind::interrupt()),
            ) else {
                warn!("failed to register signal handlers");
                return;
            };
            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT, stopping agent"),
                _ = sigterm.recv() => info!("received SIGTERM, stopping agent"),
            }
        }

        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("failed to listen for ctrl-c");
                return;
            }
            info!("received SIGINT, stopping agent");
        }

        cancel.cancel();
    });
}

fn print_outcome(outcome: &StageOutcome) {
    let status = if outcome.skipped { "skipped" } else { "done" };
    println!("{} {} (run {})", outcome.stage, status, outcome.state.run_id);
    for l in &outcome.loops {
        println!("  {}", l.summary());
    }
}

fn print_state(repo: &Path, config: &Config, run_id: &RunId) -> eyre::Result<()> {
    let store = StateStore::new(RunPaths::from_config(repo, config));
    let state = store
        .load(run_id)?
        .ok_or_else(|| eyre!("no state for run {run_id}"))?;
    println!("{}", state.to_json()?);
    Ok(())
}

fn print_ports(config: &Config, run_id: &RunId) -> eyre::Result<()> {
    let allocator = PortAllocator::new(config.port_ranges())?;
    let pair = allocator.ports_for(run_id);
    println!("{}={}", config.port_a_env_key, pair.port_a);
    println!("{}={}", config.port_b_env_key, pair.port_b);
    Ok(())
}

fn cleanup(repo: &Path, config: Config, run_id: &RunId, purge_state: bool) -> eyre::Result<()> {
    let runner = build_runner(repo, config, CancellationToken::new())?;
    runner.cleanup(run_id, purge_state)?;
    println!("cleaned up run {run_id}");
    Ok(())
}
