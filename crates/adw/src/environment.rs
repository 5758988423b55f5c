//! Worktree environment setup.
//!
//! Seeds a fresh worktree so services started inside it bind the run's own
//! ports:
//! - writes the ports descriptor (`.ports.env`)
//! - copies env files from the main checkout, falling back to the tracked
//!   template and recording a warning
//! - copies tool-configuration JSON with absolute paths rewritten into the
//!   worktree
//! - runs install commands and the optional database setup with timeouts

use adw_core::config::Config;
use adw_core::ports::PortPair;
use chrono::Utc;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Lines of command output kept in errors.
const OUTPUT_TAIL_LINES: usize = 40;

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{cmd}` exited with status {exit_code}:\n{output}")]
    CommandFailed {
        cmd: String,
        exit_code: i32,
        output: String,
    },
    #[error("`{cmd}` timed out after {secs} seconds")]
    Timeout { cmd: String, secs: u64 },
}

pub type Result<T> = std::result::Result<T, EnvironmentError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> EnvironmentError + '_ {
    move |source| EnvironmentError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// What `setup` did.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentReport {
    pub ports_file: PathBuf,
    /// Files written into the worktree, relative to it.
    pub seeded: Vec<PathBuf>,
    /// Non-fatal problems (missing optional files, template fallbacks).
    pub warnings: Vec<String>,
    pub commands: Vec<CommandResult>,
}

/// Result of one setup command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub cmd: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
}

/// Prepare `worktree` for `ports`.
pub async fn setup(
    repo_root: &Path,
    worktree: &Path,
    ports: PortPair,
    config: &Config,
) -> Result<EnvironmentReport> {
    let mut report = EnvironmentReport {
        ports_file: write_ports_file(worktree, ports, config)?,
        ..Default::default()
    };
    seed_env_files(repo_root, worktree, ports, config, &mut report)?;
    seed_tool_configs(repo_root, worktree, config, &mut report)?;

    let install_timeout = Duration::from_secs(config.install_timeout_sec);
    for cmd in &config.install_cmds {
        report
            .commands
            .push(run_required(cmd, worktree, install_timeout).await?);
    }
    if let Some(cmd) = &config.db_setup_cmd {
        let timeout = Duration::from_secs(config.db_setup_timeout_sec);
        report.commands.push(run_required(cmd, worktree, timeout).await?);
    }

    info!(
        worktree = %worktree.display(),
        ports = %ports,
        seeded = report.seeded.len(),
        warnings = report.warnings.len(),
        commands = report.commands.len(),
        "worktree environment ready"
    );
    Ok(report)
}

/// Key=value lines exposing the port pair and the derived service URL.
pub fn ports_env_contents(ports: PortPair, config: &Config) -> String {
    format!(
        "{}={}\n{}={}\n{}=http://localhost:{}\n",
        config.port_a_env_key,
        ports.port_a,
        config.port_b_env_key,
        ports.port_b,
        config.service_url_env_key,
        ports.port_a
    )
}

/// Write the ports descriptor into the worktree.
pub fn write_ports_file(worktree: &Path, ports: PortPair, config: &Config) -> Result<PathBuf> {
    let path = worktree.join(&config.ports_env_file);
    std::fs::write(&path, ports_env_contents(ports, config)).map_err(io_err(&path))?;
    debug!(path = %path.display(), "wrote ports descriptor");
    Ok(path)
}

/// Copy each configured env file from the main checkout.
///
/// Falls back to `<file><template_suffix>` inside the worktree when the main
/// checkout has no copy. The port lines are appended to the first file.
fn seed_env_files(
    repo_root: &Path,
    worktree: &Path,
    ports: PortPair,
    config: &Config,
    report: &mut EnvironmentReport,
) -> Result<()> {
    for (idx, rel) in config.env_files.iter().enumerate() {
        let source = repo_root.join(rel);
        let template = template_path(worktree, rel, &config.env_template_suffix);
        let dest = worktree.join(rel);

        let mut contents = if source.is_file() {
            std::fs::read_to_string(&source).map_err(io_err(&source))?
        } else if template.is_file() {
            report.warnings.push(format!(
                "{} not found in main checkout; using template {}",
                rel.display(),
                template.display()
            ));
            std::fs::read_to_string(&template).map_err(io_err(&template))?
        } else {
            report.warnings.push(format!(
                "{} not found in main checkout and no template exists",
                rel.display()
            ));
            continue;
        };

        if idx == 0 {
            if !contents.is_empty() && !contents.ends_with('\n') {
                contents.push('\n');
            }
            contents.push_str(&ports_env_contents(ports, config));
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        std::fs::write(&dest, contents).map_err(io_err(&dest))?;
        report.seeded.push(rel.clone());
    }
    Ok(())
}

fn template_path(worktree: &Path, rel: &Path, suffix: &str) -> PathBuf {
    let mut name = rel.as_os_str().to_owned();
    name.push(suffix);
    worktree.join(name)
}

/// Copy tool-configuration JSON with main-checkout paths rewritten.
fn seed_tool_configs(
    repo_root: &Path,
    worktree: &Path,
    config: &Config,
    report: &mut EnvironmentReport,
) -> Result<()> {
    for rel in &config.mcp_files {
        let source = repo_root.join(rel);
        if !source.is_file() {
            report
                .warnings
                .push(format!("{} not found in main checkout", rel.display()));
            continue;
        }
        let original = std::fs::read_to_string(&source).map_err(io_err(&source))?;
        let rewritten = match serde_json::from_str::<serde_json::Value>(&original) {
            Ok(mut value) => {
                rewrite_paths(&mut value, repo_root, worktree);
                serde_json::to_string_pretty(&value).unwrap_or(original)
            }
            Err(e) => {
                report.warnings.push(format!(
                    "{} is not valid JSON ({e}); rewriting paths textually",
                    rel.display()
                ));
                original.replace(
                    &*repo_root.to_string_lossy(),
                    &worktree.to_string_lossy(),
                )
            }
        };
        let dest = worktree.join(rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        std::fs::write(&dest, rewritten).map_err(io_err(&dest))?;
        report.seeded.push(rel.clone());
    }
    Ok(())
}

/// Point every string under `from` at the same location under `to`.
///
/// Paths already inside `to` are left alone, since the worktree itself
/// lives under the main checkout.
pub fn rewrite_paths(value: &mut serde_json::Value, from: &Path, to: &Path) {
    match value {
        serde_json::Value::String(s) => {
            let path = Path::new(s.as_str());
            if path.is_absolute() && !path.starts_with(to) {
                if let Ok(rest) = path.strip_prefix(from) {
                    *s = to.join(rest).to_string_lossy().into_owned();
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                rewrite_paths(item, from, to);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values_mut() {
                rewrite_paths(item, from, to);
            }
        }
        _ => {}
    }
}

/// Run a required command; a non-zero exit or timeout aborts setup.
async fn run_required(cmd: &str, working_dir: &Path, timeout: Duration) -> Result<CommandResult> {
    let result = run_shell(cmd, working_dir, timeout).await?;
    if result.exit_code != 0 {
        return Err(EnvironmentError::CommandFailed {
            cmd: cmd.to_string(),
            exit_code: result.exit_code,
            output: output_tail(&result),
        });
    }
    Ok(result)
}

/// Execute `cmd` through `sh -c`, killing it after `timeout` (zero disables).
pub async fn run_shell(cmd: &str, working_dir: &Path, timeout: Duration) -> Result<CommandResult> {
    debug!(cmd, dir = %working_dir.display(), "running setup command");
    let start = Utc::now();

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| EnvironmentError::Spawn {
            cmd: cmd.to_string(),
            source,
        })?;

    let mut stdout_handle = child.stdout.take();
    let mut stderr_handle = child.stderr.take();

    // Drain both pipes while waiting so a chatty command cannot block on a full pipe.
    let drain = async {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let read_out = async {
            if let Some(handle) = stdout_handle.as_mut() {
                if let Err(e) = handle.read_to_end(&mut stdout).await {
                    debug!(cmd, error = %e, "failed to read command stdout");
                }
            }
        };
        let read_err = async {
            if let Some(handle) = stderr_handle.as_mut() {
                if let Err(e) = handle.read_to_end(&mut stderr).await {
                    debug!(cmd, error = %e, "failed to read command stderr");
                }
            }
        };
        tokio::join!(read_out, read_err);
        let status = child.wait().await;
        (status, stdout, stderr)
    };

    let (status, stdout, stderr) = if timeout.is_zero() {
        drain.await
    } else {
        match tokio::time::timeout(timeout, drain).await {
            Ok(done) => done,
            Err(_) => {
                warn!(cmd, timeout_sec = timeout.as_secs(), "setup command timed out");
                return Err(EnvironmentError::Timeout {
                    cmd: cmd.to_string(),
                    secs: timeout.as_secs(),
                });
            }
        }
    };

    let status = status.map_err(|source| EnvironmentError::Spawn {
        cmd: cmd.to_string(),
        source,
    })?;
    let exit_code = status.code().unwrap_or(-1);
    let duration_ms = u64::try_from((Utc::now() - start).num_milliseconds()).unwrap_or(0);

    if exit_code == 0 {
        debug!(cmd, duration_ms, "setup command passed");
    } else {
        warn!(cmd, exit_code, duration_ms, "setup command failed");
    }

    Ok(CommandResult {
        cmd: cmd.to_string(),
        exit_code,
        duration_ms,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

fn output_tail(result: &CommandResult) -> String {
    let combined = if result.stderr.trim().is_empty() {
        result.stdout.clone()
    } else if result.stdout.trim().is_empty() {
        result.stderr.clone()
    } else {
        format!("{}\n--- stderr ---\n{}", result.stdout, result.stderr)
    };
    let lines: Vec<&str> = combined.lines().collect();
    let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    let mut tail = String::new();
    for line in &lines[start..] {
        let _ = writeln!(tail, "{line}");
    }
    tail
}
