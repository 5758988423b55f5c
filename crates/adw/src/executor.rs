//! Agent executor: runs one instruction through the external coding agent.
//!
//! Each invocation:
//! - resolves the model from the injected `ModelTable`
//! - writes the prompt to `agents/<run>/<agent>/prompts/<instruction>.txt`
//! - spawns the agent in the worktree with a rebuilt environment
//! - streams stdout line by line into `raw_output.jsonl` and a `StreamDigest`
//! - waits with a timeout, a 30s heartbeat and external cancellation
//! - classifies the outcome and writes `response.json`
//!
//! Failures come back as `AgentResponse` values with a `RetryCode`;
//! `execute_with_retry` applies a `RetryPolicy` on top of any `AgentInvoker`.

use adw_core::config::Config;
use adw_core::models::ModelTable;
use adw_core::paths::RunPaths;
use adw_core::retry::RetryPolicy;
use adw_core::stream::{self, ProcessExit, StreamDigest};
use adw_core::types::{AgentRequest, AgentResponse, RetryCode};
use chrono::Utc;
use serde::Serialize;
use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between heartbeat log messages during long-running agent executions.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for capturing stdout/stderr after process exits or is killed.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on the `--version` probe.
const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum bytes of stderr kept in memory.
const MAX_STDERR_BYTES: usize = 1024 * 1024;

/// Workspace file that, when present, is handed to the agent as tool config.
pub const MCP_CONFIG_FILE: &str = ".mcp.json";

/// Variables copied from our environment into the agent's.
pub const ENV_ALLOWLIST: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "GITHUB_PAT",
    "GH_TOKEN",
    "CLAUDE_CODE_PATH",
    "HOME",
    "USER",
    "PATH",
    "SHELL",
    "TERM",
    "LANG",
    "LC_ALL",
    "TMPDIR",
];

/// Something that can run an agent request.
///
/// Implemented by `AgentExecutor` for the real process and by scripted
/// fakes in tests.
pub trait AgentInvoker: Send + Sync {
    fn invoke(&self, request: &AgentRequest) -> impl Future<Output = AgentResponse> + Send;
}

/// Invoke `agent`, retrying retryable failures per `policy`.
///
/// Never exceeds `policy.max_attempts()` invocations and always returns the
/// last response.
pub async fn execute_with_retry<A: AgentInvoker>(
    agent: &A,
    request: &AgentRequest,
    policy: &RetryPolicy,
) -> AgentResponse {
    let mut attempt = 1;
    loop {
        let response = agent.invoke(request).await;

        if response.success {
            if attempt > 1 {
                info!(
                    run_id = %request.run_id,
                    agent = %request.agent_name,
                    attempt,
                    "agent succeeded after retry"
                );
            }
            return response;
        }

        if !policy.should_retry(&response) {
            debug!(
                run_id = %request.run_id,
                agent = %request.agent_name,
                retry_code = response.retry_code.as_str(),
                "agent failure is not retryable"
            );
            return response;
        }

        if attempt > policy.max_retries() {
            warn!(
                run_id = %request.run_id,
                agent = %request.agent_name,
                attempts = attempt,
                retry_code = response.retry_code.as_str(),
                "agent retries exhausted"
            );
            return response;
        }

        let delay = policy.delay_before(attempt);
        warn!(
            run_id = %request.run_id,
            agent = %request.agent_name,
            attempt,
            max_retries = policy.max_retries(),
            retry_code = response.retry_code.as_str(),
            delay_ms = delay.as_millis() as u64,
            error = %response.output,
            "agent failed; retrying after delay"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn agent {}: {source}", bin.display())]
    Spawn {
        bin: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for agent: {0}")]
    Wait(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Executor settings taken from `Config`.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub agent_bin: PathBuf,
    /// `None` disables the bound.
    pub timeout: Option<Duration>,
    pub max_error_chars: usize,
    pub env_passthrough: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ExecutorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            agent_bin: config.agent_bin.clone(),
            timeout: config.agent_timeout(),
            max_error_chars: config.max_error_chars,
            env_passthrough: config.env_passthrough.clone(),
        }
    }
}

/// How the process wait loop terminated.
enum ProcessOutcome {
    Completed(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// Summary persisted next to the raw stream.
#[derive(Debug, Serialize)]
struct InvocationRecord<'a> {
    instruction: &'a str,
    args: &'a [String],
    model: &'a str,
    working_dir: &'a Path,
    started_at: chrono::DateTime<Utc>,
    duration_ms: u64,
    records: usize,
    unparseable_lines: usize,
    response: &'a AgentResponse,
}

#[derive(Debug)]
pub struct AgentExecutor {
    config: ExecutorConfig,
    models: ModelTable,
    paths: RunPaths,
    cancel: CancellationToken,
    verified: AtomicBool,
}

impl AgentExecutor {
    pub fn new(
        config: ExecutorConfig,
        models: ModelTable,
        paths: RunPaths,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            models,
            paths,
            cancel,
            verified: AtomicBool::new(false),
        }
    }

    pub fn model_for(&self, request: &AgentRequest) -> &str {
        self.models.resolve(request.instruction, request.model_set)
    }

    /// Command-line arguments for one invocation.
    pub fn build_args(&self, request: &AgentRequest, model: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-p".into(),
            request.prompt().into(),
            "--model".into(),
            model.into(),
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
            "--dangerously-skip-permissions".into(),
        ];
        let mcp = request.working_dir.join(MCP_CONFIG_FILE);
        if mcp.is_file() {
            args.push("--mcp-config".into());
            args.push(mcp.into_os_string());
        }
        args
    }

    /// Environment handed to the agent: the allowlist plus configured extras.
    pub fn agent_env(&self) -> Vec<(String, OsString)> {
        ENV_ALLOWLIST
            .iter()
            .copied()
            .map(str::to_string)
            .chain(self.config.env_passthrough.iter().cloned())
            .filter_map(|key| std::env::var_os(&key).map(|value| (key, value)))
            .collect()
    }

    /// Check that the agent binary runs. Cached after the first success.
    pub async fn preflight(&self) -> std::result::Result<(), String> {
        if self.verified.load(Ordering::Relaxed) {
            return Ok(());
        }
        let bin = &self.config.agent_bin;
        let probe = Command::new(bin)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();
        match timeout(PREFLIGHT_TIMEOUT, probe).await {
            Ok(Ok(output)) if output.status.success() => {
                debug!(
                    bin = %bin.display(),
                    version = %String::from_utf8_lossy(&output.stdout).trim(),
                    "agent preflight passed"
                );
                self.verified.store(true, Ordering::Relaxed);
                Ok(())
            }
            Ok(Ok(output)) => Err(format!(
                "agent executable {} failed --version: {}",
                bin.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )),
            Ok(Err(e)) => Err(format!(
                "agent executable {} is not runnable: {e}",
                bin.display()
            )),
            Err(_) => Err(format!(
                "agent executable {} did not answer --version within {}s",
                bin.display(),
                PREFLIGHT_TIMEOUT.as_secs()
            )),
        }
    }

    /// Run one request once. Never returns an error: every failure is a response.
    pub async fn execute_template(&self, request: &AgentRequest) -> AgentResponse {
        if let Err(message) = self.preflight().await {
            warn!(run_id = %request.run_id, agent = %request.agent_name, "{message}");
            return AgentResponse::failed(
                stream::truncate_output(&message, self.config.max_error_chars),
                RetryCode::None,
            );
        }

        match self.run(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    run_id = %request.run_id,
                    agent = %request.agent_name,
                    error = %e,
                    "agent invocation failed"
                );
                let code = match &e {
                    ExecutorError::Spawn { source, .. }
                        if source.kind() == std::io::ErrorKind::NotFound =>
                    {
                        RetryCode::None
                    }
                    _ => RetryCode::ExecutionError,
                };
                AgentResponse::failed(
                    stream::truncate_output(&e.to_string(), self.config.max_error_chars),
                    code,
                )
            }
        }
    }

    async fn run(&self, request: &AgentRequest) -> Result<AgentResponse> {
        let agent_dir = self.paths.agent_dir(&request.run_id, &request.agent_name);
        let prompt_path =
            self.paths
                .prompt_file(&request.run_id, &request.agent_name, request.instruction);
        let raw_path = self.paths.raw_output_file(&request.run_id, &request.agent_name);
        let response_path = self.paths.response_file(&request.run_id, &request.agent_name);

        if let Some(prompts_dir) = prompt_path.parent() {
            create_dir(prompts_dir)?;
        }
        let prompt = request.prompt();
        std::fs::write(&prompt_path, &prompt).map_err(io_err(&prompt_path))?;

        let model = self.model_for(request).to_string();
        let started_at = Utc::now();
        let started = Instant::now();

        let mut cmd = Command::new(&self.config.agent_bin);
        cmd.args(self.build_args(request, &model))
            .current_dir(&request.working_dir)
            .env_clear()
            .envs(self.agent_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            run_id = %request.run_id,
            agent = %request.agent_name,
            instruction = %request.instruction,
            model = %model,
            working_dir = %request.working_dir.display(),
            "spawning agent"
        );

        let mut child = cmd.spawn().map_err(|source| ExecutorError::Spawn {
            bin: self.config.agent_bin.clone(),
            source,
        })?;

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(stream_records(stdout, raw_path.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_bounded(stderr, MAX_STDERR_BYTES)));

        let outcome = loop {
            let elapsed = started.elapsed();

            if let Some(limit) = self.config.timeout {
                if elapsed >= limit {
                    warn!(
                        run_id = %request.run_id,
                        agent = %request.agent_name,
                        timeout_sec = limit.as_secs(),
                        "agent timed out; killing"
                    );
                    if let Err(err) = child.kill().await {
                        warn!(error = %err, "failed to kill timed-out agent");
                    }
                    break ProcessOutcome::TimedOut;
                }
            }

            let remaining = self
                .config
                .timeout
                .map_or(Duration::MAX, |limit| limit.saturating_sub(elapsed));
            let sleep_duration = HEARTBEAT_INTERVAL.min(remaining);

            tokio::select! {
                result = child.wait() => {
                    break ProcessOutcome::Completed(result.map_err(ExecutorError::Wait)?);
                }
                () = self.cancel.cancelled() => {
                    info!(
                        run_id = %request.run_id,
                        agent = %request.agent_name,
                        "cancellation requested; killing agent"
                    );
                    if let Err(err) = child.kill().await {
                        warn!(error = %err, "failed to kill cancelled agent");
                    }
                    break ProcessOutcome::Cancelled;
                }
                () = tokio::time::sleep(sleep_duration) => {
                    info!(
                        run_id = %request.run_id,
                        agent = %request.agent_name,
                        elapsed_sec = started.elapsed().as_secs(),
                        "agent still running"
                    );
                }
            }
        };

        // Pipes close once the process is gone; the tasks finish quickly.
        let digest = match stdout_task {
            Some(task) => match timeout(IO_CAPTURE_TIMEOUT, task).await {
                Ok(Ok(Ok(digest))) => digest,
                Ok(Ok(Err(err))) => {
                    warn!(error = %err, "stdout capture failed");
                    StreamDigest::new()
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "stdout task panicked");
                    StreamDigest::new()
                }
                Err(_) => {
                    warn!("stdout capture timed out");
                    StreamDigest::new()
                }
            },
            None => StreamDigest::new(),
        };
        let stderr = match stderr_task {
            Some(task) => match timeout(IO_CAPTURE_TIMEOUT, task).await {
                Ok(Ok(Ok(buf))) => buf,
                Ok(Ok(Err(err))) => {
                    warn!(error = %err, "stderr capture failed");
                    Vec::new()
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "stderr task panicked");
                    Vec::new()
                }
                Err(_) => {
                    warn!("stderr capture timed out");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let exit = match outcome {
            ProcessOutcome::Completed(status) => ProcessExit::Exited(status.code().unwrap_or(-1)),
            ProcessOutcome::TimedOut => ProcessExit::TimedOut {
                after_secs: started.elapsed().as_secs(),
            },
            ProcessOutcome::Cancelled => ProcessExit::Killed,
        };
        let stderr = String::from_utf8_lossy(&stderr);
        let response = stream::interpret(&digest, exit, &stderr, self.config.max_error_chars);
        let duration_ms = started.elapsed().as_millis() as u64;

        info!(
            run_id = %request.run_id,
            agent = %request.agent_name,
            success = response.success,
            retry_code = response.retry_code.as_str(),
            records = digest.records(),
            duration_ms,
            "agent finished"
        );

        let record = InvocationRecord {
            instruction: request.instruction.as_str(),
            args: &request.args,
            model: &model,
            working_dir: &request.working_dir,
            started_at,
            duration_ms,
            records: digest.records(),
            unparseable_lines: digest.unparseable(),
            response: &response,
        };
        match serde_json::to_string_pretty(&record) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&response_path, json) {
                    warn!(path = %response_path.display(), error = %e, "failed to write response record");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize response record"),
        }
        debug!(dir = %agent_dir.display(), "agent artifacts written");

        Ok(response)
    }
}

impl AgentInvoker for AgentExecutor {
    fn invoke(&self, request: &AgentRequest) -> impl Future<Output = AgentResponse> + Send {
        self.execute_template(request)
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ExecutorError + '_ {
    move |source| ExecutorError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn create_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(io_err(path))
}

/// Copy the record stream to disk as it arrives and digest each line.
async fn stream_records<R: tokio::io::AsyncRead + Unpin>(
    reader: R,
    path: PathBuf,
) -> std::io::Result<StreamDigest> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)
        .await?;

    let mut buf_reader = tokio::io::BufReader::new(reader);
    let mut line = String::new();
    let mut digest = StreamDigest::new();

    loop {
        line.clear();
        let n = buf_reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        // Write to disk immediately so partial output survives timeouts.
        file.write_all(line.as_bytes()).await?;
        digest.push_line(&line);
    }

    file.flush().await?;
    Ok(digest)
}

/// Read from an async reader with a maximum byte limit.
async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            warn!(max_bytes, "stderr exceeded limit, truncating");
            // Keep reading to drain the pipe but discard
            while reader.read(&mut chunk).await? > 0 {}
            break;
        }

        let to_take = n.min(remaining);
        buf.extend_from_slice(&chunk[..to_take]);
    }

    Ok(buf)
}
