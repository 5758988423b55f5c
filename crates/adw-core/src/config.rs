//! Configuration parsing for the pipeline.
//!
//! Key=value format from `.adw/config` in the repository root.
//! Precedence: CLI flags > `--config` file > `.adw/config` > defaults.

use crate::models::{ModelChoice, ModelTable};
use crate::ports::PortRanges;
use crate::retry::RetryPolicy;
use crate::stream::DEFAULT_MAX_ERROR_CHARS;
use crate::types::{Instruction, ModelSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Repository-relative location of the default config file.
pub const DEFAULT_CONFIG_PATH: &str = ".adw/config";

/// Environment variable overriding the agent executable.
pub const AGENT_BIN_ENV: &str = "CLAUDE_CODE_PATH";

/// Prefix of per-instruction model overrides (`model.implement=sonnet,opus`).
const MODEL_KEY_PREFIX: &str = "model.";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // Directories
    pub agents_dir: PathBuf,
    pub trees_dir: PathBuf,

    // Agent process
    pub agent_bin: PathBuf,
    /// Upper bound on one agent invocation. Zero disables the bound.
    pub agent_timeout_sec: u64,
    pub agent_retries: u32,
    pub agent_retry_delays: Vec<u64>,
    pub max_error_chars: usize,
    pub model_set: ModelSet,
    pub model_table: ModelTable,
    /// Extra variable names forwarded into the agent environment.
    pub env_passthrough: Vec<String>,

    // Git
    pub base_branch: Option<String>,
    pub push_branches: bool,

    // Ports
    pub port_a_start: u16,
    pub port_b_start: u16,
    pub port_range_size: u16,

    // Worktree environment
    pub ports_env_file: PathBuf,
    pub port_a_env_key: String,
    pub port_b_env_key: String,
    pub service_url_env_key: String,
    pub env_files: Vec<PathBuf>,
    pub env_template_suffix: String,
    pub mcp_files: Vec<PathBuf>,
    pub install_cmds: Vec<String>,
    pub install_timeout_sec: u64,
    pub db_setup_cmd: Option<String>,
    pub db_setup_timeout_sec: u64,

    // Resolution loops
    pub test_max_attempts: u32,
    pub e2e_max_attempts: u32,
    pub review_max_attempts: u32,
    pub e2e_tests_dir: PathBuf,

    // Issue tracker
    pub bot_identifier: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agents_dir: PathBuf::from("agents"),
            trees_dir: PathBuf::from("trees"),
            agent_bin: PathBuf::from("claude"),
            agent_timeout_sec: 1800,
            agent_retries: 3,
            agent_retry_delays: vec![1, 3, 5],
            max_error_chars: DEFAULT_MAX_ERROR_CHARS,
            model_set: ModelSet::Base,
            model_table: ModelTable::default(),
            env_passthrough: Vec::new(),
            base_branch: None,
            push_branches: true,
            port_a_start: 9100,
            port_b_start: 9200,
            port_range_size: 15,
            ports_env_file: PathBuf::from(".ports.env"),
            port_a_env_key: "BACKEND_PORT".to_string(),
            port_b_env_key: "FRONTEND_PORT".to_string(),
            service_url_env_key: "VITE_BACKEND_URL".to_string(),
            env_files: vec![PathBuf::from(".env"), PathBuf::from("app/server/.env")],
            env_template_suffix: ".sample".to_string(),
            mcp_files: vec![
                PathBuf::from(".mcp.json"),
                PathBuf::from("playwright-mcp-config.json"),
            ],
            install_cmds: Vec::new(),
            install_timeout_sec: 300,
            db_setup_cmd: None,
            db_setup_timeout_sec: 60,
            test_max_attempts: 4,
            e2e_max_attempts: 2,
            review_max_attempts: 3,
            e2e_tests_dir: PathBuf::from(".claude/commands/e2e"),
            bot_identifier: "[ADW-AGENTS]".to_string(),
        }
    }
}

impl Config {
    /// Load config for a repository.
    ///
    /// Reads `.adw/config` when present, then `explicit` on top of it, then
    /// applies the `CLAUDE_CODE_PATH` override.
    pub fn load(repo_root: &Path, explicit: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        let default_path = repo_root.join(DEFAULT_CONFIG_PATH);
        if default_path.exists() {
            config.load_file(&default_path)?;
        }
        if let Some(path) = explicit {
            config.load_file(path)?;
        }
        if let Some(bin) = std::env::var_os(AGENT_BIN_ENV).filter(|v| !v.is_empty()) {
            config.agent_bin = PathBuf::from(bin);
        }
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        self.parse_content(&content, &path.display().to_string())
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str, source: &str) -> Result<()> {
        for line in content.lines() {
            let trimmed = line.trim();

            // Skip empty lines and comments
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value, source)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str, source: &str) -> Result<()> {
        if let Some(name) = key.strip_prefix(MODEL_KEY_PREFIX) {
            let instruction: Instruction =
                name.parse().map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("unknown instruction '{name}'"),
                })?;
            let choice = ModelChoice::parse(value).map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })?;
            self.model_table.set(instruction, choice);
            return Ok(());
        }

        match key {
            "agents_dir" => self.agents_dir = PathBuf::from(value),
            "trees_dir" => self.trees_dir = PathBuf::from(value),
            "agent_bin" => self.agent_bin = PathBuf::from(value),
            "agent_timeout_sec" => self.agent_timeout_sec = Self::parse_int(key, value)?,
            "agent_retries" => self.agent_retries = Self::parse_int(key, value)?,
            "agent_retry_delays" => {
                self.agent_retry_delays = value
                    .split_whitespace()
                    .map(|d| Self::parse_int(key, d))
                    .collect::<Result<_>>()?;
            }
            "max_error_chars" => self.max_error_chars = Self::parse_int(key, value)?,
            "model_set" => {
                self.model_set = value.parse().map_err(|_| {
                    ConfigError::InvalidLine(format!(
                        "model_set must be 'base' or 'heavy', got '{value}'"
                    ))
                })?;
            }
            "env_passthrough" => {
                self.env_passthrough = value.split_whitespace().map(str::to_string).collect();
            }
            "base_branch" => {
                self.base_branch = (!value.is_empty()).then(|| value.to_string());
            }
            "push_branches" => self.push_branches = Self::parse_bool(key, value)?,
            "port_a_start" => self.port_a_start = Self::parse_int(key, value)?,
            "port_b_start" => self.port_b_start = Self::parse_int(key, value)?,
            "port_range_size" => self.port_range_size = Self::parse_int(key, value)?,
            "ports_env_file" => self.ports_env_file = PathBuf::from(value),
            "port_a_env_key" => self.port_a_env_key = value.to_string(),
            "port_b_env_key" => self.port_b_env_key = value.to_string(),
            "service_url_env_key" => self.service_url_env_key = value.to_string(),
            "env_files" => {
                self.env_files = value.split_whitespace().map(PathBuf::from).collect();
            }
            "env_template_suffix" => self.env_template_suffix = value.to_string(),
            "mcp_files" => {
                self.mcp_files = value.split_whitespace().map(PathBuf::from).collect();
            }
            "install_cmds" => {
                // Pipe-separated list of commands
                self.install_cmds = value
                    .split('|')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            "install_timeout_sec" => self.install_timeout_sec = Self::parse_int(key, value)?,
            "db_setup_cmd" => {
                self.db_setup_cmd = (!value.is_empty()).then(|| value.to_string());
            }
            "db_setup_timeout_sec" => self.db_setup_timeout_sec = Self::parse_int(key, value)?,
            "test_max_attempts" => self.test_max_attempts = Self::parse_int(key, value)?,
            "e2e_max_attempts" => self.e2e_max_attempts = Self::parse_int(key, value)?,
            "review_max_attempts" => self.review_max_attempts = Self::parse_int(key, value)?,
            "e2e_tests_dir" => self.e2e_tests_dir = PathBuf::from(value),
            "bot_identifier" => self.bot_identifier = value.to_string(),
            _ => {
                warn!(key, source, "unknown config key");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.agent_retries,
            self.agent_retry_delays
                .iter()
                .copied()
                .map(Duration::from_secs)
                .collect(),
        )
    }

    pub fn port_ranges(&self) -> PortRanges {
        PortRanges {
            a_start: self.port_a_start,
            b_start: self.port_b_start,
            size: self.port_range_size,
        }
    }

    /// `None` when the agent timeout is disabled.
    pub fn agent_timeout(&self) -> Option<Duration> {
        (self.agent_timeout_sec > 0).then(|| Duration::from_secs(self.agent_timeout_sec))
    }
}
