//! Interpretation of the agent's line-delimited record stream.
//!
//! The agent writes one JSON record per line. The last record of type
//! `result` carries the outcome:
//!
//! ```text
//! {"type":"system","subtype":"init",...}
//! {"type":"assistant","message":{"content":[{"type":"text","text":"..."}]}}
//! {"type":"result","subtype":"success","is_error":false,"result":"...","session_id":"..."}
//! ```
//!
//! `StreamDigest` is fed line by line while the process runs and keeps only
//! the result record and a short tail of recent records, never the whole
//! stream. `interpret` turns the digest plus the process exit into an
//! `AgentResponse`.

use crate::types::{AgentResponse, RetryCode};
use serde::Deserialize;
use std::collections::VecDeque;

pub const RESULT_RECORD_TYPE: &str = "result";

/// Result subtype the agent uses when it started but could not finish.
pub const ERROR_DURING_EXECUTION: &str = "error_during_execution";

/// Default bound on surfaced error text, in characters.
pub const DEFAULT_MAX_ERROR_CHARS: usize = 500;

/// Records kept for diagnostics when no result record arrives.
const RECENT_RECORDS: usize = 5;

const TRUNCATION_SUFFIX: &str = "... (truncated)";

/// Final `result` record.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResultRecord {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl ResultRecord {
    pub fn is_error_during_execution(&self) -> bool {
        self.subtype.as_deref() == Some(ERROR_DURING_EXECUTION)
    }
}

/// How the agent process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Exited(i32),
    TimedOut { after_secs: u64 },
    Killed,
}

/// Running summary of a record stream.
#[derive(Debug, Default)]
pub struct StreamDigest {
    result: Option<ResultRecord>,
    recent: VecDeque<serde_json::Value>,
    records: usize,
    unparseable: usize,
}

impl StreamDigest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Digest a whole captured stream.
    pub fn from_stream(stream: &str) -> Self {
        let mut digest = Self::new();
        for line in stream.lines() {
            digest.push_line(line);
        }
        digest
    }

    pub fn push_line(&mut self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
            self.unparseable += 1;
            return;
        };
        self.records += 1;

        if value.get("type").and_then(serde_json::Value::as_str) == Some(RESULT_RECORD_TYPE) {
            if let Ok(record) = serde_json::from_value::<ResultRecord>(value.clone()) {
                self.result = Some(record);
            }
        }

        if self.recent.len() == RECENT_RECORDS {
            self.recent.pop_front();
        }
        self.recent.push_back(value);
    }

    pub fn result(&self) -> Option<&ResultRecord> {
        self.result.as_ref()
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn unparseable(&self) -> usize {
        self.unparseable
    }

    /// Best human-readable text from the most recent records.
    ///
    /// Prefers assistant text blocks, then any `error` or `result` string.
    pub fn salvage_fragment(&self) -> Option<String> {
        self.recent.iter().rev().find_map(|record| {
            let from_message = record
                .pointer("/message/content")
                .and_then(serde_json::Value::as_array)
                .and_then(|blocks| {
                    let texts: Vec<&str> = blocks
                        .iter()
                        .filter(|b| b.get("type").and_then(serde_json::Value::as_str) == Some("text"))
                        .filter_map(|b| b.get("text").and_then(serde_json::Value::as_str))
                        .filter(|t| !t.trim().is_empty())
                        .collect();
                    (!texts.is_empty()).then(|| texts.join("\n"))
                });
            from_message.or_else(|| {
                ["error", "result"].iter().find_map(|key| {
                    record
                        .get(*key)
                        .and_then(serde_json::Value::as_str)
                        .filter(|t| !t.trim().is_empty())
                        .map(str::to_string)
                })
            })
        })
    }
}

/// Truncate to at most `max_chars` characters plus a marker suffix.
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((byte_idx, _)) => format!("{}{TRUNCATION_SUFFIX}", &text[..byte_idx]),
    }
}

/// Fold the digest and process exit into a classified response.
///
/// Success text is passed through whole; every failure text is bounded by
/// `max_error_chars`.
pub fn interpret(
    digest: &StreamDigest,
    exit: ProcessExit,
    stderr: &str,
    max_error_chars: usize,
) -> AgentResponse {
    let bounded = |text: &str| truncate_output(text.trim(), max_error_chars);
    let session = digest.result().and_then(|r| r.session_id.clone());

    match exit {
        ProcessExit::TimedOut { after_secs } => AgentResponse::failed(
            bounded(&format!("agent timed out after {after_secs}s")),
            RetryCode::Timeout,
        )
        .with_session(session),
        ProcessExit::Killed => {
            AgentResponse::failed("agent invocation was terminated", RetryCode::None)
                .with_session(session)
        }
        ProcessExit::Exited(code) if code != 0 => {
            let detail = digest
                .result()
                .filter(|r| r.is_error)
                .and_then(|r| r.result.clone())
                .filter(|t| !t.trim().is_empty())
                .or_else(|| (!stderr.trim().is_empty()).then(|| stderr.to_string()))
                .or_else(|| digest.salvage_fragment())
                .unwrap_or_else(|| "no output".to_string());
            AgentResponse::failed(
                bounded(&format!("agent exited with status {code}: {}", detail.trim())),
                RetryCode::TransientToolError,
            )
            .with_session(session)
        }
        ProcessExit::Exited(_) => match digest.result() {
            Some(record) if record.is_error_during_execution() => AgentResponse::failed(
                "Error during execution: agent started but did not return a result",
                RetryCode::ErrorDuringExecution,
            )
            .with_session(session),
            Some(record) if record.is_error => {
                let text = record
                    .result
                    .clone()
                    .filter(|t| !t.trim().is_empty())
                    .or_else(|| record.subtype.clone())
                    .unwrap_or_else(|| "agent reported an error".to_string());
                AgentResponse::failed(bounded(&text), RetryCode::None).with_session(session)
            }
            Some(record) => {
                AgentResponse::succeeded(record.result.clone().unwrap_or_default(), session)
            }
            None => {
                let message = match digest.salvage_fragment() {
                    Some(fragment) => format!("no result record in agent output: {fragment}"),
                    None => "no result record in agent output".to_string(),
                };
                AgentResponse::failed(bounded(&message), RetryCode::None)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_line(subtype: &str, is_error: bool, result: &str) -> String {
        serde_json::json!({
            "type": "result",
            "subtype": subtype,
            "is_error": is_error,
            "result": result,
            "session_id": "sess-1",
        })
        .to_string()
    }

    fn assistant_line(text: &str) -> String {
        serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": text}]},
        })
        .to_string()
    }

    #[test]
    fn successful_result_is_unwrapped() {
        let stream = [
            r#"{"type":"system","subtype":"init"}"#.to_string(),
            assistant_line("working on it"),
            result_line("success", false, "specs/plan.md"),
        ]
        .join("\n");
        let digest = StreamDigest::from_stream(&stream);
        assert_eq!(digest.records(), 3);

        let response = interpret(&digest, ProcessExit::Exited(0), "", 500);
        assert!(response.success);
        assert_eq!(response.output, "specs/plan.md");
        assert_eq!(response.session_id.as_deref(), Some("sess-1"));
        assert_eq!(response.retry_code, RetryCode::None);
    }

    #[test]
    fn error_result_is_truncated_and_never_the_raw_stream() {
        let long_error = "E".repeat(5_000);
        let filler: Vec<String> = (0..50).map(|i| assistant_line(&format!("step {i}"))).collect();
        let stream = format!(
            "{}\n{}",
            filler.join("\n"),
            result_line("error_max_turns", true, &long_error)
        );
        let digest = StreamDigest::from_stream(&stream);
        let response = interpret(&digest, ProcessExit::Exited(0), "", 100);

        assert!(!response.success);
        assert_eq!(response.retry_code, RetryCode::None);
        assert!(response.output.chars().count() <= 100 + TRUNCATION_SUFFIX.len());
        assert!(response.output.ends_with(TRUNCATION_SUFFIX));
        assert!(!response.output.contains("step 0"));
        assert!(response.output.len() < stream.len());
    }

    #[test]
    fn error_during_execution_is_retryable() {
        let stream = serde_json::json!({
            "type": "result",
            "subtype": "error_during_execution",
            "is_error": true,
            "session_id": "s",
        })
        .to_string();
        let response = interpret(
            &StreamDigest::from_stream(&stream),
            ProcessExit::Exited(0),
            "",
            500,
        );
        assert!(!response.success);
        assert_eq!(response.retry_code, RetryCode::ErrorDuringExecution);
    }

    #[test]
    fn missing_result_salvages_recent_text() {
        let stream = [
            assistant_line("first"),
            "not json at all".to_string(),
            assistant_line("Permission denied writing app/main.py"),
        ]
        .join("\n");
        let digest = StreamDigest::from_stream(&stream);
        assert_eq!(digest.unparseable(), 1);

        let response = interpret(&digest, ProcessExit::Exited(0), "", 500);
        assert!(!response.success);
        assert_eq!(response.retry_code, RetryCode::None);
        assert!(response.output.contains("Permission denied"));
        assert!(!response.output.contains("first"));
    }

    #[test]
    fn empty_stream_without_result() {
        let response = interpret(&StreamDigest::new(), ProcessExit::Exited(0), "", 500);
        assert_eq!(response.output, "no result record in agent output");
    }

    #[test]
    fn nonzero_exit_is_transient_and_uses_stderr() {
        let response = interpret(
            &StreamDigest::new(),
            ProcessExit::Exited(2),
            "rate limited\n",
            500,
        );
        assert!(!response.success);
        assert_eq!(response.retry_code, RetryCode::TransientToolError);
        assert_eq!(response.output, "agent exited with status 2: rate limited");
    }

    #[test]
    fn timeout_is_retryable() {
        let response = interpret(
            &StreamDigest::new(),
            ProcessExit::TimedOut { after_secs: 30 },
            "",
            500,
        );
        assert_eq!(response.retry_code, RetryCode::Timeout);
        assert!(response.output.contains("30s"));
    }

    #[test]
    fn killed_is_terminal() {
        let response = interpret(&StreamDigest::new(), ProcessExit::Killed, "", 500);
        assert_eq!(response.retry_code, RetryCode::None);
        assert!(!response.success);
    }

    #[test]
    fn last_result_record_wins() {
        let stream = [
            result_line("success", false, "first"),
            result_line("success", false, "second"),
        ]
        .join("\n");
        let response = interpret(
            &StreamDigest::from_stream(&stream),
            ProcessExit::Exited(0),
            "",
            500,
        );
        assert_eq!(response.output, "second");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_output("héllo", 2), "hé... (truncated)");
        assert_eq!(truncate_output("short", 10), "short");
        assert_eq!(truncate_output("exact", 5), "exact");
    }
}
