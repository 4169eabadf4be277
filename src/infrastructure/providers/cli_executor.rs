//! Shared subprocess execution plumbing for CLI-backed providers (spec
//! Component A), grounded on the streaming-substrate pattern the teacher
//! uses for its Claude Code adapter: spawn, pipe the prompt to stdin, drain
//! stdout/stderr line-by-line under a timeout, then inspect the exit status.
//!
//! Provider-native SDK/wire-format details are out of scope (spec §1), so
//! every CLI provider is assumed to emit a single JSON "result envelope" on
//! stdout: `{ session_id?, status?, result|content, structured_output? }`.
//! A non-JSON stdout is treated as plain successful content.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::piece_state::{AgentResponse, AgentStatus};

/// One subprocess invocation: program, arguments, working directory, prompt
/// written to stdin, and an overall timeout.
pub struct CliInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

/// Raw output captured from a finished subprocess.
pub struct CliOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// Check whether `program` is runnable at all (spec §7: a missing CLI is a
/// provider error, not a configuration error, since it's only known at
/// call time).
pub async fn is_available(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Spawn `invocation`, write `prompt` to stdin, and collect stdout/stderr
/// under the invocation's timeout.
pub async fn run(invocation: CliInvocation, prompt: &str) -> EngineResult<CliOutput> {
    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args);
    if let Some(cwd) = &invocation.cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| EngineError::Provider(format!("failed to spawn {}: {e}", invocation.program)))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| EngineError::Provider("failed to open subprocess stdin".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| EngineError::Provider("failed to open subprocess stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| EngineError::Provider("failed to open subprocess stderr".to_string()))?;

    stdin
        .write_all(prompt.as_bytes())
        .await
        .map_err(|e| EngineError::Provider(format!("failed to write prompt to stdin: {e}")))?;
    drop(stdin);

    let wait_duration = invocation.timeout;
    let outcome = timeout(wait_duration, async {
        let mut stdout_reader = BufReader::new(stdout);
        let mut out = String::new();
        let mut line = String::new();
        while stdout_reader
            .read_line(&mut line)
            .await
            .map_err(|e| EngineError::Provider(format!("failed to read stdout: {e}")))?
            > 0
        {
            out.push_str(&line);
            line.clear();
        }

        let mut stderr_reader = BufReader::new(stderr);
        let mut err = String::new();
        let mut error_line = String::new();
        while stderr_reader
            .read_line(&mut error_line)
            .await
            .map_err(|e| EngineError::Provider(format!("failed to read stderr: {e}")))?
            > 0
        {
            err.push_str(&error_line);
            error_line.clear();
        }

        let status = child
            .wait()
            .await
            .map_err(|e| EngineError::Provider(format!("failed to wait for subprocess: {e}")))?;

        Ok::<_, EngineError>(CliOutput {
            stdout: out,
            stderr: err,
            success: status.success(),
        })
    })
    .await;

    match outcome {
        Ok(result) => result,
        Err(_) => Err(EngineError::Provider(format!(
            "{} timed out after {:?}",
            invocation.program, wait_duration
        ))),
    }
}

/// Parse a CLI result envelope, falling back to treating `raw` as plain
/// successful content when it isn't a JSON object.
pub fn parse_envelope(persona: &str, raw: &str) -> AgentResponse {
    let trimmed = raw.trim();
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(trimmed) {
        let status = match map.get("status").and_then(|v| v.as_str()) {
            Some("blocked") => AgentStatus::Blocked,
            Some("error") => AgentStatus::Error,
            _ => AgentStatus::Done,
        };
        let content = map
            .get("result")
            .or_else(|| map.get("content"))
            .and_then(|v| v.as_str())
            .unwrap_or(trimmed)
            .to_string();
        let session_id = map
            .get("session_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let structured_output = map.get("structured_output").cloned();
        let error = if status == AgentStatus::Error {
            Some(
                map.get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or(&content)
                    .to_string(),
            )
        } else {
            None
        };
        return AgentResponse {
            persona: persona.to_string(),
            status,
            content,
            timestamp: Utc::now(),
            session_id,
            structured_output,
            matched_rule_index: None,
            matched_rule_method: None,
            error,
        };
    }

    AgentResponse {
        persona: persona.to_string(),
        status: AgentStatus::Done,
        content: raw.to_string(),
        timestamp: Utc::now(),
        session_id: None,
        structured_output: None,
        matched_rule_index: None,
        matched_rule_method: None,
        error: None,
    }
}

/// Render the prompt sent over stdin: persona context followed by the
/// rendered instruction (mirrors the teacher's `format_prompt`, which
/// prepends an explicit agent invocation before the task body).
pub fn format_prompt(persona: &str, instruction: &str) -> String {
    format!("You are acting as the {persona} persona.\n\n{instruction}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_envelope() {
        let raw = r#"{"status":"done","result":"ok","session_id":"abc123"}"#;
        let response = parse_envelope("planner", raw);
        assert_eq!(response.status, AgentStatus::Done);
        assert_eq!(response.content, "ok");
        assert_eq!(response.session_id.as_deref(), Some("abc123"));
    }

    #[test]
    fn parses_blocked_envelope() {
        let raw = r#"{"status":"blocked","result":"need more info"}"#;
        let response = parse_envelope("planner", raw);
        assert_eq!(response.status, AgentStatus::Blocked);
    }

    #[test]
    fn falls_back_to_plain_text() {
        let response = parse_envelope("planner", "[PLAN:1]\nlooks good");
        assert_eq!(response.status, AgentStatus::Done);
        assert_eq!(response.content, "[PLAN:1]\nlooks good");
    }
}
