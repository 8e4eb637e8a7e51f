//! CLI responder: spawns the local agent binary to compose a reply.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use super::{Responder, Result, WorkerError};
use crate::config::WorkerSettings;

pub struct AgentCliResponder {
    bin: PathBuf,
    session_id: String,
    timeout: Duration,
}

impl AgentCliResponder {
    pub fn new(cfg: &WorkerSettings) -> Option<Self> {
        Some(Self {
            bin: cfg.agent_bin.clone()?,
            session_id: cfg.session_id.clone(),
            timeout: Duration::from_secs(cfg.gateway_timeout_secs),
        })
    }
}

#[async_trait]
impl Responder for AgentCliResponder {
    fn name(&self) -> &str {
        "agent-cli"
    }

    async fn generate(&self, prompt: &str, correlation_key: &str) -> Result<String> {
        let session = if correlation_key.is_empty() {
            self.session_id.clone()
        } else {
            format!("{}-{}", self.session_id, correlation_key)
        };

        let run = Command::new(&self.bin)
            .arg("agent")
            .args(["--session-id", &session])
            .args(["--message", prompt])
            .arg("--json")
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| WorkerError::Timeout(self.timeout.as_secs()))?
            .map_err(|e| WorkerError::Fetch(format!("spawn {}: {}", self.bin.display(), e)))?;

        if !output.status.success() {
            let stderr: String = String::from_utf8_lossy(&output.stderr)
                .chars()
                .take(400)
                .collect();
            return Err(WorkerError::Fetch(format!(
                "agent cli exited with {}: {}",
                output.status, stderr
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if stdout.is_empty() {
            return Ok(String::new());
        }

        Ok(extract_reply(&stdout))
    }
}

/// Pull the reply text out of the agent CLI's JSON output, tolerating the
/// output shapes different CLI versions produce. Non-JSON output is
/// returned as-is.
fn extract_reply(stdout: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(stdout) else {
        return stdout.to_string();
    };

    let candidates = [
        value.pointer("/result/payloads/0/text"),
        value.pointer("/content"),
        value.pointer("/message/content"),
        value.pointer("/output"),
    ];
    for candidate in candidates.into_iter().flatten() {
        if let Some(text) = candidate.as_str() {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    stdout.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_from_payloads_shape() {
        let out = r#"{"result":{"payloads":[{"text":"hello there"}]}}"#;
        assert_eq!(extract_reply(out), "hello there");
    }

    #[test]
    fn test_extract_from_content_shape() {
        let out = r#"{"content":"short answer"}"#;
        assert_eq!(extract_reply(out), "short answer");
    }

    #[test]
    fn test_extract_falls_back_to_raw_output() {
        assert_eq!(extract_reply("plain text reply"), "plain text reply");
        // JSON without any known field returns the raw blob.
        assert_eq!(extract_reply(r#"{"other":1}"#), r#"{"other":1}"#);
    }
}
