//! Invocation of the LLM agent CLI, in and out of the sandbox.
//!
//! The CLI contract: system prompt via `--file`, user prompt on
//! stdin, model selector in `provider/model` form, `--format json`
//! for newline-delimited JSON events on stdout, working directory via
//! `--dir`. Credentials are a JSON file mapping provider to an API
//! key, written before exec.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::warn;

use reviewd_core::envelope::extract_agent_text;

use crate::errors::JobError;
use crate::sandbox::{Sandbox, REPO_DIR};

/// Where the agent CLI looks for credentials.
pub const AUTH_PATH: &str = "/root/.local/share/opencode/auth.json";

const SYSTEM_PROMPT_PATH: &str = "/tmp/system-prompt.md";
const USER_MESSAGE_PATH: &str = "/tmp/user-message.md";
const RESULT_PATH: &str = "/tmp/result.txt";

/// Wall clock for a one-shot repository analysis.
pub const ANALYSIS_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// Wall clock for a review run.
pub const REVIEW_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Wall clock for one interview step on the host.
pub const INTERVIEW_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Render the credentials file for a `provider/model` selector.
pub fn auth_json(model: &str, api_key: &str) -> String {
    let provider = model.split('/').next().unwrap_or(model);
    serde_json::json!({
        provider: {
            "type": "api",
            "key": api_key,
        }
    })
    .to_string()
}

async fn write_auth(sandbox: &Sandbox, model: &str, api_key: &str) -> Result<(), JobError> {
    let dir = AUTH_PATH.rsplit_once('/').map(|(d, _)| d).unwrap_or("/tmp");
    let mkdir = sandbox.exec(&["mkdir", "-p", dir]).await?;
    if !mkdir.success() {
        return Err(JobError::Sandbox(format!(
            "mkdir for agent auth failed: {}",
            mkdir.stderr.trim()
        )));
    }
    sandbox.write_file(AUTH_PATH, &auth_json(model, api_key)).await
}

/// Run the agent once over the sandboxed working copy with a single
/// prompt on stdin. Returns the concatenated text payload.
pub async fn run_analysis(
    sandbox: &Sandbox,
    model: &str,
    api_key: &str,
    prompt: &str,
) -> Result<String, JobError> {
    write_auth(sandbox, model, api_key).await?;
    sandbox.write_file("/tmp/prompt.txt", prompt).await?;

    let command = format!(
        "cat /tmp/prompt.txt | opencode run --model {} --format json --dir {} > {}",
        model, REPO_DIR, RESULT_PATH
    );
    let run = sandbox
        .exec_with_timeout(&["sh", "-c", &command], ANALYSIS_TIMEOUT)
        .await?;
    if !run.success() {
        return Err(JobError::Sandbox(format!(
            "agent analysis run exited {}: {}",
            run.exit_code,
            run.stderr.trim()
        )));
    }

    read_result(sandbox).await
}

/// Run the agent with a system-prompt file and a user message on
/// stdin. Returns the concatenated text payload.
pub async fn run_review(
    sandbox: &Sandbox,
    model: &str,
    api_key: &str,
    system_prompt: &str,
    user_message: &str,
) -> Result<String, JobError> {
    write_auth(sandbox, model, api_key).await?;
    sandbox.write_file(SYSTEM_PROMPT_PATH, system_prompt).await?;
    sandbox.write_file(USER_MESSAGE_PATH, user_message).await?;

    let command = format!(
        "cat {} | opencode run --model {} --file {} --format json --dir {} > {}",
        USER_MESSAGE_PATH, model, SYSTEM_PROMPT_PATH, REPO_DIR, RESULT_PATH
    );
    let run = sandbox
        .exec_with_timeout(&["sh", "-c", &command], REVIEW_TIMEOUT)
        .await?;
    if !run.success() {
        return Err(JobError::Sandbox(format!(
            "agent review run exited {}: {}",
            run.exit_code,
            run.stderr.trim()
        )));
    }

    read_result(sandbox).await
}

async fn read_result(sandbox: &Sandbox) -> Result<String, JobError> {
    let output = sandbox.exec(&["cat", RESULT_PATH]).await?;
    if !output.success() {
        return Err(JobError::Sandbox(format!(
            "reading agent output failed: {}",
            output.stderr.trim()
        )));
    }
    Ok(extract_agent_text(&output.stdout))
}

/// Run the agent CLI directly on the worker host. The interview has
/// no repository working copy, so it skips the sandbox.
pub async fn run_host_agent(
    model: &str,
    api_key: &str,
    system_prompt: &str,
    user_message: &str,
) -> Result<String, JobError> {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    let auth_dir = format!("{}/.local/share/opencode", home);
    let auth_path = format!("{}/auth.json", auth_dir);
    tokio::fs::create_dir_all(&auth_dir)
        .await
        .map_err(|e| JobError::Sandbox(format!("failed to create {}: {}", auth_dir, e)))?;
    tokio::fs::write(&auth_path, auth_json(model, api_key))
        .await
        .map_err(|e| JobError::Sandbox(format!("failed to write {}: {}", auth_path, e)))?;

    let system_file = tempfile_path();
    tokio::fs::write(&system_file, system_prompt)
        .await
        .map_err(|e| JobError::Sandbox(format!("failed to write system prompt: {}", e)))?;

    let mut child = tokio::process::Command::new("opencode")
        .args(["run", "--model", model, "--file", &system_file, "--format", "json"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| JobError::Sandbox(format!("failed to spawn agent CLI: {}", e)))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| JobError::Sandbox("stdin not captured".to_string()))?;
    stdin
        .write_all(user_message.as_bytes())
        .await
        .map_err(|e| JobError::Sandbox(format!("failed to write user message: {}", e)))?;
    drop(stdin);

    let output = match tokio::time::timeout(INTERVIEW_TIMEOUT, child.wait_with_output()).await {
        Ok(result) => {
            result.map_err(|e| JobError::Sandbox(format!("agent CLI did not finish: {}", e)))?
        }
        Err(_) => {
            warn!("Host agent run exceeded {}s", INTERVIEW_TIMEOUT.as_secs());
            return Err(JobError::SandboxTimeout);
        }
    };

    let _ = tokio::fs::remove_file(&system_file).await;

    if !output.status.success() {
        return Err(JobError::Sandbox(format!(
            "agent CLI exited {}: {}",
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(extract_agent_text(&String::from_utf8_lossy(&output.stdout)))
}

fn tempfile_path() -> String {
    std::env::temp_dir()
        .join(format!("reviewd-system-{}.md", uuid::Uuid::new_v4()))
        .to_string_lossy()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_json_extracts_provider() {
        let json = auth_json("anthropic/claude-sonnet-4-5", "sk-test");
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["anthropic"]["type"], "api");
        assert_eq!(value["anthropic"]["key"], "sk-test");
    }

    #[test]
    fn test_auth_json_without_slash_uses_whole_selector() {
        let json = auth_json("anthropic", "sk-test");
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["anthropic"]["key"], "sk-test");
    }
}
