//! Node.js subprocess integration (§4.D, §6): runs a configured script with
//! the request parameter bag piped to stdin as JSON, and reads back a JSON
//! response envelope from stdout.

use crate::error::AppError;
use serde::Deserialize;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::warn;

/// The `{"status": ..., "headers": [...], "body": ...}` envelope a Node.js
/// action script writes to stdout (§4.D).
#[derive(Debug, Clone, Deserialize)]
pub struct NodeJsResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

/// Spawns `node_binary script`, writes `input` to its stdin as JSON, and
/// parses its stdout as a [`NodeJsResponse`]. Stderr is logged at `warn`
/// rather than treated as failure, since a script may emit diagnostics on a
/// successful run.
pub async fn invoke(
    node_binary: &str,
    script: &str,
    input: &Value,
    action_timeout: Duration,
) -> Result<NodeJsResponse, AppError> {
    let mut child = Command::new(node_binary)
        .arg(script)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| AppError::NodeJsError(format!("spawn '{script}' failed: {e}")))?;

    let payload = serde_json::to_vec(input)
        .map_err(|e| AppError::NodeJsError(format!("encoding request body failed: {e}")))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(&payload)
            .await
            .map_err(|e| AppError::NodeJsError(format!("writing to '{script}' stdin failed: {e}")))?;
    }

    let output = timeout(action_timeout, child.wait_with_output())
        .await
        .map_err(|_| AppError::Timeout)?
        .map_err(|e| AppError::NodeJsError(format!("running '{script}' failed: {e}")))?;

    if !output.stderr.is_empty() {
        warn!(script, stderr = %String::from_utf8_lossy(&output.stderr), "node.js script wrote to stderr");
    }
    if !output.status.success() {
        return Err(AppError::NodeJsError(format!(
            "'{script}' exited with status {}",
            output.status
        )));
    }

    serde_json::from_slice(&output.stdout)
        .map_err(|e| AppError::NodeJsError(format!("invalid response envelope from '{script}': {e}")))
}
