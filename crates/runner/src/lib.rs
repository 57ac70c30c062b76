//! Agentdeck Runner
//!
//! Drives the agent CLI as a subprocess: builds the argument list and the
//! isolated child environment, materializes image attachments, streams the
//! agent's NDJSON stdout, and owns the invocation lifecycle from spawn to
//! reap. The gateway consumes `RunnerEvent`s and frames them for clients.

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

pub mod args;
pub mod claude;
pub mod env;
pub mod images;

pub use claude::{spawn_agent, AgentHandle};

/// Errors that can occur while driving the agent
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to spawn agent: {0}")]
    SpawnFailed(String),

    #[error("agent binary not found; install the agent CLI or set AGENTDECK_AGENT_BIN")]
    BinaryNotFound,

    #[error("process communication error: {0}")]
    Io(#[from] std::io::Error),
}

/// Events emitted by a running invocation, in emission order.
/// `Complete` is always last.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    /// First stdout object carrying a `session_id`; emitted before the
    /// `Response` for that same line
    SessionCaptured { session_id: String },

    /// A parsed NDJSON object from stdout
    Response(Value),

    /// A stdout line that was not valid JSON
    Output(String),

    /// A stderr chunk; non-fatal
    Stderr(String),

    /// Child exited; nothing follows
    Complete { exit_code: i32 },
}

/// Everything needed to run the agent once
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Explicit agent binary; falls back to `resolve_agent_binary`
    pub agent_bin: Option<String>,
    /// The prompt, delivered via `--print`; when present stdin is closed
    pub prompt: Option<String>,
    /// Written to stdin with a trailing newline when no prompt is given
    pub stdin_command: Option<String>,
    /// Real project path, never the alias directory
    pub cwd: PathBuf,
    pub session_id: Option<String>,
    pub resume: bool,
    /// Opaque; anything other than "default" is forwarded verbatim
    pub permission_mode: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub skip_permissions: bool,
    pub images: Vec<agentdeck_protocol::ImageAttachment>,
    /// Env store record (unmasked)
    pub store_env: HashMap<String, String>,
    /// Per-request overrides; highest precedence
    pub extra_env: HashMap<String, String>,
    /// MCP tool-config to consult for `--mcp-config`
    pub mcp_config: Option<PathBuf>,
    /// Model for new (non-resume) invocations
    pub default_model: String,
}

/// Resolve the agent binary path.
/// 1. AGENTDECK_AGENT_BIN env var
/// 2. ~/.claude/local/claude
/// 3. Search PATH via `which`
pub fn resolve_agent_binary() -> Result<String, RunnerError> {
    if let Ok(path) = std::env::var("AGENTDECK_AGENT_BIN") {
        if std::path::Path::new(&path).exists() {
            return Ok(path);
        }
        warn!(
            component = "runner",
            event = "runner.binary.env_not_found",
            path = %path,
            "AGENTDECK_AGENT_BIN path does not exist, trying fallbacks"
        );
    }

    if let Ok(home) = std::env::var("HOME") {
        let local_path = format!("{}/.claude/local/claude", home);
        if std::path::Path::new(&local_path).exists() {
            return Ok(local_path);
        }
    }

    if let Ok(output) = std::process::Command::new("which").arg("claude").output() {
        if output.status.success() {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() && std::path::Path::new(&path).exists() {
                return Ok(path);
            }
        }
    }

    Err(RunnerError::BinaryNotFound)
}
