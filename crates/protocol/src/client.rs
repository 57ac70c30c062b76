//! Client → Server frames

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{ImageAttachment, ToolsSettings};

/// Frames sent from client to server.
///
/// The tags are part of the wire contract and must stay exactly as the
/// browser UI emits them. Unknown tags fail to parse; the gateway replies
/// with an `error` frame and keeps the connection open.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Run the agent in a project, optionally resuming a session
    #[serde(rename = "claude-command")]
    ClaudeCommand {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        #[serde(default)]
        options: CommandOptions,
    },

    /// Cooperatively terminate a live invocation
    #[serde(rename = "abort-session")]
    AbortSession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

/// Options carried by a `claude-command` frame
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandOptions {
    pub cwd: Option<String>,
    pub project_path: Option<String>,
    pub session_id: Option<String>,
    pub resume: bool,
    /// Passed through to the agent opaquely; only `"default"` suppresses
    /// the `--permission-mode` flag
    pub permission_mode: Option<String>,
    pub tools_settings: Option<ToolsSettings>,
    pub images: Vec<ImageAttachment>,
    /// Per-request environment, layered over the env store record
    pub env: HashMap<String, String>,
}
