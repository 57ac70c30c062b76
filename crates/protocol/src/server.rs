//! Server → Client frames

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Project;

/// Frames sent from server to client.
///
/// Tags and field casing are preserved verbatim for client compatibility;
/// the mixed kebab/snake style mirrors what the UI already speaks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// One-shot: the agent assigned a session id to a fresh invocation
    #[serde(rename = "session-created")]
    SessionCreated {
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    /// A parsed NDJSON object from the agent's stdout
    #[serde(rename = "agent-response")]
    AgentResponse { data: Value },

    /// A stdout line that was not valid JSON
    #[serde(rename = "agent-output")]
    AgentOutput { data: String },

    /// A stderr chunk or a runner failure; non-fatal unless followed by
    /// completion
    #[serde(rename = "agent-error")]
    AgentError { error: String },

    /// Terminal frame for an invocation; nothing follows it
    #[serde(rename = "agent-complete")]
    AgentComplete {
        #[serde(rename = "exitCode")]
        exit_code: i32,
        #[serde(rename = "isNewSession")]
        is_new_session: bool,
    },

    /// Reply to an `abort-session` frame
    #[serde(rename = "session-aborted")]
    SessionAborted {
        #[serde(rename = "sessionId")]
        session_id: String,
        success: bool,
    },

    /// Watcher broadcast: something changed under the agent root
    #[serde(rename = "projects_updated")]
    ProjectsUpdated {
        projects: Vec<Project>,
        /// Epoch milliseconds at broadcast time
        timestamp: u64,
        #[serde(rename = "changeType")]
        change_type: String,
        /// Path relative to the agent root
        #[serde(rename = "changedFile")]
        changed_file: String,
    },

    /// Protocol-level error (malformed or unknown inbound frame)
    #[serde(rename = "error")]
    Error { error: String },
}
