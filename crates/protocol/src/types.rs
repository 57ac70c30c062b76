//! Core types shared across the protocol

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a project entered the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectOrigin {
    AgentManaged,
    ManuallyAdded,
}

/// A discovered project
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// Opaque alias derived from the real path (separators replaced by `-`)
    pub name: String,
    /// Real absolute path the alias resolves to
    pub path: String,
    pub display_name: String,
    pub origin: ProjectOrigin,
    /// Distinct sessions found under the alias directory
    pub session_count: usize,
}

/// Derived view of one conversation under a project
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub summary: String,
    pub last_activity: Option<String>,
    pub message_count: usize,
    pub cwd: Option<String>,
}

/// Paginated session list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPage {
    pub sessions: Vec<SessionSummary>,
    pub total: usize,
    pub has_more: bool,
}

/// Paginated message slice (tail-anchored when a limit is set)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<SessionMessage>,
    pub total: usize,
    pub has_more: bool,
}

/// One line of an append-only conversation log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub session_id: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub line_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageBody>,
}

/// The nested `message` object of a log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBody {
    pub role: String,
    pub content: MessageContent,
}

impl MessageBody {
    /// Only user/assistant turns count toward message totals
    pub fn is_conversational(&self) -> bool {
        matches!(self.role.as_str(), "user" | "assistant")
    }

    /// First text found in the body, if any
    pub fn first_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(s) => Some(s.as_str()),
            MessageContent::Parts(parts) => parts.iter().find_map(|p| match p {
                ContentPart::Known(KnownPart::Text { text }) => Some(text.as_str()),
                _ => None,
            }),
        }
    }
}

/// Message content is either a bare string or an array of typed parts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// A typed content part. Unknown shapes are preserved verbatim so reads
/// and delete-rewrites lose nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentPart {
    Known(KnownPart),
    Other(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KnownPart {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

/// An agent-scoped environment variable (values masked on external reads)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Per-invocation tool allow/deny policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsSettings {
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub skip_permissions: bool,
}

/// An inbound image attachment carried as a data URI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAttachment {
    pub name: String,
    /// `data:<mime>;base64,<payload>`
    pub data: String,
    #[serde(default)]
    pub size: u64,
    pub mime_type: String,
}
