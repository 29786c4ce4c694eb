//! Core types shared across the protocol

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Framing mode of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Interactive shell pass-through (byte stream)
    Raw,
    /// Turn-based agent conversation (event stream)
    Structured,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Raw => "raw",
            SessionMode::Structured => "structured",
        }
    }
}

/// Which source produced the currently displayed transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Speculatively painted from the local cache
    Local,
    /// Authoritative server replay
    Server,
}

/// Lifecycle of a tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Running,
    Complete,
    Error,
}

/// One part of the aggregated message timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    /// Assistant prose, grown by prefix merge of successive deltas
    Text { text: String },
    /// Assistant reasoning, same merge rule, rendered distinctly
    Thinking { text: String },
    /// A discrete agent-requested action correlated with its result
    ToolUse {
        /// Call id; may be absent until the stream assigns one
        id: Option<String>,
        name: String,
        input: Value,
        output: String,
        status: ToolStatus,
    },
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text { text: text.into() }
    }

    /// The call id, if this is a tool part that has one
    pub fn tool_id(&self) -> Option<&str> {
        match self {
            MessagePart::ToolUse { id, .. } => id.as_deref(),
            _ => None,
        }
    }
}

/// Where an approval request originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalSource {
    /// Synchronous `control_request` requiring a `control_response`
    ControlRequest,
    /// Legacy inline stream signal, same answer shape
    Stream,
    /// Post-hoc denial reported inside a terminal `result`
    Denial,
}

/// The caller's verdict on a pending approval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Allow,
    Deny,
    /// Acknowledge without answering; valid only for denial-sourced approvals
    Dismiss,
}

/// An approval awaiting the caller's decision. At most one per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub id: String,
    pub tool_name: Option<String>,
    pub tool_input: Value,
    pub source: ApprovalSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_suggestions: Option<Value>,
}

/// Token usage reported by a terminal `result` envelope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
}

impl TurnUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_part_serde_tags() {
        let part = MessagePart::ToolUse {
            id: Some("toolu_1".to_string()),
            name: "Bash".to_string(),
            input: serde_json::json!({"command": "ls"}),
            output: String::new(),
            status: ToolStatus::Running,
        };
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "tool_use");
        assert_eq!(json["status"], "running");

        let rt: MessagePart = serde_json::from_value(json).unwrap();
        assert_eq!(rt.tool_id(), Some("toolu_1"));
    }

    #[test]
    fn pending_approval_omits_empty_optionals() {
        let approval = PendingApproval {
            id: "req-1".to_string(),
            tool_name: Some("Write".to_string()),
            tool_input: serde_json::json!({"file_path": "/tmp/a"}),
            source: ApprovalSource::ControlRequest,
            file_path: Some("/tmp/a".to_string()),
            blocked_path: None,
            permission_suggestions: None,
        };
        let json = serde_json::to_value(&approval).unwrap();
        assert_eq!(json["source"], "control_request");
        assert!(json.get("blocked_path").is_none());
        assert!(json.get("permission_suggestions").is_none());
    }

    #[test]
    fn turn_usage_total() {
        let usage = TurnUsage {
            input_tokens: 120,
            output_tokens: 30,
            cached_tokens: 100,
        };
        assert_eq!(usage.total(), 150);
    }
}
