//! Client → backend frames

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ApprovalDecision, SessionMode};

/// Frames sent from the client to the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Raw-mode keystrokes
    Input { data: String },

    /// Raw-mode terminal geometry
    Resize { cols: u16, rows: u16 },

    /// Structured-mode turn submission
    User {
        message: UserMessage,
        mode: SessionMode,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        context_files: Vec<String>,
    },

    /// Answer to a permission ask, echoing the original tool input
    ControlResponse {
        request_id: String,
        decision: ApprovalDecision,
        tool_input: Value,
        #[serde(rename = "updatedInput", skip_serializing_if = "Option::is_none")]
        updated_input: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        permission_suggestions: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// Payload of a structured turn submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

impl UserMessage {
    pub fn new(content: Vec<ContentBlock>) -> Self {
        Self {
            role: "user".to_string(),
            content,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(vec![ContentBlock::Text { text: text.into() }])
    }
}

/// One content item of a user message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

impl ContentBlock {
    /// Build a base64 image block from raw bytes
    pub fn image(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        ContentBlock::Image {
            source: ImageSource {
                kind: "base64".to_string(),
                media_type: media_type.into(),
                data: base64::engine::general_purpose::STANDARD.encode(bytes),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_type: String,
    pub data: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_frame_serializes_with_type_tag() {
        let frame = ClientFrame::Input {
            data: "ls\n".to_string(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "input");
        assert_eq!(json["data"], "ls\n");
    }

    #[test]
    fn resize_frame_roundtrip() {
        let frame = ClientFrame::Resize { cols: 80, rows: 24 };
        let json = serde_json::to_string(&frame).unwrap();
        let rt: ClientFrame = serde_json::from_str(&json).unwrap();
        match rt {
            ClientFrame::Resize { cols, rows } => {
                assert_eq!(cols, 80);
                assert_eq!(rows, 24);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn user_frame_carries_message_and_mode() {
        let frame = ClientFrame::User {
            message: UserMessage::text("hello"),
            mode: SessionMode::Structured,
            context_files: vec![],
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "user");
        assert_eq!(json["mode"], "structured");
        assert_eq!(json["message"]["role"], "user");
        assert_eq!(json["message"]["content"][0]["type"], "text");
        assert_eq!(json["message"]["content"][0]["text"], "hello");
        // Empty context_files is omitted entirely
        assert!(json.get("context_files").is_none());
    }

    #[test]
    fn image_block_encodes_base64() {
        let block = ContentBlock::image("image/png", b"\x89PNG");
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["source"]["type"], "base64");
        assert_eq!(json["source"]["media_type"], "image/png");
        assert_eq!(json["source"]["data"], "iVBORw==");
    }

    #[test]
    fn control_response_echoes_input_and_renames_updated_input() {
        let frame = ClientFrame::ControlResponse {
            request_id: "req-9".to_string(),
            decision: ApprovalDecision::Allow,
            tool_input: serde_json::json!({"command": "cargo test"}),
            updated_input: Some(serde_json::json!({"command": "cargo test -q"})),
            permission_suggestions: None,
            message: None,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "control_response");
        assert_eq!(json["decision"], "allow");
        assert_eq!(json["tool_input"]["command"], "cargo test");
        assert_eq!(json["updatedInput"]["command"], "cargo test -q");
        assert!(json.get("permission_suggestions").is_none());
        assert!(json.get("message").is_none());
    }

    #[test]
    fn deny_response_carries_message() {
        let frame = ClientFrame::ControlResponse {
            request_id: "req-10".to_string(),
            decision: ApprovalDecision::Deny,
            tool_input: Value::Null,
            updated_input: None,
            permission_suggestions: None,
            message: Some("not on this branch".to_string()),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["decision"], "deny");
        assert_eq!(json["message"], "not on this branch");
    }
}
