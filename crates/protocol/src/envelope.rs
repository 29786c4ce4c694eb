//! Backend → client envelopes and the lenient decoder
//!
//! Envelopes are strictly ordered by arrival and never reordered. Decoding
//! must never fail: malformed or unrecognized frames are coerced into a
//! synthetic `output` text envelope so one bad frame cannot kill a
//! long-lived session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One decoded inbound protocol message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Session metadata: `init`, model changes, or the legacy inline
    /// permission signal (`subtype = "permission_request"`)
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        request_id: Option<String>,
        #[serde(default)]
        request: Option<Value>,
    },

    /// Assistant content blocks (text, thinking, tool_use)
    Assistant {
        #[serde(default)]
        message: Value,
    },

    /// Echoed user message; carries tool_result blocks mid-turn
    User {
        #[serde(default)]
        message: Value,
    },

    /// Terminal marker for a structured turn
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        usage: Option<Value>,
        #[serde(default)]
        permission_denials: Vec<Value>,
    },

    /// Synchronous permission ask requiring a `control_response`
    ControlRequest {
        request_id: String,
        #[serde(default)]
        request: Value,
    },

    /// The backend withdrew a pending `control_request`
    ControlCancelRequest { request_id: String },

    /// Server-side transcript replay: raw text and/or structured envelopes
    History {
        #[serde(default)]
        data: Option<String>,
        #[serde(default)]
        messages: Vec<Value>,
    },

    /// Resume referenced a session the backend no longer knows
    SessionNotFound {
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Backend-reported error, non-fatal to the session
    Error {
        #[serde(default)]
        message: String,
    },

    /// Raw-mode terminal output chunk
    Output { data: String },

    /// Raw-mode process exit
    Exit {
        #[serde(default)]
        code: Option<i32>,
    },
}

impl Envelope {
    /// Synthetic text envelope wrapping input the decoder could not parse
    fn synthetic_text(raw: &str) -> Self {
        Envelope::Output {
            data: raw.to_string(),
        }
    }

    /// True for envelopes that end a structured turn
    pub fn is_terminal(&self) -> bool {
        matches!(self, Envelope::Result { .. } | Envelope::Exit { .. })
    }
}

/// Decode one inbound text frame. Never fails: unparseable or unrecognized
/// input degrades to a synthetic `output` envelope.
pub fn decode(raw: &str) -> Envelope {
    match serde_json::from_str::<Envelope>(raw) {
        Ok(envelope) => envelope,
        Err(_) => Envelope::synthetic_text(raw),
    }
}

/// Decode one inbound binary frame as UTF-8 text first
pub fn decode_frame(bytes: &[u8]) -> Envelope {
    decode(&String::from_utf8_lossy(bytes))
}
