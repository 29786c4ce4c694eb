//! Gangway Protocol
//!
//! Shared types for communication between a Gangway client and the backend
//! that bridges it to a command-line agent process. All frames are
//! serialized as JSON over WebSocket, in two framing modes: raw byte-stream
//! (shell pass-through) and structured event-stream (turn-based
//! conversation with tool invocations and permission negotiation).

use uuid::Uuid;

pub mod envelope;
pub mod outbound;
pub mod types;

pub use envelope::{decode, decode_frame, Envelope};
pub use outbound::{ClientFrame, ContentBlock, ImageSource, UserMessage};
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
