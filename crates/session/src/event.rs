//! Events emitted to the session's owner

use gangway_protocol::PendingApproval;

/// Coarse notifications delivered over the caller's event sink.
///
/// Fine-grained state (message parts, provenance, streaming flag) is read
/// from the snapshot; events only tell the caller *that* something moved.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Connection opened; emitted exactly once per successful open
    Started { session_id: Option<String> },

    /// Transcript output chunk (live or replayed)
    Output { data: String },

    /// The aggregated snapshot advanced
    Updated,

    /// An approval needs the caller's decision
    ApprovalRequested(PendingApproval),

    /// The backend withdrew the pending approval
    ApprovalCancelled { request_id: String },

    /// Resume referenced a session the backend no longer knows;
    /// the caller should start fresh
    SessionNotFound,

    /// Connection lost and a reconnect is scheduled;
    /// surfaced only past the notify threshold
    Reconnecting { attempt: u32 },

    /// Reconnect attempts exhausted; the session is terminal
    RetriesExhausted { attempts: u32 },

    /// A structured turn reached its terminal result
    TurnEnded { is_error: bool },

    /// Raw-mode process exited
    Exited { code: Option<i32> },

    /// Backend-reported error (non-fatal)
    Error { message: String },

    /// The connection closed for good (caller-requested or after exit)
    Closed,
}
