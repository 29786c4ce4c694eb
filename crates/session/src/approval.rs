//! Permission negotiation
//!
//! Three sources of approval requests converge on one `PendingApproval`
//! shape: a synchronous `control_request`, the legacy inline stream signal,
//! and post-hoc denials reported inside a terminal `result`. At most one
//! approval is surfaced at a time.

use serde_json::Value;
use tracing::debug;

use gangway_protocol::{
    new_id, ApprovalDecision, ApprovalSource, ClientFrame, Envelope, PendingApproval,
};

pub struct ApprovalCoordinator {
    pending: Option<PendingApproval>,
}

impl Default for ApprovalCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalCoordinator {
    pub fn new() -> Self {
        Self { pending: None }
    }

    pub fn pending(&self) -> Option<&PendingApproval> {
        self.pending.as_ref()
    }

    /// Inspect one envelope; returns a newly surfaced approval, if any.
    ///
    /// Also handles clearing: a matching `control_cancel_request` and any
    /// terminal `result` (turn end) drop the pending approval.
    pub fn observe(&mut self, envelope: &Envelope) -> Option<PendingApproval> {
        match envelope {
            Envelope::ControlRequest {
                request_id,
                request,
            } => {
                if request.get("subtype").and_then(|v| v.as_str()) != Some("can_use_tool") {
                    debug!(
                        component = "approval",
                        event = "approval.unhandled_subtype",
                        request_id = %request_id,
                        "Ignoring non-permission control request"
                    );
                    return None;
                }
                self.surface(approval_from_request(
                    request_id.clone(),
                    request,
                    ApprovalSource::ControlRequest,
                ))
            }

            // Legacy path: the same ask embedded in the stream
            Envelope::System {
                subtype,
                request_id,
                request,
                ..
            } if subtype.as_deref() == Some("permission_request") => {
                let request = request.as_ref()?;
                let id = request_id.clone().unwrap_or_else(new_id);
                self.surface(approval_from_request(id, request, ApprovalSource::Stream))
            }

            Envelope::ControlCancelRequest { request_id } => {
                if self.pending.as_ref().is_some_and(|p| &p.id == request_id) {
                    debug!(
                        component = "approval",
                        event = "approval.cancelled",
                        request_id = %request_id,
                        "Backend withdrew pending approval"
                    );
                    self.pending = None;
                }
                None
            }

            Envelope::Result {
                permission_denials, ..
            } => {
                // Turn end clears whatever was pending
                self.pending = None;

                let mut denials = permission_denials.iter();
                let surfaced = denials
                    .next()
                    .and_then(|first| self.surface(approval_from_denial(first)));
                for skipped in denials {
                    debug!(
                        component = "approval",
                        event = "approval.denial_skipped",
                        tool_name = %skipped.get("tool_name").and_then(|v| v.as_str()).unwrap_or("?"),
                        "Only the first denial in a result is surfaced"
                    );
                }
                surfaced
            }

            _ => None,
        }
    }

    /// Resolve the pending approval. Returns the `control_response` frame to
    /// send, or `None` when nothing goes on the wire (dismiss, denial
    /// source, or an id that no longer matches the pending approval).
    pub fn decide(
        &mut self,
        approval_id: &str,
        decision: ApprovalDecision,
        updated_input: Option<Value>,
        suggestions: Option<Value>,
        message: Option<String>,
    ) -> Option<ClientFrame> {
        let pending = match self.pending.take() {
            Some(p) if p.id == approval_id => p,
            other => {
                debug!(
                    component = "approval",
                    event = "approval.stale_decision",
                    approval_id = %approval_id,
                    "Decision does not match the pending approval"
                );
                self.pending = other;
                return None;
            }
        };

        // Post-hoc denials are informational; nothing to answer
        if pending.source == ApprovalSource::Denial {
            return None;
        }
        if decision == ApprovalDecision::Dismiss {
            return None;
        }

        Some(ClientFrame::ControlResponse {
            request_id: pending.id,
            decision,
            tool_input: pending.tool_input,
            updated_input,
            permission_suggestions: suggestions,
            message,
        })
    }

    fn surface(&mut self, approval: PendingApproval) -> Option<PendingApproval> {
        if self.pending.is_some() {
            debug!(
                component = "approval",
                event = "approval.already_pending",
                request_id = %approval.id,
                "Dropping approval while another is pending"
            );
            return None;
        }
        self.pending = Some(approval.clone());
        Some(approval)
    }
}

fn approval_from_request(id: String, request: &Value, source: ApprovalSource) -> PendingApproval {
    let tool_input = request.get("input").cloned().unwrap_or(Value::Null);
    PendingApproval {
        id,
        tool_name: request
            .get("tool_name")
            .and_then(|v| v.as_str())
            .map(String::from),
        file_path: salient_path(&tool_input),
        blocked_path: None,
        permission_suggestions: request.get("permission_suggestions").cloned(),
        tool_input,
        source,
    }
}

fn approval_from_denial(denial: &Value) -> PendingApproval {
    let tool_input = denial.get("tool_input").cloned().unwrap_or(Value::Null);
    PendingApproval {
        id: denial
            .get("tool_use_id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(new_id),
        tool_name: denial
            .get("tool_name")
            .and_then(|v| v.as_str())
            .map(String::from),
        file_path: None,
        blocked_path: denial
            .get("blocked_path")
            .and_then(|v| v.as_str())
            .map(String::from)
            .or_else(|| salient_path(&tool_input)),
        permission_suggestions: None,
        tool_input,
        source: ApprovalSource::Denial,
    }
}

fn salient_path(input: &Value) -> Option<String> {
    ["file_path", "path"]
        .iter()
        .find_map(|key| input.get(key).and_then(|v| v.as_str()))
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gangway_protocol::decode;

    fn control_request(id: &str) -> Envelope {
        decode(&format!(
            r#"{{"type":"control_request","request_id":"{}","request":{{
                "subtype":"can_use_tool",
                "tool_name":"Write",
                "input":{{"file_path":"/tmp/notes.md","content":"x"}},
                "permission_suggestions":[{{"mode":"acceptEdits"}}]
            }}}}"#,
            id
        ))
    }

    #[test]
    fn control_request_surfaces_pending() {
        let mut coordinator = ApprovalCoordinator::new();
        let approval = coordinator.observe(&control_request("req-1")).unwrap();

        assert_eq!(approval.id, "req-1");
        assert_eq!(approval.tool_name.as_deref(), Some("Write"));
        assert_eq!(approval.file_path.as_deref(), Some("/tmp/notes.md"));
        assert_eq!(approval.source, ApprovalSource::ControlRequest);
        assert!(approval.permission_suggestions.is_some());
        assert!(coordinator.pending().is_some());
    }

    #[test]
    fn cancel_clears_without_response() {
        let mut coordinator = ApprovalCoordinator::new();
        coordinator.observe(&control_request("req-1"));

        let cancelled = coordinator.observe(&decode(
            r#"{"type":"control_cancel_request","request_id":"req-1"}"#,
        ));
        assert!(cancelled.is_none());
        assert!(coordinator.pending().is_none());

        // A late decision for the cancelled id sends nothing
        let frame = coordinator.decide("req-1", ApprovalDecision::Allow, None, None, None);
        assert!(frame.is_none());
    }

    #[test]
    fn cancel_for_other_id_keeps_pending() {
        let mut coordinator = ApprovalCoordinator::new();
        coordinator.observe(&control_request("req-1"));
        coordinator.observe(&decode(
            r#"{"type":"control_cancel_request","request_id":"req-other"}"#,
        ));
        assert!(coordinator.pending().is_some());
    }

    #[test]
    fn allow_echoes_original_input() {
        let mut coordinator = ApprovalCoordinator::new();
        coordinator.observe(&control_request("req-1"));

        let frame = coordinator
            .decide(
                "req-1",
                ApprovalDecision::Allow,
                Some(serde_json::json!({"file_path":"/tmp/notes.md","content":"y"})),
                None,
                None,
            )
            .unwrap();

        match frame {
            ClientFrame::ControlResponse {
                request_id,
                decision,
                tool_input,
                updated_input,
                ..
            } => {
                assert_eq!(request_id, "req-1");
                assert_eq!(decision, ApprovalDecision::Allow);
                assert_eq!(tool_input["file_path"], "/tmp/notes.md");
                assert_eq!(updated_input.unwrap()["content"], "y");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(coordinator.pending().is_none());
    }

    #[test]
    fn deny_carries_message() {
        let mut coordinator = ApprovalCoordinator::new();
        coordinator.observe(&control_request("req-1"));

        let frame = coordinator
            .decide(
                "req-1",
                ApprovalDecision::Deny,
                None,
                None,
                Some("use a scratch file".to_string()),
            )
            .unwrap();

        match frame {
            ClientFrame::ControlResponse {
                decision, message, ..
            } => {
                assert_eq!(decision, ApprovalDecision::Deny);
                assert_eq!(message.as_deref(), Some("use a scratch file"));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn stream_signal_is_the_same_negotiation() {
        let mut coordinator = ApprovalCoordinator::new();
        let approval = coordinator
            .observe(&decode(
                r#"{"type":"system","subtype":"permission_request","request_id":"req-5",
                    "request":{"tool_name":"Bash","input":{"command":"rm -r target"}}}"#,
            ))
            .unwrap();

        assert_eq!(approval.source, ApprovalSource::Stream);
        let frame = coordinator.decide("req-5", ApprovalDecision::Allow, None, None, None);
        assert!(matches!(
            frame,
            Some(ClientFrame::ControlResponse { .. })
        ));
    }

    #[test]
    fn denial_in_result_is_dismiss_only() {
        let mut coordinator = ApprovalCoordinator::new();
        let approval = coordinator
            .observe(&decode(
                r#"{"type":"result","permission_denials":[
                    {"tool_name":"Write","tool_use_id":"toolu_3","tool_input":{"file_path":"/etc/hosts"}}
                ]}"#,
            ))
            .unwrap();

        assert_eq!(approval.source, ApprovalSource::Denial);
        assert_eq!(approval.blocked_path.as_deref(), Some("/etc/hosts"));

        // No decision produces a frame for a denial record
        let frame = coordinator.decide("toolu_3", ApprovalDecision::Dismiss, None, None, None);
        assert!(frame.is_none());
        assert!(coordinator.pending().is_none());
    }

    #[test]
    fn only_first_denial_is_surfaced() {
        let mut coordinator = ApprovalCoordinator::new();
        let approval = coordinator
            .observe(&decode(
                r#"{"type":"result","permission_denials":[
                    {"tool_name":"Write","tool_use_id":"toolu_1","tool_input":{}},
                    {"tool_name":"Bash","tool_use_id":"toolu_2","tool_input":{}}
                ]}"#,
            ))
            .unwrap();

        assert_eq!(approval.id, "toolu_1");
        assert_eq!(coordinator.pending().unwrap().id, "toolu_1");
    }

    #[test]
    fn second_request_waits_behind_pending() {
        let mut coordinator = ApprovalCoordinator::new();
        assert!(coordinator.observe(&control_request("req-1")).is_some());
        assert!(coordinator.observe(&control_request("req-2")).is_none());
        assert_eq!(coordinator.pending().unwrap().id, "req-1");
    }

    #[test]
    fn turn_end_clears_pending() {
        let mut coordinator = ApprovalCoordinator::new();
        coordinator.observe(&control_request("req-1"));
        coordinator.observe(&decode(r#"{"type":"result"}"#));
        assert!(coordinator.pending().is_none());
    }

    #[test]
    fn stale_decision_keeps_pending() {
        let mut coordinator = ApprovalCoordinator::new();
        coordinator.observe(&control_request("req-1"));
        let frame = coordinator.decide("req-99", ApprovalDecision::Allow, None, None, None);
        assert!(frame.is_none());
        assert_eq!(coordinator.pending().unwrap().id, "req-1");
    }
}
