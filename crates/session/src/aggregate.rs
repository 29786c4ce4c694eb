//! Incremental message aggregation
//!
//! All folding logic lives here as a pure, synchronous function:
//! `fold(state, envelope) -> state`. No IO, no async, no locking — fully
//! unit-testable. The caller invokes it once per envelope, in arrival
//! order; folding the same replayed envelopes again is idempotent.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use gangway_protocol::{Envelope, MessagePart, ToolStatus, TurnUsage};

// ---------------------------------------------------------------------------
// TurnState — accumulated timeline for the current connection
// ---------------------------------------------------------------------------

/// Aggregated view of a structured event stream.
#[derive(Debug, Clone, Default)]
pub struct TurnState {
    /// Ordered, deduplicated message parts
    pub parts: Vec<MessagePart>,
    /// True while a turn is in flight (set on assistant activity,
    /// cleared by a clean terminal `result`)
    pub streaming: bool,
    /// Usage reported by the most recent terminal `result`
    pub last_usage: Option<TurnUsage>,
    /// Backend session id learned from the `init` system envelope
    pub session_id: Option<String>,
    /// Model learned from the `init` system envelope
    pub model: Option<String>,

    /// Caller aborted the in-flight turn; folding is suspended until the
    /// turn's terminal `result` re-arms it
    aborted: bool,
    /// Out-of-band output buffered mid-turn, flushed by `result`
    stray_output: String,
    /// User message ids already folded this turn
    seen_user_ids: Vec<String>,
    /// Provisional tool identity: signature -> index into `parts`
    tool_signatures: HashMap<String, usize>,
    /// Index into `parts` where the current turn began; text from a new
    /// turn never merges into a part before this boundary
    turn_boundary: usize,
}

impl TurnState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop folding the in-flight turn. The connection stays open; the
    /// turn's terminal `result` (or the next submission) re-arms folding.
    pub fn abort_turn(&mut self) {
        self.aborted = true;
        self.streaming = false;
    }

    /// Called when the caller submits a new turn.
    pub fn begin_turn(&mut self) {
        self.aborted = false;
        self.seen_user_ids.clear();
        self.turn_boundary = self.parts.len();
    }
}

// ---------------------------------------------------------------------------
// fold() — the pure core
// ---------------------------------------------------------------------------

/// Fold one envelope into the accumulated state.
///
/// Ordering-sensitive: prefix-growth merges and first-seen-id dedup assume
/// envelopes arrive exactly once each, in order, from a single consumer.
/// A malformed envelope is skipped without touching accumulated parts.
pub fn fold(mut state: TurnState, envelope: &Envelope) -> TurnState {
    match envelope {
        Envelope::System {
            subtype,
            session_id,
            model,
            ..
        } => {
            if subtype.as_deref() == Some("init") {
                if session_id.is_some() {
                    state.session_id = session_id.clone();
                }
                if model.is_some() {
                    state.model = model.clone();
                }
            }
        }

        Envelope::Assistant { message } => {
            if state.aborted {
                return state;
            }
            state.streaming = true;
            fold_assistant_blocks(&mut state, message);
        }

        Envelope::User { message } => {
            if state.aborted {
                return state;
            }
            // Per-turn dedup by message identifier runs before any other rule
            if let Some(id) = message.get("id").and_then(|v| v.as_str()) {
                if state.seen_user_ids.iter().any(|s| s == id) {
                    debug!(
                        component = "aggregate",
                        event = "fold.user_dedup",
                        message_id = %id,
                        "Skipping duplicate user envelope"
                    );
                    return state;
                }
                state.seen_user_ids.push(id.to_string());
            }
            fold_tool_results(&mut state, message);
        }

        Envelope::Output { data } => {
            if !state.aborted {
                state.stray_output.push_str(data);
            }
        }

        // Buffered with the out-of-band output so an error mid-delta-stream
        // cannot become a merge target for later text
        Envelope::Error { message } => {
            if !message.is_empty() {
                state.stray_output.push_str(message);
                if !message.ends_with('\n') {
                    state.stray_output.push('\n');
                }
            }
        }

        Envelope::Result {
            usage,
            permission_denials,
            ..
        } => {
            // Flush buffered out-of-band output as a trailing text part
            if !state.stray_output.is_empty() {
                let text = std::mem::take(&mut state.stray_output);
                state.parts.push(MessagePart::text(text));
            }

            if let Some(u) = usage {
                state.last_usage = extract_usage(u);
            }

            // A denial-carrying result hands control to the approval
            // coordinator; the turn is not considered settled yet.
            if permission_denials.is_empty() {
                state.streaming = false;
            }

            state.aborted = false;
            state.seen_user_ids.clear();
            state.tool_signatures.clear();
            state.turn_boundary = state.parts.len();
        }

        // Owned by the reconciler / coordinator / transport layers
        Envelope::History { .. }
        | Envelope::SessionNotFound { .. }
        | Envelope::ControlRequest { .. }
        | Envelope::ControlCancelRequest { .. }
        | Envelope::Exit { .. } => {}
    }

    state
}

// ---------------------------------------------------------------------------
// Assistant content blocks
// ---------------------------------------------------------------------------

fn fold_assistant_blocks(state: &mut TurnState, message: &Value) {
    let blocks = match message.get("content").and_then(|v| v.as_array()) {
        Some(arr) => arr,
        None => return,
    };

    for block in blocks {
        match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "text" => {
                if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                    merge_text(state, text, false);
                }
            }
            "thinking" => {
                if let Some(text) = block.get("thinking").and_then(|v| v.as_str()) {
                    merge_text(state, text, true);
                }
            }
            "tool_use" => {
                let name = block
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                let id = block.get("id").and_then(|v| v.as_str());
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                open_tool(state, id, name, input);
            }
            _ => {}
        }
    }
}

/// Prefix-growth merge into the trailing text (or thinking) part.
///
/// Tolerates both "full-so-far" and "incremental-suffix" delta styles:
/// - incoming starts with accumulated -> replace
/// - accumulated starts with incoming -> no-op
/// - otherwise -> concatenate
fn merge_text(state: &mut TurnState, incoming: &str, thinking: bool) {
    let in_turn = state.parts.len() > state.turn_boundary;
    let existing = if in_turn {
        state.parts.last_mut().and_then(|part| match part {
            MessagePart::Text { text } if !thinking => Some(text),
            MessagePart::Thinking { text } if thinking => Some(text),
            _ => None,
        })
    } else {
        None
    };

    match existing {
        Some(text) => {
            if incoming.starts_with(text.as_str()) {
                *text = incoming.to_string();
            } else if text.as_str().starts_with(incoming) {
                // Replayed older prefix; keep what we have
            } else {
                text.push_str(incoming);
            }
        }
        None => {
            let part = if thinking {
                MessagePart::Thinking {
                    text: incoming.to_string(),
                }
            } else {
                MessagePart::text(incoming)
            };
            state.parts.push(part);
        }
    }
}

/// Open a tool_use part at most once per call id. Before an id is known,
/// a content signature suppresses duplicate cards; once an id arrives the
/// signature-matched part adopts it and id-based dedup takes over.
fn open_tool(state: &mut TurnState, id: Option<&str>, name: &str, input: Value) {
    let sig = signature(name, &input);

    if let Some(id) = id {
        if state
            .parts
            .iter()
            .any(|p| p.tool_id() == Some(id))
        {
            return;
        }

        // Adopt the id into a provisional signature-matched part
        if let Some(&idx) = sig.as_ref().and_then(|s| state.tool_signatures.get(s)) {
            if let Some(MessagePart::ToolUse { id: part_id, .. }) = state.parts.get_mut(idx) {
                if part_id.is_none() {
                    *part_id = Some(id.to_string());
                    return;
                }
            }
        }

        push_tool(state, Some(id.to_string()), name, input, sig);
    } else {
        // No id yet: the signature is the only duplicate guard we have
        if let Some(s) = &sig {
            if state.tool_signatures.contains_key(s) {
                return;
            }
        }
        push_tool(state, None, name, input, sig);
    }
}

fn push_tool(
    state: &mut TurnState,
    id: Option<String>,
    name: &str,
    input: Value,
    sig: Option<String>,
) {
    state.parts.push(MessagePart::ToolUse {
        id,
        name: name.to_string(),
        input,
        output: String::new(),
        status: ToolStatus::Running,
    });
    if let Some(s) = sig {
        state.tool_signatures.insert(s, state.parts.len() - 1);
    }
}

/// Tool name + the salient input field, used to identify a call before the
/// stream assigns it an id.
fn signature(name: &str, input: &Value) -> Option<String> {
    ["path", "file_path", "command"]
        .iter()
        .find_map(|key| input.get(key).and_then(|v| v.as_str()))
        .map(|field| format!("{}:{}", name, field))
}

// ---------------------------------------------------------------------------
// Tool results
// ---------------------------------------------------------------------------

fn fold_tool_results(state: &mut TurnState, message: &Value) {
    let blocks = match message.get("content").and_then(|v| v.as_array()) {
        Some(arr) => arr,
        None => return,
    };

    for block in blocks {
        if block.get("type").and_then(|v| v.as_str()) != Some("tool_result") {
            continue;
        }
        let tool_use_id = match block.get("tool_use_id").and_then(|v| v.as_str()) {
            Some(id) => id,
            None => continue,
        };

        let is_error = block
            .get("is_error")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let result_text = collect_result_text(block);

        let part = state
            .parts
            .iter_mut()
            .find(|p| p.tool_id() == Some(tool_use_id));
        if let Some(MessagePart::ToolUse {
            name,
            output,
            status,
            ..
        }) = part
        {
            if name.eq_ignore_ascii_case("read") {
                // File reads are summarized, not inlined
                *output = format!("{} lines", result_text.lines().count());
            } else {
                output.push_str(&result_text);
            }
            *status = if is_error {
                ToolStatus::Error
            } else {
                ToolStatus::Complete
            };
        } else {
            debug!(
                component = "aggregate",
                event = "fold.orphan_tool_result",
                tool_use_id = %tool_use_id,
                "Tool result without a matching tool_use part"
            );
        }
    }
}

/// Concatenate `content`/`stdout`/`stderr` into one output string.
fn collect_result_text(block: &Value) -> String {
    let mut out = String::new();

    match block.get("content") {
        Some(Value::String(s)) => out.push_str(s),
        Some(Value::Array(items)) => {
            for item in items {
                if let Some(s) = item.get("text").and_then(|v| v.as_str()) {
                    out.push_str(s);
                }
            }
        }
        _ => {}
    }
    for key in ["stdout", "stderr"] {
        if let Some(s) = block.get(key).and_then(|v| v.as_str()) {
            out.push_str(s);
        }
    }

    out
}

/// Pull token counts out of a result's usage block.
fn extract_usage(usage: &Value) -> Option<TurnUsage> {
    let field = |key: &str| usage.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
    let parsed = TurnUsage {
        input_tokens: field("input_tokens"),
        output_tokens: field("output_tokens"),
        cached_tokens: field("cache_read_input_tokens"),
    };
    if parsed.input_tokens > 0 || parsed.output_tokens > 0 {
        Some(parsed)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use gangway_protocol::decode;

    fn fold_all(envelopes: &[&str]) -> TurnState {
        envelopes
            .iter()
            .fold(TurnState::new(), |state, raw| fold(state, &decode(raw)))
    }

    fn assistant_text(text: &str) -> String {
        format!(
            r#"{{"type":"assistant","message":{{"content":[{{"type":"text","text":{}}}]}}}}"#,
            serde_json::to_string(text).unwrap()
        )
    }

    fn assistant_tool(id: Option<&str>, name: &str, input: &str) -> String {
        let id_field = match id {
            Some(id) => format!(r#""id":"{}","#, id),
            None => String::new(),
        };
        format!(
            r#"{{"type":"assistant","message":{{"content":[{{"type":"tool_use",{}"name":"{}","input":{}}}]}}}}"#,
            id_field, name, input
        )
    }

    #[test]
    fn prefix_growth_merges_into_one_part() {
        let state = fold_all(&[
            &assistant_text("Hel"),
            &assistant_text("Hello"),
            &assistant_text("Hello wor"),
            &assistant_text("Hello world"),
        ]);

        assert_eq!(state.parts.len(), 1);
        assert_eq!(
            state.parts[0],
            MessagePart::text("Hello world"),
        );
    }

    #[test]
    fn suffix_deltas_concatenate() {
        let state = fold_all(&[&assistant_text("Hello "), &assistant_text("world")]);
        assert_eq!(state.parts, vec![MessagePart::text("Hello world")]);
    }

    #[test]
    fn replayed_older_prefix_is_a_no_op() {
        let state = fold_all(&[&assistant_text("Hello world"), &assistant_text("Hello")]);
        assert_eq!(state.parts, vec![MessagePart::text("Hello world")]);
    }

    #[test]
    fn thinking_and_text_stay_separate_parts() {
        let raw = r#"{"type":"assistant","message":{"content":[
            {"type":"thinking","thinking":"consider the cases"},
            {"type":"text","text":"Done."}
        ]}}"#;
        let state = fold(TurnState::new(), &decode(raw));

        assert_eq!(state.parts.len(), 2);
        assert!(matches!(state.parts[0], MessagePart::Thinking { .. }));
        assert!(matches!(state.parts[1], MessagePart::Text { .. }));
    }

    #[test]
    fn duplicate_tool_id_opens_one_part() {
        let state = fold_all(&[
            &assistant_tool(Some("toolu_1"), "Bash", r#"{"command":"ls"}"#),
            &assistant_tool(Some("toolu_1"), "Bash", r#"{"command":"ls"}"#),
        ]);

        assert_eq!(state.parts.len(), 1);
        assert_eq!(state.parts[0].tool_id(), Some("toolu_1"));
    }

    #[test]
    fn signature_suppresses_duplicate_before_id_known() {
        let state = fold_all(&[
            &assistant_tool(None, "Bash", r#"{"command":"cargo check"}"#),
            &assistant_tool(None, "Bash", r#"{"command":"cargo check"}"#),
        ]);

        assert_eq!(state.parts.len(), 1);
    }

    #[test]
    fn id_supersedes_signature_dedup() {
        let state = fold_all(&[
            &assistant_tool(None, "Bash", r#"{"command":"cargo check"}"#),
            &assistant_tool(Some("toolu_7"), "Bash", r#"{"command":"cargo check"}"#),
        ]);

        // The provisional part adopted the id; no second card
        assert_eq!(state.parts.len(), 1);
        assert_eq!(state.parts[0].tool_id(), Some("toolu_7"));
    }

    #[test]
    fn same_signature_different_ids_are_distinct_calls() {
        let state = fold_all(&[
            &assistant_tool(Some("toolu_1"), "Bash", r#"{"command":"cargo check"}"#),
            &assistant_tool(Some("toolu_2"), "Bash", r#"{"command":"cargo check"}"#),
        ]);

        assert_eq!(state.parts.len(), 2);
    }

    #[test]
    fn tool_result_correlates_by_id() {
        let state = fold_all(&[
            &assistant_tool(Some("toolu_1"), "Bash", r#"{"command":"ls"}"#),
            r#"{"type":"user","message":{"id":"u1","content":[
                {"type":"tool_result","tool_use_id":"toolu_1","content":"src\n","stderr":"warn\n"}
            ]}}"#,
        ]);

        match &state.parts[0] {
            MessagePart::ToolUse { output, status, .. } => {
                assert_eq!(output, "src\nwarn\n");
                assert_eq!(*status, ToolStatus::Complete);
            }
            other => panic!("unexpected part: {:?}", other),
        }
    }

    #[test]
    fn error_result_marks_tool_errored() {
        let state = fold_all(&[
            &assistant_tool(Some("toolu_1"), "Bash", r#"{"command":"ls /none"}"#),
            r#"{"type":"user","message":{"content":[
                {"type":"tool_result","tool_use_id":"toolu_1","content":"no such file","is_error":true}
            ]}}"#,
        ]);

        match &state.parts[0] {
            MessagePart::ToolUse { status, .. } => assert_eq!(*status, ToolStatus::Error),
            other => panic!("unexpected part: {:?}", other),
        }
    }

    #[test]
    fn read_result_summarized_as_line_count() {
        let state = fold_all(&[
            &assistant_tool(Some("toolu_1"), "Read", r#"{"file_path":"/tmp/a.rs"}"#),
            r#"{"type":"user","message":{"content":[
                {"type":"tool_result","tool_use_id":"toolu_1","content":"fn main() {}\nfn helper() {}\n"}
            ]}}"#,
        ]);

        match &state.parts[0] {
            MessagePart::ToolUse { output, .. } => assert_eq!(output, "2 lines"),
            other => panic!("unexpected part: {:?}", other),
        }
    }

    #[test]
    fn user_envelopes_dedup_by_message_id() {
        let result = r#"{"type":"user","message":{"id":"u1","content":[
            {"type":"tool_result","tool_use_id":"toolu_1","content":"once"}
        ]}}"#;
        let state = fold_all(&[
            &assistant_tool(Some("toolu_1"), "Bash", r#"{"command":"ls"}"#),
            result,
            result,
        ]);

        match &state.parts[0] {
            MessagePart::ToolUse { output, .. } => assert_eq!(output, "once"),
            other => panic!("unexpected part: {:?}", other),
        }
    }

    #[test]
    fn result_clears_streaming_and_flushes_stray_output() {
        let state = fold_all(&[
            &assistant_text("Hi"),
            r#"{"type":"output","data":"npm WARN deprecated\n"}"#,
            r#"{"type":"result"}"#,
        ]);

        assert!(!state.streaming);
        assert_eq!(state.parts.len(), 2);
        assert_eq!(
            state.parts[1],
            MessagePart::text("npm WARN deprecated\n")
        );
    }

    #[test]
    fn backend_error_surfaces_at_turn_end_without_breaking_merge() {
        let state = fold_all(&[
            &assistant_text("Hel"),
            r#"{"type":"error","message":"backend hiccup"}"#,
            &assistant_text("Hello"),
            r#"{"type":"result"}"#,
        ]);

        // The error never became a merge target: the delta still grew the
        // original text part, and the error text trails the turn.
        assert_eq!(state.parts.len(), 2);
        assert_eq!(state.parts[0], MessagePart::text("Hello"));
        assert_eq!(state.parts[1], MessagePart::text("backend hiccup\n"));
    }

    #[test]
    fn denial_result_keeps_streaming_set() {
        let state = fold_all(&[
            &assistant_text("Let me edit that"),
            r#"{"type":"result","permission_denials":[{"tool_name":"Write","tool_input":{"file_path":"/etc/hosts"}}]}"#,
        ]);

        assert!(state.streaming);
    }

    #[test]
    fn result_records_usage() {
        let state = fold_all(&[
            &assistant_text("Hi"),
            r#"{"type":"result","usage":{"input_tokens":100,"output_tokens":7,"cache_read_input_tokens":80}}"#,
        ]);

        let usage = state.last_usage.expect("usage recorded");
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.output_tokens, 7);
        assert_eq!(usage.cached_tokens, 80);
    }

    #[test]
    fn init_records_session_identity() {
        let state = fold_all(&[
            r#"{"type":"system","subtype":"init","session_id":"sess-abc","model":"opus"}"#,
        ]);
        assert_eq!(state.session_id.as_deref(), Some("sess-abc"));
        assert_eq!(state.model.as_deref(), Some("opus"));
    }

    #[test]
    fn malformed_envelope_does_not_corrupt_parts() {
        let before = fold_all(&[&assistant_text("Hello")]);
        let after = fold(before.clone(), &decode("{\"type\":\"assistant\",\"message\":42}"));
        assert_eq!(before.parts, after.parts);

        let after = fold(after, &decode("complete garbage"));
        // Garbage degrades to out-of-band output, parts untouched
        assert_eq!(before.parts, after.parts);
    }

    #[test]
    fn abort_suspends_folding_until_result() {
        let mut state = fold_all(&[&assistant_text("partial")]);
        state.abort_turn();

        let state = fold(state, &decode(&assistant_text("partial answer ignored")));
        assert_eq!(state.parts, vec![MessagePart::text("partial")]);

        // The terminal result re-arms folding for the next turn
        let state = fold(state, &decode(r#"{"type":"result"}"#));
        let state = fold(state, &decode(&assistant_text("next turn")));
        assert_eq!(state.parts.len(), 2);
    }

    #[test]
    fn next_turn_text_opens_a_new_part() {
        let state = fold_all(&[
            &assistant_text("First answer"),
            r#"{"type":"result"}"#,
            &assistant_text("Second answer"),
        ]);

        assert_eq!(state.parts.len(), 2);
        assert_eq!(state.parts[1], MessagePart::text("Second answer"));
    }

    #[test]
    fn end_to_end_single_turn() {
        let state = fold_all(&[
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hi"}]}}"#,
            r#"{"type":"result"}"#,
        ]);

        assert_eq!(state.parts, vec![MessagePart::text("Hi")]);
        assert!(!state.streaming);
    }

    #[test]
    fn fold_is_stepwise_sequential() {
        let envelopes = [
            assistant_text("Hel"),
            assistant_tool(Some("toolu_1"), "Bash", r#"{"command":"ls"}"#),
            assistant_text("Hello"),
            r#"{"type":"user","message":{"content":[
                {"type":"tool_result","tool_use_id":"toolu_1","content":"ok"}
            ]}}"#
                .to_string(),
            r#"{"type":"result"}"#.to_string(),
        ];

        // One at a time
        let mut stepwise = TurnState::new();
        for raw in &envelopes {
            stepwise = fold(stepwise, &decode(raw));
        }

        // Single pass
        let refs: Vec<&str> = envelopes.iter().map(String::as_str).collect();
        let single = fold_all(&refs);

        assert_eq!(stepwise.parts, single.parts);
        assert_eq!(stepwise.streaming, single.streaming);
    }
}
