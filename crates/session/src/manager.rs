//! Transport session management
//!
//! One `SessionManager` per session view. The manager spawns a session
//! actor that owns the connection, the history reconciler, the aggregator,
//! and the approval coordinator. All inbound envelopes are processed
//! strictly in arrival order by that single task; ordering-sensitive merges
//! depend on it. External callers communicate via fire-and-forget commands
//! over an mpsc channel; reads are lock-free `ArcSwap` snapshot loads,
//! refreshed once per processed envelope.

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use gangway_protocol::{
    ApprovalDecision, ApprovalSource, ClientFrame, Envelope, MessagePart, PendingApproval,
    Provenance, SessionMode, ToolStatus, TurnUsage, UserMessage,
};

use crate::aggregate::{fold, TurnState};
use crate::approval::ApprovalCoordinator;
use crate::cache::HistoryCache;
use crate::config::SessionConfig;
use crate::connection::{Connection, ConnectionState, Link};
use crate::event::SessionEvent;
use crate::reconcile::{ChunkWrite, HistoryReconciler};

// ---------------------------------------------------------------------------
// Commands and snapshot
// ---------------------------------------------------------------------------

/// Commands accepted by the session actor
#[derive(Debug)]
pub enum SessionCommand {
    /// Open (or re-open) the connection; an existing one is closed first
    Open,
    /// Install or replace the caller's event sink
    SetEventSink { sink: mpsc::Sender<SessionEvent> },
    /// Send an arbitrary pre-built frame
    Send { frame: ClientFrame },
    /// Raw-mode keystrokes
    Input { data: String },
    /// Raw-mode geometry; dropped unless the connection is open and the
    /// surface has nonzero extent
    Resize { cols: u16, rows: u16 },
    /// Submit a structured turn
    SubmitTurn {
        message: UserMessage,
        context_files: Vec<String>,
    },
    /// Resolve the pending approval
    Decide {
        approval_id: String,
        decision: ApprovalDecision,
        updated_input: Option<Value>,
        suggestions: Option<Value>,
        message: Option<String>,
    },
    /// Stop folding the in-flight turn; the connection stays open
    AbortTurn,
    /// Tear the session down; no reconnect
    Close,
}

/// Immutable state published to consumers after every processed envelope.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub connection: ConnectionState,
    pub provenance: Option<Provenance>,
    /// Raw transcript (raw mode) or fallback/rendered transcript (structured)
    pub transcript: String,
    /// Ordered, deduplicated message parts (structured mode)
    pub parts: Vec<MessagePart>,
    pub streaming: bool,
    pub pending_approval: Option<PendingApproval>,
    pub usage: Option<TurnUsage>,
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub retries: u32,
    /// Reconnect attempts exhausted; no further attempt will be scheduled
    pub exhausted: bool,
}

impl SessionSnapshot {
    fn initial(config: &SessionConfig) -> Self {
        Self {
            connection: ConnectionState::Idle,
            provenance: None,
            transcript: String::new(),
            parts: Vec::new(),
            streaming: false,
            pending_approval: None,
            usage: None,
            session_id: config.session_id.clone(),
            model: None,
            retries: 0,
            exhausted: false,
        }
    }
}

// ---------------------------------------------------------------------------
// SessionManager — the caller-facing handle
// ---------------------------------------------------------------------------

/// Handle to a running session actor (cheap to Clone).
#[derive(Clone)]
pub struct SessionManager {
    command_tx: mpsc::Sender<SessionCommand>,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
}

impl SessionManager {
    /// Spawn the session actor. The connection is not opened until `open`.
    pub fn spawn(config: SessionConfig, cache: HistoryCache) -> Self {
        let (command_tx, command_rx) = mpsc::channel(64);
        let snapshot = Arc::new(ArcSwap::from_pointee(SessionSnapshot::initial(&config)));

        let (actor, link_rx) = SessionActor::new(config, cache, snapshot.clone());
        tokio::spawn(actor.run(command_rx, link_rx));

        Self {
            command_tx,
            snapshot,
        }
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot.load_full()
    }

    pub async fn open(&self) {
        self.send_command(SessionCommand::Open).await;
    }

    /// Install or replace the event sink. Explicit state, not closure
    /// capture: the sink survives reconnects and can be swapped at any time.
    pub async fn set_event_sink(&self, sink: mpsc::Sender<SessionEvent>) {
        self.send_command(SessionCommand::SetEventSink { sink })
            .await;
    }

    pub async fn send(&self, frame: ClientFrame) {
        self.send_command(SessionCommand::Send { frame }).await;
    }

    pub async fn send_input(&self, data: impl Into<String>) {
        self.send_command(SessionCommand::Input { data: data.into() })
            .await;
    }

    pub async fn resize(&self, cols: u16, rows: u16) {
        self.send_command(SessionCommand::Resize { cols, rows }).await;
    }

    pub async fn submit_turn(&self, message: UserMessage, context_files: Vec<String>) {
        self.send_command(SessionCommand::SubmitTurn {
            message,
            context_files,
        })
        .await;
    }

    pub async fn submit_text(&self, text: impl Into<String>) {
        self.submit_turn(UserMessage::text(text.into()), Vec::new())
            .await;
    }

    pub async fn decide(
        &self,
        approval_id: impl Into<String>,
        decision: ApprovalDecision,
        updated_input: Option<Value>,
        suggestions: Option<Value>,
        message: Option<String>,
    ) {
        self.send_command(SessionCommand::Decide {
            approval_id: approval_id.into(),
            decision,
            updated_input,
            suggestions,
            message,
        })
        .await;
    }

    pub async fn abort_turn(&self) {
        self.send_command(SessionCommand::AbortTurn).await;
    }

    pub async fn close(&self) {
        self.send_command(SessionCommand::Close).await;
    }

    async fn send_command(&self, cmd: SessionCommand) {
        if self.command_tx.send(cmd).await.is_err() {
            warn!(
                component = "manager",
                event = "manager.command_dropped",
                "Session actor gone, command dropped"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// SessionActor — owns all connection-scoped state
// ---------------------------------------------------------------------------

struct SessionActor {
    config: SessionConfig,
    cache: HistoryCache,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
    link_tx: mpsc::Sender<Link>,

    state: ConnectionState,
    connection: Option<Connection>,
    /// Bumped on every connect attempt; stale plumbing events are discarded
    epoch: u64,
    retries: u32,
    exhausted: bool,
    /// Caller requested close; no reconnect
    closed: bool,
    /// Raw-mode process exited; no reconnect
    exited: bool,

    /// Frames issued before the connection opened
    pending_sends: Vec<ClientFrame>,
    sink: Option<mpsc::Sender<SessionEvent>>,

    reconciler: HistoryReconciler,
    turn: TurnState,
    approvals: ApprovalCoordinator,
    transcript: String,
    /// How many parts have already been rendered into the transcript
    rendered_parts: usize,
}

impl SessionActor {
    fn new(
        config: SessionConfig,
        cache: HistoryCache,
        snapshot: Arc<ArcSwap<SessionSnapshot>>,
    ) -> (Self, mpsc::Receiver<Link>) {
        let (link_tx, link_rx) = mpsc::channel(256);
        let actor = Self {
            config,
            cache,
            snapshot,
            link_tx,
            state: ConnectionState::Idle,
            connection: None,
            epoch: 0,
            retries: 0,
            exhausted: false,
            closed: false,
            exited: false,
            pending_sends: Vec::new(),
            sink: None,
            reconciler: HistoryReconciler::new(None),
            turn: TurnState::new(),
            approvals: ApprovalCoordinator::new(),
            transcript: String::new(),
            rendered_parts: 0,
        };
        (actor, link_rx)
    }

    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SessionCommand>,
        mut link_rx: mpsc::Receiver<Link>,
    ) {
        loop {
            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => break,
                },

                Some(link) = link_rx.recv() => {
                    self.handle_link(link).await;
                }
            }
        }

        if let Some(connection) = self.connection.take() {
            connection.shutdown();
        }
    }

    /// Returns true when the actor should exit.
    async fn handle_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::Open => {
                // A caller-driven open resets any terminal retry state
                self.closed = false;
                self.exited = false;
                self.exhausted = false;
                self.retries = 0;
                self.begin_open().await;
            }

            SessionCommand::SetEventSink { sink } => {
                self.sink = Some(sink);
            }

            SessionCommand::Send { frame } => {
                self.dispatch_send(frame).await;
            }

            SessionCommand::Input { data } => {
                self.dispatch_send(ClientFrame::Input { data }).await;
            }

            SessionCommand::Resize { cols, rows } => {
                // A 0x0 resize would corrupt the remote pseudo-terminal
                if self.state == ConnectionState::Open && cols > 0 && rows > 0 {
                    self.dispatch_send(ClientFrame::Resize { cols, rows }).await;
                } else {
                    debug!(
                        component = "manager",
                        event = "manager.resize_gated",
                        cols = cols,
                        rows = rows,
                        "Resize dropped (connection not open or zero extent)"
                    );
                }
            }

            SessionCommand::SubmitTurn {
                message,
                context_files,
            } => {
                self.turn.begin_turn();
                self.dispatch_send(ClientFrame::User {
                    message,
                    mode: self.config.mode,
                    context_files,
                })
                .await;
                self.publish();
            }

            SessionCommand::Decide {
                approval_id,
                decision,
                updated_input,
                suggestions,
                message,
            } => {
                let resolving_denial = self
                    .approvals
                    .pending()
                    .is_some_and(|p| p.id == approval_id && p.source == ApprovalSource::Denial);
                let frame = self.approvals.decide(
                    &approval_id,
                    decision,
                    updated_input,
                    suggestions,
                    message,
                );
                if let Some(frame) = frame {
                    self.dispatch_send(frame).await;
                }
                // A denial's result left the streaming flag set so control
                // could pass to the coordinator; acknowledging it settles
                // the turn.
                if resolving_denial && self.approvals.pending().is_none() {
                    self.turn.streaming = false;
                }
                self.publish();
                self.emit(SessionEvent::Updated).await;
            }

            SessionCommand::AbortTurn => {
                self.turn.abort_turn();
                self.publish();
                self.emit(SessionEvent::Updated).await;
            }

            SessionCommand::Close => {
                self.closed = true;
                if let Some(connection) = self.connection.take() {
                    connection.shutdown();
                }
                self.state = ConnectionState::Closed;
                self.publish();
                self.emit(SessionEvent::Closed).await;
                return true;
            }
        }
        false
    }

    async fn handle_link(&mut self, link: Link) {
        match link {
            Link::Opened {
                epoch,
                mut connection,
                cached,
            } => {
                if epoch != self.epoch || self.closed {
                    connection.shutdown();
                    return;
                }
                info!(
                    component = "manager",
                    event = "manager.opened",
                    epoch = epoch,
                    session_id = ?self.config.session_id,
                    "Connection open"
                );
                self.state = ConnectionState::Open;
                self.retries = 0;
                connection.start_reader(self.link_tx.clone(), epoch);
                self.connection = Some(connection);

                // All connection-scoped state starts fresh
                self.reconciler = HistoryReconciler::new(cached);
                self.turn = TurnState::new();
                self.approvals = ApprovalCoordinator::new();
                self.transcript.clear();
                self.rendered_parts = 0;

                // Future reconnects resume this session
                self.config.resume = true;
                self.config.force_new = false;

                self.arm_grace_timer();
                self.drain_pending().await;

                self.publish();
                self.emit(SessionEvent::Started {
                    session_id: self.config.session_id.clone(),
                })
                .await;
            }

            Link::OpenFailed { epoch, error } => {
                if epoch != self.epoch || self.closed {
                    return;
                }
                warn!(
                    component = "manager",
                    event = "manager.open_failed",
                    epoch = epoch,
                    error = %error,
                    "Connection attempt failed"
                );
                self.state = ConnectionState::Closed;
                self.connection = None;
                self.handle_connection_loss().await;
            }

            Link::Inbound { epoch, envelope } => {
                if epoch != self.epoch {
                    return;
                }
                self.process_envelope(envelope).await;
            }

            Link::Dropped { epoch } => {
                if epoch != self.epoch || self.state != ConnectionState::Open {
                    return;
                }
                if let Some(connection) = self.connection.take() {
                    connection.shutdown();
                }
                self.state = ConnectionState::Closed;
                if self.closed || self.exited {
                    self.publish();
                    return;
                }
                warn!(
                    component = "manager",
                    event = "manager.dropped",
                    epoch = epoch,
                    "Connection dropped"
                );
                self.handle_connection_loss().await;
            }

            Link::GraceElapsed { epoch } => {
                if epoch != self.epoch {
                    return;
                }
                if let Some(text) = self.reconciler.grace_elapsed() {
                    debug!(
                        component = "manager",
                        event = "manager.local_history_painted",
                        bytes = text.len(),
                        "Painting cached transcript while history is pending"
                    );
                    self.transcript = text.clone();
                    self.publish();
                    if self.config.mode == SessionMode::Raw {
                        self.emit(SessionEvent::Output { data: text }).await;
                    }
                    self.emit(SessionEvent::Updated).await;
                }
            }

            Link::Retry { epoch } => {
                if epoch != self.epoch
                    || self.closed
                    || self.exited
                    || self.exhausted
                    || self.state == ConnectionState::Open
                {
                    return;
                }
                self.begin_open().await;
            }
        }
    }

    // -- Connection lifecycle ----------------------------------------------

    async fn begin_open(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.shutdown();
        }
        self.epoch += 1;
        self.state = ConnectionState::Connecting;
        self.publish();

        let url = self.config.connect_url();
        let session_id = self.config.session_id.clone();
        let cache = self.cache.clone();
        let link_tx = self.link_tx.clone();
        let epoch = self.epoch;

        tokio::spawn(async move {
            let cached = match &session_id {
                Some(id) => cache.load(id).await,
                None => None,
            };
            match Connection::establish(&url, epoch).await {
                Ok(connection) => {
                    let _ = link_tx
                        .send(Link::Opened {
                            epoch,
                            connection,
                            cached,
                        })
                        .await;
                }
                Err(error) => {
                    let _ = link_tx.send(Link::OpenFailed { epoch, error }).await;
                }
            }
        });
    }

    async fn handle_connection_loss(&mut self) {
        self.retries += 1;

        if self.config.reconnect_disabled {
            self.publish();
            self.emit(SessionEvent::Closed).await;
            return;
        }

        if self.retries >= self.config.max_retries {
            self.exhausted = true;
            info!(
                component = "manager",
                event = "manager.retries_exhausted",
                attempts = self.retries,
                "Giving up on reconnects"
            );
            self.publish();
            self.emit(SessionEvent::RetriesExhausted {
                attempts: self.retries,
            })
            .await;
            return;
        }

        self.config.resume = true;
        let delay = self.config.reconnect_delay;
        let link_tx = self.link_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = link_tx.send(Link::Retry { epoch }).await;
        });

        self.publish();

        // Transient blips are silent; persistent ones are surfaced
        if self.retries >= self.config.retry_notify_threshold {
            self.emit(SessionEvent::Reconnecting {
                attempt: self.retries,
            })
            .await;
        }
    }

    fn arm_grace_timer(&self) {
        let grace = self.config.history_grace;
        let link_tx = self.link_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = link_tx.send(Link::GraceElapsed { epoch }).await;
        });
    }

    async fn dispatch_send(&mut self, frame: ClientFrame) {
        match &self.connection {
            Some(connection) => {
                if connection.send(frame).await.is_err() {
                    warn!(
                        component = "manager",
                        event = "manager.send_failed",
                        "Outbound channel closed, frame lost"
                    );
                }
            }
            None => {
                // Queued, never silently dropped; drained on open
                if !self.closed && !self.exhausted {
                    self.pending_sends.push(frame);
                } else {
                    warn!(
                        component = "manager",
                        event = "manager.send_after_terminal",
                        "Frame dropped, session is terminal"
                    );
                }
            }
        }
    }

    async fn drain_pending(&mut self) {
        if self.pending_sends.is_empty() {
            return;
        }
        let queued = std::mem::take(&mut self.pending_sends);
        debug!(
            component = "manager",
            event = "manager.drain_pending",
            count = queued.len(),
            "Flushing frames queued before open"
        );
        for frame in queued {
            self.dispatch_send(frame).await;
        }
    }

    // -- Envelope processing ------------------------------------------------

    async fn process_envelope(&mut self, envelope: Envelope) {
        match &envelope {
            Envelope::History { data, messages } => {
                self.apply_server_history(data.clone(), messages);
                self.publish();
                if self.config.mode == SessionMode::Raw {
                    self.emit(SessionEvent::Output {
                        data: self.transcript.clone(),
                    })
                    .await;
                }
                self.emit(SessionEvent::Updated).await;
                return;
            }

            Envelope::SessionNotFound { .. } => {
                info!(
                    component = "manager",
                    event = "manager.session_not_found",
                    session_id = ?self.config.session_id,
                    "Backend lost the session, starting fresh"
                );
                self.reconciler.session_not_found();
                if let Some(sid) = self.cache_session_id() {
                    self.cache.remove(&sid);
                }
                // Assumed continuity is gone; the next open starts fresh
                self.config.session_id = None;
                self.config.resume = false;
                self.publish();
                self.emit(SessionEvent::SessionNotFound).await;
                return;
            }

            Envelope::Exit { code } => {
                self.exited = true;
                if let Some(connection) = self.connection.take() {
                    connection.shutdown();
                }
                self.state = ConnectionState::Closed;
                self.publish();
                self.emit(SessionEvent::Exited { code: *code }).await;
                self.emit(SessionEvent::Closed).await;
                return;
            }

            _ => {}
        }

        match self.config.mode {
            SessionMode::Raw => self.process_raw(envelope).await,
            SessionMode::Structured => self.process_structured(envelope).await,
        }
    }

    async fn process_raw(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Output { data } => {
                self.transcript.push_str(&data);
                self.persist_chunk(&data);
                self.publish();
                self.emit(SessionEvent::Output { data }).await;
            }
            Envelope::Error { message } => {
                self.publish();
                self.emit(SessionEvent::Error { message }).await;
            }
            other => {
                debug!(
                    component = "manager",
                    event = "manager.raw_ignored",
                    envelope = ?other,
                    "Ignoring non-raw envelope in raw mode"
                );
            }
        }
    }

    async fn process_structured(&mut self, envelope: Envelope) {
        let pending_before = self.approvals.pending().map(|p| p.id.clone());
        let surfaced = self.approvals.observe(&envelope);
        self.turn = fold(std::mem::take(&mut self.turn), &envelope);

        // The init envelope names the backend session; adopt it so
        // reconnects resume and the cache has a key.
        if self.config.session_id.is_none() {
            if let Some(sid) = &self.turn.session_id {
                self.config.session_id = Some(sid.clone());
            }
        }

        let mut cancelled: Option<String> = None;
        let mut turn_ended: Option<bool> = None;
        let mut backend_error: Option<String> = None;
        match &envelope {
            Envelope::ControlCancelRequest { request_id } => {
                if pending_before.as_deref() == Some(request_id.as_str()) {
                    cancelled = Some(request_id.clone());
                }
            }
            Envelope::Result { is_error, .. } => {
                if !self.turn.streaming {
                    self.render_completed_parts();
                    turn_ended = Some(*is_error);
                }
            }
            Envelope::Error { message } => {
                backend_error = Some(message.clone());
            }
            _ => {}
        }

        // The snapshot is fresh before any notification goes out
        self.publish();

        if let Some(request_id) = cancelled {
            self.emit(SessionEvent::ApprovalCancelled { request_id }).await;
        }
        if let Some(is_error) = turn_ended {
            self.emit(SessionEvent::TurnEnded { is_error }).await;
        }
        if let Some(message) = backend_error {
            self.emit(SessionEvent::Error { message }).await;
        }
        if let Some(approval) = surfaced {
            self.emit(SessionEvent::ApprovalRequested(approval)).await;
        }
        self.emit(SessionEvent::Updated).await;
    }

    fn apply_server_history(&mut self, data: Option<String>, messages: &[Value]) {
        self.reconciler.server_history();
        self.turn = TurnState::new();
        self.approvals = ApprovalCoordinator::new();

        if self.config.mode == SessionMode::Structured {
            for value in messages {
                if let Ok(env) = serde_json::from_value::<Envelope>(value.clone()) {
                    self.turn = fold(std::mem::take(&mut self.turn), &env);
                }
            }
        }

        self.rendered_parts = self.turn.parts.len();
        self.transcript = data.unwrap_or_else(|| render_parts(&self.turn.parts));
        if let Some(sid) = self.cache_session_id() {
            self.cache.replace(&sid, &self.transcript);
        }
    }

    /// Render the turn's finished parts into the plain-text transcript and
    /// persist them, so the cache can paint a plausible fallback next time.
    fn render_completed_parts(&mut self) {
        let rendered = render_parts(&self.turn.parts[self.rendered_parts..]);
        self.rendered_parts = self.turn.parts.len();
        if rendered.is_empty() {
            return;
        }
        self.transcript.push_str(&rendered);
        if let Some(sid) = self.cache_session_id() {
            match self.reconciler.confirm_chunk() {
                ChunkWrite::Replace => self.cache.replace(&sid, &self.transcript),
                ChunkWrite::Append => self.cache.append(&sid, &rendered),
            }
        }
    }

    fn persist_chunk(&mut self, chunk: &str) {
        let Some(sid) = self.cache_session_id() else {
            return;
        };
        match self.reconciler.confirm_chunk() {
            ChunkWrite::Replace => self.cache.replace(&sid, &self.transcript),
            ChunkWrite::Append => self.cache.append(&sid, chunk),
        }
    }

    fn cache_session_id(&self) -> Option<String> {
        self.config
            .session_id
            .clone()
            .or_else(|| self.turn.session_id.clone())
    }

    // -- Snapshot and events -----------------------------------------------

    fn publish(&self) {
        self.snapshot.store(Arc::new(SessionSnapshot {
            connection: self.state,
            provenance: self.reconciler.provenance(),
            transcript: self.transcript.clone(),
            parts: self.turn.parts.clone(),
            streaming: self.turn.streaming,
            pending_approval: self.approvals.pending().cloned(),
            usage: self.turn.last_usage.clone(),
            session_id: self.cache_session_id(),
            model: self.turn.model.clone(),
            retries: self.retries,
            exhausted: self.exhausted,
        }));
    }

    async fn emit(&mut self, event: SessionEvent) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        if sink.send(event).await.is_err() {
            debug!(
                component = "manager",
                event = "manager.sink_closed",
                "Event sink closed, detaching"
            );
            self.sink = None;
        }
    }
}

/// Plain-text rendering of message parts, used for the cached fallback
/// transcript.
fn render_parts(parts: &[MessagePart]) -> String {
    let mut out = String::new();
    for part in parts {
        match part {
            MessagePart::Text { text } => {
                out.push_str(text);
                if !text.ends_with('\n') {
                    out.push('\n');
                }
            }
            MessagePart::Thinking { .. } => {}
            MessagePart::ToolUse { name, status, .. } => {
                let status = match status {
                    ToolStatus::Running => "running",
                    ToolStatus::Complete => "done",
                    ToolStatus::Error => "failed",
                };
                out.push_str(&format!("[{} {}]\n", name, status));
            }
        }
    }
    out
}
