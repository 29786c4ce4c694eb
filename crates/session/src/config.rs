//! Session configuration

use std::time::Duration;

use gangway_protocol::SessionMode;

/// Identity and tunables for one logical session.
///
/// A config describes the session, not a connection: the same config is
/// reused across reconnects (with `resume` forced on after the first
/// successful open).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Backend WebSocket endpoint, e.g. `ws://127.0.0.1:4000/ws`
    pub url: String,
    /// Backend session to attach to; `None` requests a new one
    pub session_id: Option<String>,
    pub mode: SessionMode,
    /// Ask the backend to replay the existing session
    pub resume: bool,
    /// Discard any existing backend session with this id
    pub force_new: bool,
    pub session_name: Option<String>,

    /// Fixed delay before each reconnect attempt
    pub reconnect_delay: Duration,
    /// Reconnect attempts before reporting a terminal failure
    pub max_retries: u32,
    /// Attempt count past which reconnects are surfaced to the caller
    pub retry_notify_threshold: u32,
    /// How long to wait for server history before painting the local cache
    pub history_grace: Duration,
    /// Byte cap on the persisted per-session transcript cache
    pub cache_cap: usize,
    /// Disable automatic reconnects entirely
    pub reconnect_disabled: bool,
}

impl SessionConfig {
    pub fn new(url: impl Into<String>, mode: SessionMode) -> Self {
        Self {
            url: url.into(),
            session_id: None,
            mode,
            resume: false,
            force_new: false,
            session_name: None,
            reconnect_delay: Duration::from_millis(1500),
            max_retries: 5,
            retry_notify_threshold: 2,
            history_grace: Duration::from_millis(200),
            cache_cap: 200 * 1024,
            reconnect_disabled: false,
        }
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_force_new(mut self, force_new: bool) -> Self {
        self.force_new = force_new;
        self
    }

    /// Connection URL with the session-selection query parameters applied
    pub fn connect_url(&self) -> String {
        let mut params: Vec<String> = Vec::new();
        if let Some(id) = &self.session_id {
            params.push(format!("session_id={}", urlencoding::encode(id)));
        }
        params.push(format!("resume={}", u8::from(self.resume)));
        params.push(format!("force_new={}", u8::from(self.force_new)));
        params.push(format!("mode={}", self.mode.as_str()));
        if let Some(name) = &self.session_name {
            params.push(format!("session_name={}", urlencoding::encode(name)));
        }
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.url, sep, params.join("&"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_url_includes_selection_params() {
        let config = SessionConfig::new("ws://localhost:4000/ws", SessionMode::Structured)
            .with_session_id("sess 1")
            .with_resume(true);
        let url = config.connect_url();
        assert!(url.starts_with("ws://localhost:4000/ws?"));
        assert!(url.contains("session_id=sess%201"));
        assert!(url.contains("resume=1"));
        assert!(url.contains("force_new=0"));
        assert!(url.contains("mode=structured"));
    }

    #[test]
    fn connect_url_omits_missing_session_id() {
        let config = SessionConfig::new("ws://localhost:4000/ws", SessionMode::Raw);
        let url = config.connect_url();
        assert!(!url.contains("session_id="));
        assert!(url.contains("mode=raw"));
    }

    #[test]
    fn connect_url_appends_to_existing_query() {
        let config = SessionConfig::new("ws://localhost:4000/ws?token=abc", SessionMode::Raw);
        let url = config.connect_url();
        assert!(url.contains("?token=abc&resume=0"));
    }
}
