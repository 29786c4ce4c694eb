//! Gangway Session Core
//!
//! Keeps one logical agent session coherent across an unreliable, resumable
//! WebSocket connection: a transport session manager with bounded
//! reconnect, a history reconciler that merges server replay with a local
//! cache exactly once, a lenient envelope decoder, a pure incremental
//! message aggregator, and a permission negotiation coordinator.

pub mod aggregate;
pub mod approval;
pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod manager;
pub mod reconcile;

pub use cache::HistoryCache;
pub use config::SessionConfig;
pub use connection::ConnectionState;
pub use error::SessionError;
pub use event::SessionEvent;
pub use manager::{SessionCommand, SessionManager, SessionSnapshot};
