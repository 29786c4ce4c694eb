//! History reconciliation
//!
//! Merges server-replayed history with the locally persisted cache exactly
//! once per connection. The cache paints a plausible transcript if the
//! server stays quiet past a short grace window; authoritative server
//! history always replaces it, and once applied, local history is rejected
//! for the remainder of the connection.
//!
//! Pure state machine: the owning consumer loop drives the grace timer and
//! executes the cache writes this module decides on.

use gangway_protocol::Provenance;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Grace window open, waiting for authoritative history
    Waiting,
    /// Local cache painted speculatively
    LocalApplied,
    /// Server replay applied; local history locked out
    ServerApplied,
    /// Nothing painted; transcript starts empty
    Fresh,
}

/// What to do with an accepted output chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkWrite {
    /// First confirmed write of a fresh connection: overwrite the stale entry
    Replace,
    /// Continuation of an entry that is already current
    Append,
}

pub struct HistoryReconciler {
    phase: Phase,
    cached: Option<String>,
    wrote: bool,
}

impl HistoryReconciler {
    /// `cached` is the transcript loaded from the HistoryCache before the
    /// connection opened, if any.
    pub fn new(cached: Option<String>) -> Self {
        Self {
            phase: Phase::Waiting,
            cached,
            wrote: false,
        }
    }

    /// True while the grace timer should stay armed.
    pub fn awaiting_history(&self) -> bool {
        self.phase == Phase::Waiting
    }

    /// The grace window elapsed without server history. Returns the cached
    /// transcript to paint with `local` provenance, if one exists and local
    /// history is still admissible for this connection.
    pub fn grace_elapsed(&mut self) -> Option<String> {
        if self.phase != Phase::Waiting {
            return None;
        }
        match self.cached.take() {
            Some(data) => {
                self.phase = Phase::LocalApplied;
                // The entry already holds exactly what we painted
                self.wrote = true;
                Some(data)
            }
            None => {
                self.phase = Phase::Fresh;
                None
            }
        }
    }

    /// Authoritative server history arrived: it fully replaces whatever is
    /// displayed, flips provenance to `server`, and permanently rejects
    /// local-sourced history for this connection.
    pub fn server_history(&mut self) {
        self.phase = Phase::ServerApplied;
        self.cached = None;
        // Caller replaces the cache entry with the server transcript
        self.wrote = true;
    }

    /// Resume referenced a session the backend no longer knows: assumed
    /// continuity is discarded and the cache entry is no longer trusted.
    pub fn session_not_found(&mut self) {
        self.phase = Phase::Fresh;
        self.cached = None;
        self.wrote = false;
    }

    /// How to persist an accepted output chunk.
    pub fn confirm_chunk(&mut self) -> ChunkWrite {
        if self.wrote {
            ChunkWrite::Append
        } else {
            self.wrote = true;
            ChunkWrite::Replace
        }
    }

    pub fn provenance(&self) -> Option<Provenance> {
        match self.phase {
            Phase::LocalApplied => Some(Provenance::Local),
            Phase::ServerApplied => Some(Provenance::Server),
            Phase::Waiting | Phase::Fresh => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_paints_after_grace_window() {
        let mut reconciler = HistoryReconciler::new(Some("$ make\nok\n".to_string()));
        assert!(reconciler.awaiting_history());

        let painted = reconciler.grace_elapsed().unwrap();
        assert_eq!(painted, "$ make\nok\n");
        assert_eq!(reconciler.provenance(), Some(Provenance::Local));
        assert!(!reconciler.awaiting_history());
    }

    #[test]
    fn server_history_replaces_local_and_locks_it_out() {
        let mut reconciler = HistoryReconciler::new(Some("speculative".to_string()));
        reconciler.grace_elapsed();

        reconciler.server_history();
        assert_eq!(reconciler.provenance(), Some(Provenance::Server));

        // Local history is rejected for the rest of this connection
        assert!(reconciler.grace_elapsed().is_none());
        assert_eq!(reconciler.provenance(), Some(Provenance::Server));
    }

    #[test]
    fn server_history_before_grace_preempts_local() {
        let mut reconciler = HistoryReconciler::new(Some("speculative".to_string()));
        reconciler.server_history();

        assert!(reconciler.grace_elapsed().is_none());
        assert_eq!(reconciler.provenance(), Some(Provenance::Server));
    }

    #[test]
    fn no_cache_means_fresh_transcript() {
        let mut reconciler = HistoryReconciler::new(None);
        assert!(reconciler.grace_elapsed().is_none());
        assert_eq!(reconciler.provenance(), None);
    }

    #[test]
    fn session_not_found_discards_cached_continuity() {
        let mut reconciler = HistoryReconciler::new(Some("old shell".to_string()));
        reconciler.session_not_found();

        assert!(reconciler.grace_elapsed().is_none());
        assert_eq!(reconciler.provenance(), None);
    }

    #[test]
    fn first_chunk_of_fresh_connection_replaces_entry() {
        let mut reconciler = HistoryReconciler::new(None);
        reconciler.grace_elapsed();

        assert_eq!(reconciler.confirm_chunk(), ChunkWrite::Replace);
        assert_eq!(reconciler.confirm_chunk(), ChunkWrite::Append);
    }

    #[test]
    fn chunks_after_painted_history_append() {
        let mut reconciler = HistoryReconciler::new(Some("painted".to_string()));
        reconciler.grace_elapsed();
        assert_eq!(reconciler.confirm_chunk(), ChunkWrite::Append);

        let mut reconciler = HistoryReconciler::new(None);
        reconciler.server_history();
        assert_eq!(reconciler.confirm_chunk(), ChunkWrite::Append);
    }
}
