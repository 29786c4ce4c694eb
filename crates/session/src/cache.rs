//! Bounded per-session transcript cache — batched SQLite writes
//!
//! Uses `spawn_blocking` for async-safe SQLite access and batches writes so
//! high-volume output never waits on the disk. Persistence is best-effort:
//! failures are logged and swallowed, degrading reconnect replay without
//! breaking the session.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Fixed key prefix for cache entries
const KEY_PREFIX: &str = "gangway.history.";

const BATCH_SIZE: usize = 32;
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Commands consumed by the cache writer
#[derive(Debug)]
pub enum CacheCommand {
    /// Append a confirmed chunk, trimming the entry to the cap
    Append { session_id: String, chunk: String },

    /// Replace the entry wholesale (authoritative history, or the first
    /// confirmed chunk of a fresh connection)
    Replace { session_id: String, data: String },

    /// Drop the entry
    Remove { session_id: String },

    /// Force an immediate flush (used by shutdown and tests)
    Flush { reply: oneshot::Sender<()> },
}

/// Handle to the cache writer task (cheap to Clone).
#[derive(Clone)]
pub struct HistoryCache {
    tx: mpsc::Sender<CacheCommand>,
    db_path: PathBuf,
    cap: usize,
}

impl HistoryCache {
    /// Open the cache at the default location (`~/.gangway/gangway.db`,
    /// overridable via `GANGWAY_HOME`) and spawn the writer task.
    pub fn open(cap: usize) -> Self {
        Self::open_at(default_db_path(), cap)
    }

    pub fn open_at(db_path: PathBuf, cap: usize) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let writer = CacheWriter {
            rx,
            db_path: db_path.clone(),
            cap,
            batch: Vec::with_capacity(BATCH_SIZE),
        };
        tokio::spawn(writer.run());

        Self { tx, db_path, cap }
    }

    /// Queue a confirmed output chunk. Never blocks and never fails the
    /// caller; a full or closed channel is logged and dropped.
    pub fn append(&self, session_id: &str, chunk: &str) {
        self.send(CacheCommand::Append {
            session_id: session_id.to_string(),
            chunk: chunk.to_string(),
        });
    }

    /// Queue a wholesale replacement of the entry.
    pub fn replace(&self, session_id: &str, data: &str) {
        self.send(CacheCommand::Replace {
            session_id: session_id.to_string(),
            data: data.to_string(),
        });
    }

    pub fn remove(&self, session_id: &str) {
        self.send(CacheCommand::Remove {
            session_id: session_id.to_string(),
        });
    }

    /// Wait until every queued write has reached the database.
    pub async fn flush(&self) {
        let (reply, ack) = oneshot::channel();
        if self.tx.send(CacheCommand::Flush { reply }).await.is_ok() {
            let _ = ack.await;
        }
    }

    /// Read the cached transcript for a session, if any.
    pub async fn load(&self, session_id: &str) -> Option<String> {
        let db_path = self.db_path.clone();
        let key = cache_key(session_id);

        let result = tokio::task::spawn_blocking(move || read_entry(&db_path, &key)).await;
        match result {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => {
                warn!(
                    component = "cache",
                    event = "cache.read_failed",
                    error = %e,
                    "Failed to read history cache"
                );
                None
            }
            Err(e) => {
                error!(
                    component = "cache",
                    event = "cache.read_panicked",
                    error = %e,
                    "History cache read panicked"
                );
                None
            }
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    fn send(&self, cmd: CacheCommand) {
        if self.tx.try_send(cmd).is_err() {
            warn!(
                component = "cache",
                event = "cache.write_dropped",
                "Cache channel full or closed, write dropped"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

struct CacheWriter {
    rx: mpsc::Receiver<CacheCommand>,
    db_path: PathBuf,
    cap: usize,
    batch: Vec<CacheCommand>,
}

impl CacheWriter {
    async fn run(mut self) {
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(CacheCommand::Flush { reply }) => {
                        self.flush().await;
                        let _ = reply.send(());
                    }
                    Some(cmd) => {
                        self.batch.push(cmd);
                        if self.batch.len() >= BATCH_SIZE {
                            self.flush().await;
                        }
                    }
                    None => {
                        self.flush().await;
                        return;
                    }
                },

                _ = interval.tick() => {
                    if !self.batch.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.batch);
        let db_path = self.db_path.clone();
        let cap = self.cap;

        let result =
            tokio::task::spawn_blocking(move || flush_batch(&db_path, batch, cap)).await;

        match result {
            Ok(Ok(count)) => {
                debug!(
                    component = "cache",
                    event = "cache.flushed",
                    count = count,
                    "Flushed cache writes"
                );
            }
            Ok(Err(e)) => {
                warn!(
                    component = "cache",
                    event = "cache.flush_failed",
                    error = %e,
                    "Cache flush failed, writes dropped"
                );
            }
            Err(e) => {
                error!(
                    component = "cache",
                    event = "cache.flush_panicked",
                    error = %e,
                    "Cache flush panicked"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

fn cache_key(session_id: &str) -> String {
    format!("{}{}", KEY_PREFIX, session_id)
}

fn default_db_path() -> PathBuf {
    let base = std::env::var("GANGWAY_HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(|| dirs::home_dir().map(|home| home.join(".gangway")))
        .unwrap_or_else(|| PathBuf::from("/tmp/.gangway"));
    base.join("gangway.db")
}

fn open_db(db_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = db_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS history_cache (
            key        TEXT PRIMARY KEY,
            data       TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )",
    )?;
    Ok(conn)
}

fn read_entry(db_path: &Path, key: &str) -> rusqlite::Result<Option<String>> {
    if !db_path.exists() {
        return Ok(None);
    }
    let conn = open_db(db_path)?;
    conn.query_row(
        "SELECT data FROM history_cache WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

fn flush_batch(db_path: &Path, batch: Vec<CacheCommand>, cap: usize) -> rusqlite::Result<usize> {
    let mut conn = open_db(db_path)?;
    let tx = conn.transaction()?;
    let now = unix_seconds();
    let mut count = 0;

    for cmd in batch {
        match cmd {
            CacheCommand::Append { session_id, chunk } => {
                let key = cache_key(&session_id);
                let existing: Option<String> = tx
                    .query_row(
                        "SELECT data FROM history_cache WHERE key = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()?;
                let mut data = existing.unwrap_or_default();
                data.push_str(&chunk);
                upsert(&tx, &key, &trim_to_cap(data, cap), now)?;
            }
            CacheCommand::Replace { session_id, data } => {
                upsert(&tx, &cache_key(&session_id), &trim_to_cap(data, cap), now)?;
            }
            CacheCommand::Remove { session_id } => {
                tx.execute(
                    "DELETE FROM history_cache WHERE key = ?1",
                    params![cache_key(&session_id)],
                )?;
            }
            CacheCommand::Flush { .. } => continue,
        }
        count += 1;
    }

    tx.commit()?;
    Ok(count)
}

fn upsert(tx: &rusqlite::Transaction<'_>, key: &str, data: &str, now: i64) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO history_cache (key, data, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
        params![key, data, now],
    )?;
    Ok(())
}

/// Keep the tail of the buffer, never splitting a UTF-8 sequence.
fn trim_to_cap(data: String, cap: usize) -> String {
    if data.len() <= cap {
        return data;
    }
    let mut cut = data.len() - cap;
    while !data.is_char_boundary(cut) {
        cut += 1;
    }
    data[cut..].to_string()
}

fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
