//! Raw-mode pass-through: local terminal <-> remote shell session.

use std::io::Write;

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::info;

use gangway_protocol::SessionMode;
use gangway_session::{HistoryCache, SessionConfig, SessionEvent, SessionManager};

const DETACH_BYTE: u8 = 0x1D; // Ctrl-]

pub async fn run(url: &str, session: Option<String>, force_new: bool) -> Result<()> {
    info!(
        component = "cli",
        event = "attach.start",
        url = %url,
        session = ?session,
        "Attaching to shell session"
    );
    let mut config = SessionConfig::new(url, SessionMode::Raw);
    config.resume = session.is_some();
    config.session_id = session;
    config.force_new = force_new;

    let cache = HistoryCache::open(config.cache_cap);
    let manager = SessionManager::spawn(config, cache);

    let (event_tx, mut event_rx) = mpsc::channel(256);
    manager.set_event_sink(event_tx).await;
    manager.open().await;

    let _raw = RawModeGuard::enter()?;
    eprint!("[gangway: attached -- Ctrl-] to detach]\r\n");

    // Blocking stdin reader thread; ends when the channel closes
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
    std::thread::spawn(move || {
        use std::io::Read;
        let mut stdin = std::io::stdin().lock();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut sigwinch = signal(SignalKind::window_change())?;

    loop {
        tokio::select! {
            Some(data) = stdin_rx.recv() => {
                if let Some(pos) = data.iter().position(|&b| b == DETACH_BYTE) {
                    if pos > 0 {
                        manager
                            .send_input(String::from_utf8_lossy(&data[..pos]).to_string())
                            .await;
                    }
                    manager.close().await;
                    eprint!("\r\n[gangway: detached]\r\n");
                    break;
                }
                manager
                    .send_input(String::from_utf8_lossy(&data).to_string())
                    .await;
            }

            _ = sigwinch.recv() => {
                if let Some((cols, rows)) = terminal_size() {
                    manager.resize(cols, rows).await;
                }
            }

            event = event_rx.recv() => match event {
                Some(SessionEvent::Started { .. }) => {
                    if let Some((cols, rows)) = terminal_size() {
                        manager.resize(cols, rows).await;
                    }
                }
                Some(SessionEvent::Output { data }) => {
                    let mut stdout = std::io::stdout().lock();
                    let _ = stdout.write_all(data.as_bytes());
                    let _ = stdout.flush();
                }
                Some(SessionEvent::Reconnecting { attempt }) => {
                    eprint!("\r\n[gangway: reconnecting (attempt {})]\r\n", attempt);
                }
                Some(SessionEvent::RetriesExhausted { attempts }) => {
                    eprint!("\r\n[gangway: gave up after {} attempts]\r\n", attempts);
                    break;
                }
                Some(SessionEvent::SessionNotFound) => {
                    eprint!("\r\n[gangway: session gone, starting fresh]\r\n");
                    manager.open().await;
                }
                Some(SessionEvent::Exited { code }) => {
                    eprint!("\r\n[gangway: process exited ({})]\r\n",
                        code.map_or("unknown".to_string(), |c| c.to_string()));
                    break;
                }
                Some(SessionEvent::Closed) | None => break,
                Some(_) => {}
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Terminal plumbing
// ---------------------------------------------------------------------------

struct RawModeGuard {
    original: libc::termios,
}

impl RawModeGuard {
    fn enter() -> Result<Self> {
        unsafe {
            let mut term: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(libc::STDIN_FILENO, &mut term) != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            let original = term;
            libc::cfmakeraw(&mut term);
            if libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &term) != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            Ok(Self { original })
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &self.original);
        }
    }
}

/// (cols, rows) of the controlling terminal, if any
fn terminal_size() -> Option<(u16, u16)> {
    unsafe {
        let mut ws: libc::winsize = std::mem::zeroed();
        if libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) == 0
            && ws.ws_col > 0
            && ws.ws_row > 0
        {
            Some((ws.ws_col, ws.ws_row))
        } else {
            None
        }
    }
}
