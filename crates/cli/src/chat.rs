//! Structured-mode REPL: submit turns, watch the folded timeline, answer
//! permission prompts.

use std::io::Write;

use anyhow::Result;
use console::style;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;

use gangway_protocol::{
    ApprovalDecision, ApprovalSource, MessagePart, PendingApproval, SessionMode, ToolStatus,
};
use gangway_session::{HistoryCache, SessionConfig, SessionEvent, SessionManager};

pub async fn run(url: &str, session: Option<String>, resume: bool) -> Result<()> {
    info!(
        component = "cli",
        event = "chat.start",
        url = %url,
        session = ?session,
        resume = resume,
        "Starting conversation session"
    );
    let mut config = SessionConfig::new(url, SessionMode::Structured);
    config.resume = resume && session.is_some();
    config.session_id = session;

    let cache = HistoryCache::open(config.cache_cap);
    let manager = SessionManager::spawn(config, cache);

    let (event_tx, mut event_rx) = mpsc::channel(256);
    manager.set_event_sink(event_tx).await;
    manager.open().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending: Option<PendingApproval> = None;
    let mut printed_parts = 0usize;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    manager.close().await;
                    break;
                };
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }

                if let Some(approval) = pending.take() {
                    let decision = if line.eq_ignore_ascii_case("y") {
                        ApprovalDecision::Allow
                    } else {
                        ApprovalDecision::Deny
                    };
                    manager.decide(approval.id, decision, None, None, None).await;
                    continue;
                }

                if line == "/quit" {
                    manager.close().await;
                    break;
                }
                if line == "/abort" {
                    manager.abort_turn().await;
                    continue;
                }
                manager.submit_text(line).await;
            }

            event = event_rx.recv() => match event {
                Some(SessionEvent::Started { session_id }) => {
                    println!(
                        "{}",
                        style(format!(
                            "session started{}",
                            session_id.map_or(String::new(), |id| format!(" ({})", id))
                        ))
                        .dim()
                    );
                    prompt();
                }
                Some(SessionEvent::TurnEnded { is_error }) => {
                    let snapshot = manager.snapshot();
                    print_parts(&snapshot.parts[printed_parts.min(snapshot.parts.len())..]);
                    printed_parts = snapshot.parts.len();
                    if is_error {
                        println!("{}", style("turn ended with an error").red());
                    }
                    if let Some(usage) = &snapshot.usage {
                        println!(
                            "{}",
                            style(format!(
                                "({} in / {} out tokens)",
                                usage.input_tokens, usage.output_tokens
                            ))
                            .dim()
                        );
                    }
                    prompt();
                }
                Some(SessionEvent::ApprovalRequested(approval)) => {
                    if approval.source == ApprovalSource::Denial {
                        // Informational only; acknowledge and move on
                        println!(
                            "{} {} {}",
                            style("denied:").red().bold(),
                            approval.tool_name.as_deref().unwrap_or("tool"),
                            approval.blocked_path.as_deref().unwrap_or("")
                        );
                        manager
                            .decide(approval.id, ApprovalDecision::Dismiss, None, None, None)
                            .await;
                    } else {
                        describe_approval(&approval);
                        pending = Some(approval);
                    }
                }
                Some(SessionEvent::ApprovalCancelled { .. }) => {
                    println!("{}", style("(permission request withdrawn)").dim());
                    pending = None;
                }
                Some(SessionEvent::SessionNotFound) => {
                    println!("{}", style("session gone, starting fresh").yellow());
                    manager.open().await;
                }
                Some(SessionEvent::Reconnecting { attempt }) => {
                    println!("{}", style(format!("reconnecting (attempt {})", attempt)).yellow());
                }
                Some(SessionEvent::RetriesExhausted { attempts }) => {
                    println!("{}", style(format!("gave up after {} attempts", attempts)).red());
                    break;
                }
                Some(SessionEvent::Error { message }) => {
                    eprintln!("{}", style(message).red());
                }
                Some(SessionEvent::Closed) | None => break,
                Some(_) => {}
            }
        }
    }

    Ok(())
}

fn prompt() {
    print!("{} ", style(">").cyan());
    let _ = std::io::stdout().flush();
}

fn print_parts(parts: &[MessagePart]) {
    for part in parts {
        match part {
            MessagePart::Text { text } => println!("{}", text),
            MessagePart::Thinking { text } => {
                println!("{}", style(text).dim().italic());
            }
            MessagePart::ToolUse {
                name,
                output,
                status,
                ..
            } => {
                let marker = match status {
                    ToolStatus::Running => style("~").yellow(),
                    ToolStatus::Complete => style("+").green(),
                    ToolStatus::Error => style("!").red(),
                };
                println!("{} {}", marker, style(name).bold());
                if !output.is_empty() {
                    for line in output.lines() {
                        println!("    {}", style(line).dim());
                    }
                }
            }
        }
    }
}

fn describe_approval(approval: &PendingApproval) {
    let tool = approval.tool_name.as_deref().unwrap_or("tool");
    let detail = approval
        .tool_input
        .get("command")
        .or_else(|| approval.tool_input.get("file_path"))
        .or_else(|| approval.tool_input.get("path"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    println!(
        "{} {} {}",
        style("permission:").yellow().bold(),
        style(tool).bold(),
        detail
    );
    print!("allow? [y/N] ");
    let _ = std::io::stdout().flush();
}
