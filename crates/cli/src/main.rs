//! Gangway CLI
//!
//! Terminal client for Gangway sessions: raw shell pass-through and a
//! structured conversation REPL over the same session core the web UI uses.

mod attach;
mod chat;
mod logging;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "gangway", about = "Attach to agent sessions from the terminal")]
struct Cli {
    /// Backend WebSocket endpoint
    #[arg(long, global = true, env = "GANGWAY_URL", default_value = "ws://127.0.0.1:4000/ws")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Attach to a shell session (raw byte-stream pass-through)
    Attach {
        /// Session to attach to; omit to start a new one
        #[arg(long)]
        session: Option<String>,
        /// Discard any existing backend session with this id
        #[arg(long)]
        force_new: bool,
    },
    /// Converse with an agent session (structured event stream)
    Chat {
        /// Session to continue; omit to start a new one
        #[arg(long)]
        session: Option<String>,
        /// Replay the existing conversation before continuing
        #[arg(long)]
        resume: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = logging::init_logging()?;

    match cli.command {
        Command::Attach { session, force_new } => {
            attach::run(&cli.url, session, force_new).await
        }
        Command::Chat { session, resume } => chat::run(&cli.url, session, resume).await,
    }
}
