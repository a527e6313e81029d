//! # huddle-sync
//!
//! Command-line driver for the Huddle conversation sync engine.
//!
//! ## Commands
//!
//! - `conversations`: List conversations, most recent first
//! - `watch`: Open a conversation and follow it live
//! - `send`: Send a message and wait for the acknowledgment
//! - `classify`: Show how a message text is classified
//!
//! ## Example
//!
//! ```bash
//! # List conversations
//! huddle-sync conversations
//!
//! # Follow a team conversation
//! huddle-sync watch t42 --kind team
//!
//! # Send a direct message
//! huddle-sync send d7 "on my way"
//!
//! # Classify text (no config needed)
//! huddle-sync classify "🚪 Bob has left the team."
//! ```
//!
//! Configuration is read from `--config` or `config.toml` in the platform
//! config directory. `HUDDLE_TOKEN` overrides the configured token.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use huddle_sync_types::{ConversationId, ConversationKind};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{classify, conversations, send, watch};
use config::CliConfig;

/// Command-line driver for the Huddle conversation sync engine.
#[derive(Parser, Debug)]
#[command(name = "huddle-sync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List conversations
    Conversations,

    /// Open a conversation and print new messages until Ctrl-C
    Watch {
        /// Conversation id
        conversation: String,

        /// Conversation kind
        #[arg(long, value_enum, default_value_t = Kind::Direct)]
        kind: Kind,
    },

    /// Send a message to a conversation
    Send {
        /// Conversation id
        conversation: String,

        /// Message text
        message: String,

        /// Conversation kind
        #[arg(long, value_enum, default_value_t = Kind::Direct)]
        kind: Kind,
    },

    /// Classify message text as a system event
    Classify {
        /// Text to classify
        text: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Kind {
    Direct,
    Team,
}

impl From<Kind> for ConversationKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Direct => ConversationKind::Direct,
            Kind::Team => ConversationKind::Team,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Classify { text } => classify::run(&text)?,
        Commands::Conversations => {
            let config = CliConfig::load(cli.config.as_deref()).await?;
            conversations::run(&config).await?;
        }
        Commands::Watch { conversation, kind } => {
            let config = CliConfig::load(cli.config.as_deref()).await?;
            watch::run(&config, ConversationId::new(conversation), kind.into()).await?;
        }
        Commands::Send {
            conversation,
            message,
            kind,
        } => {
            let config = CliConfig::load(cli.config.as_deref()).await?;
            send::run(
                &config,
                ConversationId::new(conversation),
                kind.into(),
                &message,
            )
            .await?;
        }
    }

    Ok(())
}
