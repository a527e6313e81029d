//! CLI command implementations.

pub mod classify;
pub mod conversations;
pub mod send;
pub mod watch;

use anyhow::{Context, Result};
use huddle_sync_client::{HttpSnapshotApi, SyncEngine, WebSocketTransport};
use huddle_sync_core::system_message;
use huddle_sync_types::Message;

use crate::config::CliConfig;

/// Engine over the real network stack.
pub type Engine = SyncEngine<WebSocketTransport, HttpSnapshotApi>;

/// Build an engine, connect it and load the conversation list.
pub async fn connect(config: &CliConfig) -> Result<Engine> {
    let sync = config.to_sync_config()?;
    let api = HttpSnapshotApi::new(sync.api_url.clone(), sync.token.clone());
    let engine = SyncEngine::new(sync, WebSocketTransport::new(), api);

    engine
        .connect()
        .await
        .context("Failed to connect event channel")?;
    engine
        .refresh_conversations()
        .await
        .context("Failed to fetch conversations")?;
    Ok(engine)
}

/// One line per message: time, sender, then text or the system event tag.
pub fn format_message(message: &Message) -> String {
    let sender = message
        .sender_name
        .as_deref()
        .unwrap_or(message.sender_id.as_str());
    let time = message.created_at.format("%H:%M");
    let body = match system_message::parse(&message.content) {
        Some(event) => format!("[{}]", event.kind()),
        None => message.content.clone(),
    };
    let mut line = format!("{time} {sender}: {body}");
    if message.failed {
        line.push_str(" (failed)");
    } else if message.is_optimistic {
        line.push_str(" (sending)");
    }
    line
}
