//! Open a conversation and print what happens in it.

use anyhow::{Context, Result};
use huddle_sync_client::EngineEvent;
use huddle_sync_core::ChannelEvent;
use huddle_sync_types::{ConversationId, ConversationKind, MessageId};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use super::{format_message, Engine};
use crate::config::CliConfig;

/// Run the watch command until Ctrl-C.
pub async fn run(
    config: &CliConfig,
    conversation: ConversationId,
    kind: ConversationKind,
) -> Result<()> {
    let engine = super::connect(config).await?;
    let mut events = engine.subscribe();
    engine
        .select_conversation(conversation.clone(), kind)
        .await
        .with_context(|| format!("Failed to open conversation {conversation}"))?;

    for message in engine.messages(&conversation).await {
        println!("{}", format_message(&message));
    }
    println!("--- watching {conversation} (Ctrl-C to stop) ---");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&engine, &conversation, event).await,
                Err(RecvError::Lagged(missed)) => warn!(missed, "output fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.disconnect().await?;
    Ok(())
}

async fn print_event(engine: &Engine, conversation: &ConversationId, event: EngineEvent) {
    match event {
        EngineEvent::MessageReceived {
            conversation_id,
            message_id,
        } if &conversation_id == conversation => {
            if let Some(line) = message_line(engine, conversation, &message_id).await {
                println!("{line}");
            }
        }
        EngineEvent::TypingChanged { conversation_id } if &conversation_id == conversation => {
            let typers = engine.active_typers(conversation).await;
            if !typers.is_empty() {
                let names: Vec<&str> = typers.iter().map(|(_, name)| name.as_str()).collect();
                println!("  ... {} typing", names.join(", "));
            }
        }
        EngineEvent::PresenceChanged => {
            println!("  ({} online)", engine.online_users().await.len());
        }
        EngineEvent::NotificationAdded(notification) => {
            println!("  [notification] {}", notification.payload);
        }
        EngineEvent::SendFailed { error, .. } => println!("  send failed: {error}"),
        EngineEvent::Connection(ChannelEvent::Disconnected { reason }) => {
            println!("  disconnected: {reason}");
        }
        EngineEvent::Connection(ChannelEvent::Reconnected) => println!("  reconnected"),
        _ => {}
    }
}

async fn message_line(
    engine: &Engine,
    conversation: &ConversationId,
    id: &MessageId,
) -> Option<String> {
    let messages = engine.messages(conversation).await;
    messages
        .iter()
        .find(|m| &m.id == id)
        .map(format_message)
}
