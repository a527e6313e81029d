//! Send a message and wait for its acknowledgment.

use anyhow::{Context, Result};
use huddle_sync_client::EngineEvent;
use huddle_sync_types::{ConversationId, ConversationKind};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use crate::config::CliConfig;

/// How long to wait for the server to acknowledge.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the send command.
pub async fn run(
    config: &CliConfig,
    conversation: ConversationId,
    kind: ConversationKind,
    content: &str,
) -> Result<()> {
    let engine = super::connect(config).await?;
    engine
        .select_conversation(conversation.clone(), kind)
        .await
        .with_context(|| format!("Failed to open conversation {conversation}"))?;

    let mut events = engine.subscribe();
    let client_id = engine.send_message(content).await.context("Send failed")?;

    let acknowledged = tokio::time::timeout(ACK_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(EngineEvent::MessageReceived {
                    conversation_id, ..
                }) if conversation_id == conversation => {
                    let pending = engine
                        .messages(&conversation)
                        .await
                        .iter()
                        .any(|m| m.is_optimistic && m.client_id == Some(client_id));
                    if !pending {
                        return true;
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);

    engine.disconnect().await?;
    anyhow::ensure!(acknowledged, "No acknowledgment within {ACK_TIMEOUT:?}");
    println!("Sent ({client_id})");
    Ok(())
}
