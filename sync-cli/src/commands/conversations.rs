//! List conversations.

use anyhow::Result;
use huddle_sync_types::Conversation;

use crate::config::CliConfig;

/// Run the conversations command.
pub async fn run(config: &CliConfig) -> Result<()> {
    let engine = super::connect(config).await?;
    let conversations = engine.conversations().await;
    engine.disconnect().await?;

    if conversations.is_empty() {
        println!("No conversations.");
        return Ok(());
    }
    for conversation in &conversations {
        println!("{}", format_row(conversation));
    }
    println!();
    println!("{} unread", conversations.iter().map(|c| c.unread_count).sum::<u32>());
    Ok(())
}

fn format_row(conversation: &Conversation) -> String {
    let unread = if conversation.unread_count > 0 {
        format!(" ({})", conversation.unread_count)
    } else {
        String::new()
    };
    let preview = conversation.last_message_preview.as_deref().unwrap_or("");
    format!(
        "{:<6} {:<24} {}{}  {}",
        conversation.kind.as_str(),
        conversation.id.as_str(),
        conversation.counterpart.display_name(),
        unread,
        preview
    )
}
