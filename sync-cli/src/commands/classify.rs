//! Classify message text as a system event.

use anyhow::Result;
use huddle_sync_core::system_message;

/// Run the classify command.
pub fn run(text: &str) -> Result<()> {
    println!("{}", describe(text)?);
    Ok(())
}

/// JSON of the system event, or a note that the text is a plain message.
fn describe(text: &str) -> Result<String> {
    match system_message::parse(text) {
        Some(event) => Ok(serde_json::to_string_pretty(&event)?),
        None => Ok("plain message".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text() {
        assert_eq!(describe("hello").unwrap(), "plain message");
    }

    #[test]
    fn team_join_as_json() {
        let out = describe("👋 Alice joined the team!\n\n\"hi all\"").unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["type"], "team_join");
        assert_eq!(value["userName"], "Alice");
        assert_eq!(value["personalMessage"], "hi all");
    }
}
