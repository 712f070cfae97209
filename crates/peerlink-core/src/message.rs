//! Chat messages and server notices.

use crate::registry::PeerId;
use chrono::{DateTime, Local};
use std::fmt;

/// A chat line from one peer, rendered once and broadcast.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// Sender id.
    pub sender_id: PeerId,
    /// Sender display name.
    pub sender_name: String,
    /// Message text.
    pub content: String,
    /// Time the server accepted the message.
    pub sent_at: DateTime<Local>,
}

impl ChatMessage {
    /// New message stamped with the current local time.
    pub fn new(sender_id: PeerId, sender_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            sender_id,
            sender_name: sender_name.into(),
            content: content.into(),
            sent_at: Local::now(),
        }
    }

    /// `[HH:MM:SS] name: content`
    pub fn render(&self) -> String {
        format!(
            "[{}] {}: {}",
            self.sent_at.format("%H:%M:%S"),
            self.sender_name,
            self.content
        )
    }
}

impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Membership notices broadcast by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A new peer registered.
    Joined(String),
    /// An offline peer reconnected.
    BackOnline(String),
    /// A peer went offline.
    Departed(String),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Joined(name) => write!(f, "User {} has joined the chat", name),
            Notice::BackOnline(name) => write!(f, "User {} is back online", name),
            Notice::Departed(name) => write!(f, "User {} is now offline", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_render_format() {
        let mut msg = ChatMessage::new(PeerId::new(1), "alice", "hi all");
        msg.sent_at = Local.with_ymd_and_hms(2024, 5, 1, 9, 3, 7).unwrap();
        assert_eq!(msg.render(), "[09:03:07] alice: hi all");
    }

    #[test]
    fn test_notice_text() {
        assert_eq!(Notice::Joined("bob".into()).to_string(), "User bob has joined the chat");
        assert_eq!(Notice::Departed("bob".into()).to_string(), "User bob is now offline");
        assert_eq!(Notice::BackOnline("bob".into()).to_string(), "User bob is back online");
    }
}
