//! Message types for the mailbox relay protocol.

use serde::{Deserialize, Serialize};

/// Message kind stored in the `type` field of a log entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Normal text message
    Text,
    /// Visible error breadcrumb written by the relay
    Error,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Error => "error",
        }
    }

    /// Unknown kinds fold into Text so older entries stay readable.
    pub fn parse(s: &str) -> Self {
        match s {
            "error" => MessageKind::Error,
            _ => MessageKind::Text,
        }
    }
}

impl Default for MessageKind {
    fn default() -> Self {
        Self::Text
    }
}

/// One record in an agent's append-only mailbox log.
///
/// `id` is assigned by the store and strictly increasing within one log.
/// Entries are never mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageEntry {
    pub id: String,
    /// Sender token, lowercase.
    pub from: String,
    /// Comma-joined recipient tokens; may be empty. Lists *all* recipients
    /// of a fan-out so a reader can reconstruct it from any one mailbox.
    pub to: String,
    pub content: String,
    /// Milliseconds since epoch, assigned by the writer.
    pub timestamp: i64,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
}

impl MessageEntry {
    /// Recipient tokens parsed from the `to` field.
    pub fn recipients(&self) -> Vec<String> {
        self.to
            .split(',')
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Whether this entry is addressed to `agent`. An empty `to` field means
    /// "whoever owns the mailbox it landed in".
    pub fn is_addressed_to(&self, agent: &str) -> bool {
        let recipients = self.recipients();
        recipients.is_empty() || recipients.iter().any(|r| r == agent)
    }
}

/// Mailbox log stream name for an agent.
pub fn stream_name(agent: &str) -> String {
    format!("{}:messages", agent)
}

/// Current wall clock in milliseconds since epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
