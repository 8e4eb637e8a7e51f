//! Mailbox log access: the trait seam over the durable per-agent logs,
//! fan-out send, and merge/dedup of multi-mailbox reads.

pub mod checkpoint;
pub mod client;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::protocol::types::{now_millis, stream_name, MessageEntry, MessageKind};

pub use client::RedisMailbox;

/// Operations over the durable append-only per-agent logs.
///
/// `read_from` treats the cursor as exclusive: with the genesis cursor
/// (`"0"`) it returns from the beginning, otherwise only entries with ids
/// after the cursor, in increasing id order.
#[async_trait]
pub trait MailboxLog: Send + Sync {
    /// Append one entry and return the store-assigned id.
    async fn append(
        &self,
        mailbox: &str,
        from: &str,
        to: &str,
        content: &str,
        timestamp: i64,
        kind: MessageKind,
    ) -> Result<String>;

    /// Read up to `max` entries with id greater than `cursor`.
    async fn read_from(&self, mailbox: &str, cursor: &str, max: usize)
        -> Result<Vec<MessageEntry>>;

    /// Read up to `max` most recent entries, most-recent-first.
    async fn read_range(&self, mailbox: &str, max: usize) -> Result<Vec<MessageEntry>>;

    /// Refresh this agent's liveness key. Best-effort; default is a no-op
    /// for backends without one.
    async fn heartbeat(&self, _agent: &str) -> Result<()> {
        Ok(())
    }
}

/// Fan a message out to every recipient's mailbox.
///
/// One physical entry is written per recipient, all carrying the same
/// content, timestamp and the full comma-joined `to` list, so any single
/// mailbox read can reconstruct the fan-out. Returns the last appended id.
///
/// When `stream_override` targets this agent's own mailbox but the
/// recipients do not include the agent, the call is refused: replies must
/// land in the requester's log, not the sender's.
pub async fn send_message(
    log: &dyn MailboxLog,
    me: &str,
    content: &str,
    to: &str,
    kind: MessageKind,
    stream_override: Option<&str>,
) -> Result<String> {
    let recipients: Vec<String> = to
        .split(',')
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();

    if recipients.is_empty() {
        return Err(Error::Envelope("recipient list is empty".to_string()));
    }

    if let Some(stream) = stream_override {
        if stream == stream_name(me) && !recipients.iter().any(|r| r == me) {
            return Err(Error::Envelope(format!(
                "refusing to write reply for {} into own stream {}",
                recipients.join(","),
                stream
            )));
        }
    }

    let to_field = recipients.join(", ");
    let timestamp = now_millis();
    let mut last_id = String::new();

    for recipient in &recipients {
        let stream = stream_override
            .map(|s| s.to_string())
            .unwrap_or_else(|| stream_name(recipient));
        last_id = log
            .append(&stream, me, &to_field, content, timestamp, kind)
            .await?;
    }

    Ok(last_id)
}

/// Merge entries gathered from several mailbox reads, dropping fan-out
/// duplicates keyed on `(from, timestamp, content)` and ordering by
/// timestamp. Pure function.
pub fn merge_entries(entries: Vec<MessageEntry>) -> Vec<MessageEntry> {
    use std::collections::HashSet;

    let mut seen: HashSet<(String, i64, String)> = HashSet::new();
    let mut merged: Vec<MessageEntry> = Vec::with_capacity(entries.len());

    for entry in entries {
        let key = (entry.from.clone(), entry.timestamp, entry.content.clone());
        if seen.insert(key) {
            merged.push(entry);
        }
    }

    merged.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| parse_entry_id(&a.id).cmp(&parse_entry_id(&b.id)))
    });
    merged
}

/// Parse a store id (`<ms>-<seq>`) into a comparable pair. Malformed ids
/// sort first.
pub fn parse_entry_id(id: &str) -> (u64, u64) {
    let mut parts = id.splitn(2, '-');
    let ms = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let seq = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (ms, seq)
}

/// In-memory mailbox log used by unit tests across the crate.
#[cfg(test)]
pub mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MemoryMailbox {
        streams: Mutex<HashMap<String, Vec<MessageEntry>>>,
        seq: AtomicU64,
    }

    impl MemoryMailbox {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn entries(&self, mailbox: &str) -> Vec<MessageEntry> {
            self.streams
                .lock()
                .unwrap()
                .get(mailbox)
                .cloned()
                .unwrap_or_default()
        }

        /// Append with an explicit timestamp, returning the assigned id.
        pub fn push(
            &self,
            mailbox: &str,
            from: &str,
            to: &str,
            content: &str,
            timestamp: i64,
        ) -> String {
            let id = format!("{}-0", self.seq.fetch_add(1, Ordering::SeqCst) + 1);
            let entry = MessageEntry {
                id: id.clone(),
                from: from.to_string(),
                to: to.to_string(),
                content: content.to_string(),
                timestamp,
                kind: MessageKind::Text,
            };
            self.streams
                .lock()
                .unwrap()
                .entry(mailbox.to_string())
                .or_default()
                .push(entry);
            id
        }
    }

    #[async_trait]
    impl MailboxLog for MemoryMailbox {
        async fn append(
            &self,
            mailbox: &str,
            from: &str,
            to: &str,
            content: &str,
            timestamp: i64,
            kind: MessageKind,
        ) -> Result<String> {
            let id = format!("{}-0", self.seq.fetch_add(1, Ordering::SeqCst) + 1);
            let entry = MessageEntry {
                id: id.clone(),
                from: from.to_string(),
                to: to.to_string(),
                content: content.to_string(),
                timestamp,
                kind,
            };
            self.streams
                .lock()
                .unwrap()
                .entry(mailbox.to_string())
                .or_default()
                .push(entry);
            Ok(id)
        }

        async fn read_from(
            &self,
            mailbox: &str,
            cursor: &str,
            max: usize,
        ) -> Result<Vec<MessageEntry>> {
            let streams = self.streams.lock().unwrap();
            let cursor_key = parse_entry_id(cursor);
            Ok(streams
                .get(mailbox)
                .map(|entries| {
                    entries
                        .iter()
                        .filter(|e| parse_entry_id(&e.id) > cursor_key)
                        .take(max)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn read_range(&self, mailbox: &str, max: usize) -> Result<Vec<MessageEntry>> {
            let streams = self.streams.lock().unwrap();
            Ok(streams
                .get(mailbox)
                .map(|entries| entries.iter().rev().take(max).cloned().collect())
                .unwrap_or_default())
        }
    }
}
