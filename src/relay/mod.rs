//! Relay consumer loop: poll own mailbox, classify entries, answer pings
//! inline and hand real requests to the configured slowpath policy.

pub mod context;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::protocol::envelope;
use crate::protocol::reply;
use crate::protocol::types::{stream_name, MessageEntry, MessageKind};
use crate::store::{self, checkpoint, MailboxLog};
use crate::worker::{Responder, WakeClient};

use context::build_window;

/// What the consumer decided to do with one mailbox entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Own outbound copy; never answered.
    SkipSelf,
    /// Addressed to someone else sharing the mailbox.
    SkipAddressedElsewhere,
    /// Sender is not on the allow-list.
    SkipNotAllowed,
    /// Liveness probe; answered inline without the worker.
    Ping { token: String },
    /// Real request for the slowpath.
    Slowpath,
}

/// Classify an entry read from `me`'s mailbox. The rules apply in order;
/// the first match wins.
pub fn classify(entry: &MessageEntry, me: &str, allowed_senders: &[String]) -> Classification {
    if entry.from == me {
        return Classification::SkipSelf;
    }
    if !entry.is_addressed_to(me) {
        return Classification::SkipAddressedElsewhere;
    }
    if !allowed_senders.iter().any(|s| s == &entry.from) {
        return Classification::SkipNotAllowed;
    }

    static PING_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)^PING-(\S+)$").unwrap());
    if let Some(caps) = PING_RE.captures(entry.content.trim()) {
        return Classification::Ping {
            token: caps[1].to_string(),
        };
    }

    Classification::Slowpath
}

/// Delivery policy for entries that need a composed reply.
#[async_trait]
pub trait SlowpathHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver the rendered dispatch envelope for `entry`. Errors are
    /// logged by the consumer; they never stop the batch.
    async fn dispatch(&self, entry: &MessageEntry, envelope_text: &str) -> Result<()>;
}

/// Fire-and-forget policy: hand the envelope to the wake hook and let a
/// human-attended session reply later through `tinyrelay reply`.
pub struct WakeDispatcher {
    wake: WakeClient,
}

impl WakeDispatcher {
    pub fn new(wake: WakeClient) -> Self {
        Self { wake }
    }
}

#[async_trait]
impl SlowpathHandler for WakeDispatcher {
    fn name(&self) -> &str {
        "wake"
    }

    async fn dispatch(&self, entry: &MessageEntry, envelope_text: &str) -> Result<()> {
        if self.wake.wake(envelope_text).await {
            Ok(())
        } else {
            Err(Error::Worker(format!(
                "wake hook refused dispatch for {}",
                entry.id
            )))
        }
    }
}

/// Inline policy: call the worker now and write its reply back through the
/// idempotent reply protocol. When the worker fails or returns nothing, a
/// wake carrying a preview of the request goes out so a human session can
/// answer manually.
pub struct InlineResponder {
    responder: Arc<dyn Responder>,
    wake: WakeClient,
    log: Arc<dyn MailboxLog>,
    me: String,
    fallback_peer: String,
    state_path: PathBuf,
}

impl InlineResponder {
    pub fn new(
        responder: Arc<dyn Responder>,
        wake: WakeClient,
        log: Arc<dyn MailboxLog>,
        me: &str,
        fallback_peer: &str,
        state_path: PathBuf,
    ) -> Self {
        Self {
            responder,
            wake,
            log,
            me: me.to_string(),
            fallback_peer: fallback_peer.to_string(),
            state_path,
        }
    }

    async fn fallback(&self, entry: &MessageEntry, reason: &str) {
        let preview = context::truncate_middle(&entry.content, 200);
        let text = format!(
            "Message {} from {} needs a manual reply ({}): {}",
            entry.id, entry.from, reason, preview
        );
        self.wake.wake(&text).await;
    }
}

#[async_trait]
impl SlowpathHandler for InlineResponder {
    fn name(&self) -> &str {
        "inline"
    }

    async fn dispatch(&self, entry: &MessageEntry, envelope_text: &str) -> Result<()> {
        match self.responder.generate(envelope_text, &entry.from).await {
            Ok(text) if !text.trim().is_empty() => {
                reply::handle(
                    self.log.as_ref(),
                    &self.me,
                    &self.fallback_peer,
                    envelope_text,
                    Some(text.trim()),
                    false,
                    &self.state_path,
                )
                .await
                .map_err(|e| Error::Worker(e.to_string()))?;
                Ok(())
            }
            Ok(_) => {
                self.fallback(entry, "empty reply").await;
                Ok(())
            }
            Err(e) => {
                self.fallback(entry, &e.code()).await;
                Err(Error::Worker(format!(
                    "responder {} failed for {}: {}",
                    self.responder.name(),
                    entry.id,
                    e
                )))
            }
        }
    }
}

/// The polling consumer over this agent's own mailbox.
pub struct Consumer {
    me: String,
    allowed_senders: Vec<String>,
    log: Arc<dyn MailboxLog>,
    handler: Arc<dyn SlowpathHandler>,
    checkpoint_path: PathBuf,
    poll_interval: Duration,
    batch_size: usize,
    context_entries: usize,
    context_entry_cap: usize,
    context_budget: usize,
    /// Recently seen entries, oldest first, feeding context windows.
    recent: VecDeque<MessageEntry>,
}

impl Consumer {
    pub fn new(
        settings: &Settings,
        log: Arc<dyn MailboxLog>,
        handler: Arc<dyn SlowpathHandler>,
        checkpoint_path: PathBuf,
    ) -> Self {
        Self {
            me: settings.identity.agent.clone(),
            allowed_senders: settings.relay.allowed_senders.clone(),
            log,
            handler,
            checkpoint_path,
            poll_interval: Duration::from_secs(settings.relay.poll_interval_secs),
            batch_size: settings.relay.batch_size,
            context_entries: settings.relay.context_entries,
            context_entry_cap: settings.relay.context_entry_cap,
            context_budget: settings.relay.context_budget,
            recent: VecDeque::new(),
        }
    }

    /// Poll until cancelled.
    pub async fn run(&mut self, cancel: CancellationToken) {
        tracing::info!(
            "Consumer for {} polling every {:?} via {} slowpath",
            self.me,
            self.poll_interval,
            self.handler.name()
        );

        loop {
            if let Err(e) = self.cycle().await {
                tracing::warn!("Poll cycle failed: {}", e);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Consumer for {} stopping", self.me);
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// One poll cycle: heartbeat, read a batch at the checkpoint, handle
    /// each entry in id order, checkpoint after each.
    pub async fn cycle(&mut self) -> Result<()> {
        if let Err(e) = self.log.heartbeat(&self.me).await {
            tracing::debug!("Heartbeat skipped: {}", e);
        }

        let cursor = checkpoint::load(&self.checkpoint_path);
        let mailbox = stream_name(&self.me);

        let batch = match self.log.read_from(&mailbox, &cursor, self.batch_size).await {
            Ok(batch) => batch,
            // Transport outages are expected; the next cycle retries.
            Err(Error::Transport(msg)) => {
                tracing::debug!("Transport not ready, skipping cycle: {}", msg);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for entry in batch {
            self.handle_entry(&entry).await;
            checkpoint::save(&self.checkpoint_path, &entry.id)?;
        }

        Ok(())
    }

    async fn handle_entry(&mut self, entry: &MessageEntry) {
        match classify(entry, &self.me, &self.allowed_senders) {
            Classification::SkipSelf => {
                tracing::debug!("{} is our own copy, skipping", entry.id);
            }
            Classification::SkipAddressedElsewhere => {
                tracing::debug!("{} addressed to '{}', skipping", entry.id, entry.to);
            }
            Classification::SkipNotAllowed => {
                tracing::warn!(
                    "{} from '{}' not on the allow-list, skipping",
                    entry.id,
                    entry.from
                );
            }
            Classification::Ping { token } => {
                let pong = format!("PONG-{}", token);
                match store::send_message(
                    self.log.as_ref(),
                    &self.me,
                    &pong,
                    &entry.from,
                    MessageKind::Text,
                    None,
                )
                .await
                {
                    Ok(id) => tracing::info!("Answered {} with {} as {}", entry.id, pong, id),
                    Err(e) => tracing::warn!("Pong for {} failed: {}", entry.id, e),
                }
            }
            Classification::Slowpath => {
                let window = build_window(
                    self.recent.make_contiguous(),
                    self.context_entries,
                    self.context_entry_cap,
                    self.context_budget,
                );
                let text =
                    envelope::render_dispatch(&entry.id, &entry.from, &entry.content, &window);

                match self.handler.dispatch(entry, &text).await {
                    Ok(()) => tracing::info!(
                        "Dispatched {} from {} via {}",
                        entry.id,
                        entry.from,
                        self.handler.name()
                    ),
                    Err(e) => tracing::warn!("Dispatch of {} failed: {}", entry.id, e),
                }
            }
        }

        self.recent.push_back(entry.clone());
        while self.recent.len() > self.context_entries {
            self.recent.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::protocol::state::HandledState;
    use crate::protocol::Envelope;
    use crate::store::testing::MemoryMailbox;
    use crate::worker::WorkerError;
    use tempfile::TempDir;

    fn entry(id: &str, from: &str, to: &str, content: &str) -> MessageEntry {
        MessageEntry {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            content: content.to_string(),
            timestamp: 1,
            kind: MessageKind::Text,
        }
    }

    fn allowed() -> Vec<String> {
        vec!["boss".to_string(), "cortana".to_string()]
    }

    #[derive(Default)]
    struct RecordingHandler {
        dispatched: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl SlowpathHandler for RecordingHandler {
        fn name(&self) -> &str {
            "recording"
        }

        async fn dispatch(&self, entry: &MessageEntry, envelope_text: &str) -> Result<()> {
            self.dispatched
                .lock()
                .unwrap()
                .push((entry.id.clone(), envelope_text.to_string()));
            Ok(())
        }
    }

    fn consumer(
        log: Arc<MemoryMailbox>,
        handler: Arc<dyn SlowpathHandler>,
        checkpoint_path: PathBuf,
    ) -> Consumer {
        let settings = Settings::default();
        Consumer::new(&settings, log, handler, checkpoint_path)
    }

    #[test]
    fn test_classification_rules_in_order() {
        let me = "serina";
        assert_eq!(
            classify(&entry("1-0", "serina", "boss", "hi"), me, &allowed()),
            Classification::SkipSelf
        );
        assert_eq!(
            classify(&entry("2-0", "boss", "cortana", "hi"), me, &allowed()),
            Classification::SkipAddressedElsewhere
        );
        assert_eq!(
            classify(&entry("3-0", "mystery", "serina", "hi"), me, &allowed()),
            Classification::SkipNotAllowed
        );
        assert_eq!(
            classify(&entry("4-0", "boss", "serina", "ping-Abc123"), me, &allowed()),
            Classification::Ping {
                token: "Abc123".to_string()
            }
        );
        assert_eq!(
            classify(&entry("5-0", "boss", "serina", "real question"), me, &allowed()),
            Classification::Slowpath
        );
        // Empty `to` means the mailbox owner.
        assert_eq!(
            classify(&entry("6-0", "boss", "", "real question"), me, &allowed()),
            Classification::Slowpath
        );
    }

    #[tokio::test]
    async fn test_ping_fastpath_answers_without_slowpath() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(MemoryMailbox::new());
        let handler = Arc::new(RecordingHandler::default());

        log.push("serina:messages", "boss", "serina", "PING-tok42", 10);

        let mut consumer = consumer(log.clone(), handler.clone(), dir.path().join("cp.json"));
        consumer.cycle().await.unwrap();

        let boss = log.entries("boss:messages");
        assert_eq!(boss.len(), 1);
        assert_eq!(boss[0].content, "PONG-tok42");
        assert_eq!(boss[0].from, "serina");
        assert!(handler.dispatched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_skipped_entries_still_advance_checkpoint() {
        let dir = TempDir::new().unwrap();
        let cp = dir.path().join("cp.json");
        let log = Arc::new(MemoryMailbox::new());
        let handler = Arc::new(RecordingHandler::default());

        log.push("serina:messages", "serina", "boss", "own copy", 10);
        log.push("serina:messages", "stranger", "serina", "spam", 11);
        let last = log.push("serina:messages", "boss", "cortana", "not for us", 12);

        let mut consumer = consumer(log.clone(), handler.clone(), cp.clone());
        consumer.cycle().await.unwrap();

        assert!(handler.dispatched.lock().unwrap().is_empty());
        assert_eq!(checkpoint::load(&cp), last);

        // A second cycle re-reads nothing.
        consumer.cycle().await.unwrap();
        assert!(handler.dispatched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slowpath_envelope_carries_entry_id_and_context() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(MemoryMailbox::new());
        let handler = Arc::new(RecordingHandler::default());

        log.push("serina:messages", "boss", "serina", "earlier note", 10);
        let id = log.push("serina:messages", "boss", "serina", "now the question", 11);

        let mut consumer = consumer(log.clone(), handler.clone(), dir.path().join("cp.json"));
        consumer.cycle().await.unwrap();

        let dispatched = handler.dispatched.lock().unwrap();
        // "earlier note" is itself a slowpath entry; the question follows it.
        assert_eq!(dispatched.len(), 2);
        let (entry_id, text) = &dispatched[1];
        assert_eq!(entry_id, &id);

        let env = Envelope::parse(text);
        assert_eq!(env.req_id.as_deref(), Some(id.as_str()));
        assert_eq!(env.reply_to.as_deref(), Some("boss"));
        assert_eq!(env.reply_stream.as_deref(), Some("boss:messages"));
        assert!(text.contains("earlier note"));
    }

    struct CannedResponder {
        reply: std::result::Result<String, ()>,
    }

    #[async_trait]
    impl Responder for CannedResponder {
        fn name(&self) -> &str {
            "canned"
        }

        async fn generate(
            &self,
            _prompt: &str,
            _correlation_key: &str,
        ) -> std::result::Result<String, WorkerError> {
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(()) => Err(WorkerError::Timeout(60)),
            }
        }
    }

    #[tokio::test]
    async fn test_inline_end_to_end_boss_to_serina() {
        let dir = TempDir::new().unwrap();
        let state_path = dir.path().join("handled.json");
        let log = Arc::new(MemoryMailbox::new());

        let responder = Arc::new(CannedResponder {
            reply: Ok("the build is green".to_string()),
        });
        let wake = WakeClient::new(&Settings::default().worker);
        let handler = Arc::new(InlineResponder::new(
            responder,
            wake,
            log.clone(),
            "serina",
            "boss",
            state_path.clone(),
        ));

        let id = store::send_message(
            log.as_ref(),
            "boss",
            "how is the build?",
            "serina",
            MessageKind::Text,
            None,
        )
        .await
        .unwrap();

        let mut consumer = consumer(log.clone(), handler, dir.path().join("cp.json"));
        consumer.cycle().await.unwrap();

        let boss = log.entries("boss:messages");
        assert_eq!(boss.len(), 1);
        assert_eq!(boss[0].content, "the build is green");
        assert_eq!(boss[0].from, "serina");
        assert!(HandledState::load(&state_path).is_handled(&id));

        // Re-running the cycle never duplicates the reply.
        consumer.cycle().await.unwrap();
        assert_eq!(log.entries("boss:messages").len(), 1);
    }

    #[tokio::test]
    async fn test_inline_worker_failure_advances_checkpoint() {
        let dir = TempDir::new().unwrap();
        let cp = dir.path().join("cp.json");
        let log = Arc::new(MemoryMailbox::new());

        let responder = Arc::new(CannedResponder { reply: Err(()) });
        let wake = WakeClient::new(&Settings::default().worker);
        let handler = Arc::new(InlineResponder::new(
            responder,
            wake,
            log.clone(),
            "serina",
            "boss",
            dir.path().join("handled.json"),
        ));

        let id = log.push("serina:messages", "boss", "serina", "doomed request", 10);

        let mut consumer = consumer(log.clone(), handler, cp.clone());
        consumer.cycle().await.unwrap();

        // No reply was written, but the entry is not retried forever.
        assert!(log.entries("boss:messages").is_empty());
        assert_eq!(checkpoint::load(&cp), id);
    }
}
