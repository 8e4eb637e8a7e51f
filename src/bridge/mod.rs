//! Event-stream bridge: subscribe to the hub's SSE feed, compose a reply
//! per inbound event and post exactly one correlated reply back.

use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::BridgeSettings;
use crate::error::{Error, Result};
use crate::worker::Responder;

/// Reconnect delay: floor, doubling per consecutive failure, capped, reset
/// on a successful connect.
#[derive(Debug)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor_ms: u64, ceiling_ms: u64) -> Self {
        let floor = Duration::from_millis(floor_ms);
        Self {
            floor,
            ceiling: Duration::from_millis(ceiling_ms),
            current: floor,
        }
    }

    /// Delay to wait now; doubles the next one.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

/// One decoded SSE event: the `id:` field and the concatenated `data:`
/// lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub data: String,
}

/// Incremental SSE decoder over arbitrary byte chunks. Events end on a
/// blank line; `id:` and `data:` fields accumulate until then. Bytes stay
/// raw until a full line is available, so a multi-byte character split
/// across chunks is never mangled.
#[derive(Debug, Default)]
pub struct EventDecoder {
    buffer: Vec<u8>,
    id: Option<String>,
    data: Vec<String>,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(SseEvent {
                        id: self.id.take(),
                        data: self.data.join("\n"),
                    });
                    self.data.clear();
                } else {
                    self.id = None;
                }
                continue;
            }

            if let Some(value) = line.strip_prefix("id:") {
                self.id = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.trim_start().to_string());
            }
            // Comments (`:`) and unknown fields fall through.
        }
        events
    }
}

/// Hub event payload carried in the SSE `data:` field. The hub names the
/// body `content`; `text` is accepted from older feeds.
#[derive(Debug, Clone, Deserialize)]
pub struct HubEvent {
    #[serde(alias = "event_id")]
    pub id: String,
    pub room_id: String,
    pub from: String,
    #[serde(alias = "text")]
    pub content: String,
    #[serde(default)]
    pub is_reply: bool,
}

/// Reply posted back to the hub. On failure `error` carries the stable
/// code and `text` the bounded message.
#[derive(Debug, Serialize)]
struct HubReply<'a> {
    event_id: &'a str,
    room_id: &'a str,
    text: &'a str,
    status: &'a str,
    latency_ms: u64,
    truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    orig_len: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Clamp event text for the worker prompt. Returns the prompt, whether it
/// was clamped and the original character length.
pub fn clamp_event_text(text: &str, threshold: usize) -> (String, bool, usize) {
    let orig_len = text.chars().count();
    if orig_len <= threshold {
        return (text.to_string(), false, orig_len);
    }
    let kept: String = text.chars().take(threshold).collect();
    (
        format!("{}\n[TRUNCATED orig_len={} kept={}]", kept, orig_len, threshold),
        true,
        orig_len,
    )
}

enum EndReason {
    Aborted,
    StreamEnded,
}

pub struct Bridge {
    agent: String,
    cfg: BridgeSettings,
    responder: std::sync::Arc<dyn Responder>,
    client: reqwest::Client,
    /// Last fully handled event id, resumed across reconnects.
    cursor: Option<String>,
}

impl Bridge {
    pub fn new(
        agent: &str,
        cfg: BridgeSettings,
        responder: std::sync::Arc<dyn Responder>,
    ) -> Self {
        Self {
            agent: agent.to_string(),
            cfg,
            responder,
            client: reqwest::Client::new(),
            cursor: None,
        }
    }

    /// Subscribe, handle events and reconnect with backoff until cancelled.
    pub async fn run(&mut self, cancel: CancellationToken) {
        let mut backoff = Backoff::new(
            self.cfg.reconnect_floor_ms,
            self.cfg.reconnect_ceiling_ms,
        );
        tracing::info!("Bridge for {} connecting to {}", self.agent, self.cfg.hub_url);

        loop {
            match self.connect_once(&cancel, &mut backoff).await {
                Ok(EndReason::Aborted) => {
                    tracing::info!("Bridge for {} stopping", self.agent);
                    return;
                }
                Ok(EndReason::StreamEnded) => {
                    tracing::info!("Hub closed the event stream, reconnecting");
                }
                Err(e) => {
                    tracing::warn!("Event stream failed: {}", e);
                }
            }

            let delay = backoff.next();
            tracing::debug!("Reconnecting in {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn connect_once(
        &mut self,
        cancel: &CancellationToken,
        backoff: &mut Backoff,
    ) -> Result<EndReason> {
        let mut url = format!("{}/v1/events?to={}", self.cfg.hub_url, self.agent);
        if let Some(cursor) = &self.cursor {
            url.push_str(&format!("&last_event_id={}", cursor));
        }

        let response = self
            .client
            .get(&url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| Error::Bridge(format!("connect {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::Bridge(format!(
                "hub returned {} for {}",
                response.status(),
                url
            )));
        }

        tracing::info!("Subscribed to hub events (cursor={:?})", self.cursor);
        backoff.reset();

        let mut stream = response.bytes_stream();
        let mut decoder = EventDecoder::new();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Ok(EndReason::Aborted),
                chunk = stream.next() => chunk,
            };

            let bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => return Err(Error::Bridge(format!("stream read: {}", e))),
                None => return Ok(EndReason::StreamEnded),
            };

            for event in decoder.feed(&bytes) {
                let parsed: HubEvent = match serde_json::from_str(&event.data) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        tracing::warn!("Unparseable hub event, skipping: {}", e);
                        continue;
                    }
                };
                self.handle_event(&parsed).await;
                // Cursor moves only once the event is fully handled, so a
                // reconnect replays anything in flight.
                self.cursor = Some(event.id.unwrap_or(parsed.id));
            }
        }
    }

    async fn handle_event(&self, event: &HubEvent) {
        if event.from == self.agent || event.is_reply {
            tracing::debug!("Skipping event {} (own or reply)", event.id);
            return;
        }

        let (prompt, truncated, orig_len) =
            clamp_event_text(&event.content, self.cfg.long_text_threshold);
        let session = format!("hub:{}:{}", event.room_id, event.from);

        let started = Instant::now();
        let outcome = self.responder.generate(&prompt, &session).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (text, error): (String, Option<String>) = match outcome {
            Ok(text) => (text, None),
            Err(e) => {
                tracing::warn!("Worker failed for event {}: {}", event.id, e);
                (e.to_string().chars().take(200).collect(), Some(e.code()))
            }
        };

        let reply = HubReply {
            event_id: &event.id,
            room_id: &event.room_id,
            text: &text,
            status: if error.is_none() { "ok" } else { "error" },
            latency_ms,
            truncated,
            orig_len: truncated.then_some(orig_len),
            error,
        };

        self.post_reply(&reply).await;
    }

    /// Exactly one reply per event, success or not. A failed post is only
    /// logged; the hub tolerates a missing reply better than a duplicate.
    async fn post_reply(&self, reply: &HubReply<'_>) {
        let url = format!("{}/v1/replies", self.cfg.hub_url);
        match self.client.post(&url).json(reply).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(
                    "Reply for {} posted ({}, {} ms)",
                    reply.event_id,
                    reply.status,
                    reply.latency_ms
                );
            }
            Ok(resp) => {
                tracing::warn!("Hub refused reply for {}: {}", reply.event_id, resp.status());
            }
            Err(e) => {
                tracing::warn!("Reply post for {} failed: {}", reply.event_id, e);
            }
        }
    }
}
