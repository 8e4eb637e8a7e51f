//! Fire-and-forget wake/dispatch interface to the local agent session.
//!
//! Carries a dispatch envelope (or a fallback notice) to the gateway's
//! wake hook. The relay never awaits an answer here; the outcome is only
//! logged.

use std::time::Duration;

use reqwest::Client;
use serde_json::json;

use crate::config::WorkerSettings;

const WAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct WakeClient {
    client: Client,
    url: String,
    token: String,
}

impl WakeClient {
    pub fn new(cfg: &WorkerSettings) -> Self {
        Self {
            client: Client::new(),
            url: format!("http://127.0.0.1:{}/hooks/wake", cfg.gateway_port),
            token: cfg.wake_token.clone(),
        }
    }

    /// Whether a wake token is configured at all.
    pub fn is_configured(&self) -> bool {
        !self.token.is_empty()
    }

    /// Deliver `text` to the wake hook. Returns whether the hook accepted
    /// it; failures are logged, never propagated.
    pub async fn wake(&self, text: &str) -> bool {
        if !self.is_configured() {
            return false;
        }

        let body = json!({ "text": text, "mode": "now" });
        let send = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&body)
            .timeout(WAKE_TIMEOUT)
            .send();

        match send.await {
            Ok(resp) => {
                let ok = resp.status() == reqwest::StatusCode::OK;
                if ok {
                    tracing::debug!("Wake accepted ({} chars)", text.len());
                } else {
                    tracing::warn!("Wake hook returned {}", resp.status());
                }
                ok
            }
            Err(e) => {
                tracing::warn!("Wake hook error: {}", e);
                false
            }
        }
    }
}
