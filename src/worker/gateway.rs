//! HTTP gateway responder: chat-completions call against the local agent
//! gateway under a hard timeout.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{Responder, Result, WorkerError};
use crate::config::WorkerSettings;

pub struct GatewayResponder {
    client: Client,
    url: String,
    token: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    user: &'a str,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

impl GatewayResponder {
    pub fn new(cfg: &WorkerSettings) -> Self {
        Self {
            client: Client::new(),
            url: format!(
                "http://127.0.0.1:{}/v1/chat/completions",
                cfg.gateway_port
            ),
            token: cfg.gateway_token.clone(),
            timeout: Duration::from_secs(cfg.gateway_timeout_secs),
        }
    }
}

#[async_trait]
impl Responder for GatewayResponder {
    fn name(&self) -> &str {
        "gateway"
    }

    async fn generate(&self, prompt: &str, correlation_key: &str) -> Result<String> {
        let request = ChatRequest {
            model: "default",
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            stream: false,
            user: correlation_key,
        };

        let mut builder = self.client.post(&self.url).json(&request);
        if !self.token.is_empty() {
            builder = builder.bearer_auth(&self.token);
        }

        let response = tokio::time::timeout(self.timeout, builder.send())
            .await
            .map_err(|_| WorkerError::Timeout(self.timeout.as_secs()))?
            .map_err(|e| WorkerError::Fetch(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let mut body: String = body.chars().take(200).collect();
            if body.is_empty() {
                body = "(no body)".to_string();
            }
            return Err(WorkerError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|_| WorkerError::InvalidJson)?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| "(no reply)".to_string()))
    }
}
