//! API endpoints over the mailbox logs.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::AppState;
use crate::protocol::types::{stream_name, MessageEntry, MessageKind};
use crate::store::{self, merge_entries};

/// Message view served to the front end.
#[derive(Serialize)]
pub struct MessageView {
    pub id: String,
    pub from: String,
    pub to: String,
    pub content: String,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: String,
}

impl From<MessageEntry> for MessageView {
    fn from(entry: MessageEntry) -> Self {
        Self {
            id: entry.id,
            from: entry.from,
            to: entry.to,
            content: entry.content,
            timestamp: entry.timestamp,
            kind: entry.kind.as_str().to_string(),
        }
    }
}

/// Send request.
#[derive(Deserialize)]
pub struct SendRequest {
    pub content: String,
    /// `all` or a comma list of known agent tokens.
    pub target: String,
}

/// List recent messages across every known agent's mailbox, fan-out
/// duplicates removed, oldest first.
pub async fn list_messages(State(state): State<AppState>) -> impl IntoResponse {
    let limit = state.settings.web.history_limit;
    let mut gathered: Vec<MessageEntry> = Vec::new();

    for agent in &state.settings.relay.agents {
        match state.log.read_range(&stream_name(agent), limit).await {
            Ok(entries) => gathered.extend(entries),
            Err(e) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": e.to_string() })),
                )
                    .into_response();
            }
        }
    }

    let messages: Vec<MessageView> = merge_entries(gathered)
        .into_iter()
        .map(MessageView::from)
        .collect();
    Json(messages).into_response()
}

/// Append a message from the configured web sender to the targeted
/// mailboxes.
pub async fn send_message(
    State(state): State<AppState>,
    Json(payload): Json<SendRequest>,
) -> impl IntoResponse {
    if payload.content.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "content must not be empty" })),
        )
            .into_response();
    }

    let sender = &state.settings.web.sender;
    let to = match resolve_targets(&payload.target, &state.settings.relay.agents, sender) {
        Ok(to) => to,
        Err(msg) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response();
        }
    };

    match store::send_message(
        state.log.as_ref(),
        sender,
        payload.content.trim(),
        &to,
        MessageKind::Text,
        None,
    )
    .await
    {
        Ok(id) => Json(json!({ "ok": true, "id": id })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Expand `all` / validate a comma list against the known agents,
/// returning the comma-joined recipient list.
fn resolve_targets(target: &str, agents: &[String], sender: &str) -> Result<String, String> {
    if target.trim().eq_ignore_ascii_case("all") {
        let others: Vec<&str> = agents
            .iter()
            .map(String::as_str)
            .filter(|a| *a != sender)
            .collect();
        if others.is_empty() {
            return Err("no recipients besides the sender".to_string());
        }
        return Ok(others.join(", "));
    }

    let mut resolved: Vec<String> = Vec::new();
    for token in target.split(',') {
        let token = token.trim().to_lowercase();
        if token.is_empty() {
            continue;
        }
        if !agents.iter().any(|a| *a == token) {
            return Err(format!("unknown agent '{}'", token));
        }
        resolved.push(token);
    }
    if resolved.is_empty() {
        return Err("target must name at least one agent".to_string());
    }
    Ok(resolved.join(", "))
}
