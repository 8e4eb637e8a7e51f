//! External worker boundary: the thing that actually composes a reply.
//!
//! The relay calls it as an opaque `generate(prompt, correlation_key)` with
//! a caller-imposed timeout. Failures carry a stable string code so every
//! downstream surface (bridge replies, logs) classifies them the same way.

pub mod agent_cli;
pub mod gateway;
pub mod wake;

use async_trait::async_trait;
use thiserror::Error;

pub use agent_cli::AgentCliResponder;
pub use gateway::GatewayResponder;
pub use wake::WakeClient;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker timed out after {0}s")]
    Timeout(u64),

    #[error("worker returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("worker response is not valid JSON")]
    InvalidJson,

    #[error("{0}")]
    Fetch(String),
}

impl WorkerError {
    /// Stable error code used in bridge replies and error breadcrumbs.
    pub fn code(&self) -> String {
        match self {
            WorkerError::Timeout(secs) => format!("gateway_timeout_{}s", secs),
            WorkerError::Http { status, .. } => format!("http_{}", status),
            WorkerError::InvalidJson => "invalid_json".to_string(),
            WorkerError::Fetch(_) => "fetch_error".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Reply generator boundary.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Responder name for logs.
    fn name(&self) -> &str;

    /// Compose a reply for `prompt`. `correlation_key` groups related
    /// requests into one session on the worker side.
    async fn generate(&self, prompt: &str, correlation_key: &str) -> Result<String>;
}
