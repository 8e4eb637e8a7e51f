//! Web read/write API (Axum).

pub mod api;
pub mod router;
pub mod server;

use std::sync::Arc;

use crate::config::Settings;
use crate::store::MailboxLog;

pub use server::run_web_server;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub log: Arc<dyn MailboxLog>,
    pub settings: Arc<Settings>,
}
