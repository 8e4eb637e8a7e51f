//! tinyrelay library root.

pub mod bridge;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod relay;
pub mod store;
pub mod tunnel;
pub mod web;
pub mod worker;

pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use error::{Error, Result};
pub use protocol::{MessageEntry, MessageKind};
pub use store::MailboxLog;
pub use tunnel::Tunnel;
pub use web::run_web_server;
