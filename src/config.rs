//! Configuration loading for tinyrelay.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Get the tinyrelay home directory (~/.tinyrelay).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".tinyrelay"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Get the state directory used for checkpoints and handler state.
pub fn get_state_dir() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("memory"))
}

/// Load settings from ~/.tinyrelay/settings.json, then layer credentials
/// from the env file on top of any blank fields.
pub fn load_settings() -> Result<Settings> {
    let path = get_settings_path()?;

    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}. Create it before starting the relay.",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(&path)?;
    let mut settings: Settings = serde_json::from_str(&content)?;

    apply_env_credentials(&mut settings);
    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Load settings or return default if not found.
pub fn load_settings_or_default() -> Settings {
    load_settings().unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        let mut settings = Settings::default();
        apply_env_credentials(&mut settings);
        settings
    })
}

/// Layer secrets from ~/.tinyrelay/credentials/tinyrelay.env into blank
/// settings fields. Lines are KEY=VALUE; '#' starts a comment.
fn apply_env_credentials(settings: &mut Settings) {
    let Ok(home) = get_home_dir() else { return };
    let env_path = std::env::var("TINYRELAY_ENV_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home.join("credentials").join("tinyrelay.env"));

    let Ok(text) = std::fs::read_to_string(&env_path) else {
        return;
    };

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(idx) = line.find('=') else { continue };
        let key = line[..idx].trim();
        let value = line[idx + 1..].trim();
        match key {
            "REDIS_PASS" if settings.store.password.is_empty() => {
                settings.store.password = value.to_string();
            }
            "HOOKS_TOKEN" if settings.worker.wake_token.is_empty() => {
                settings.worker.wake_token = value.to_string();
            }
            "GATEWAY_TOKEN" if settings.worker.gateway_token.is_empty() => {
                settings.worker.gateway_token = value.to_string();
            }
            _ => {}
        }
    }
    tracing::debug!("Applied credentials from {}", env_path.display());
}

fn validate_settings(settings: &Settings) -> Result<()> {
    let agent = settings.identity.agent.trim();
    if agent.is_empty() {
        return Err(Error::Config("identity.agent must not be empty".to_string()));
    }
    if agent.chars().any(|c| c.is_uppercase() || c.is_whitespace()) {
        return Err(Error::Config(format!(
            "identity.agent '{}' must be a lowercase token",
            agent
        )));
    }
    for sender in &settings.relay.allowed_senders {
        if sender.trim().is_empty() {
            return Err(Error::Config(
                "relay.allowed_senders must not contain empty tokens".to_string(),
            ));
        }
    }
    if settings.bridge.reconnect_floor_ms == 0
        || settings.bridge.reconnect_ceiling_ms < settings.bridge.reconnect_floor_ms
    {
        return Err(Error::Config(
            "bridge.reconnect_floor_ms must be > 0 and <= reconnect_ceiling_ms".to_string(),
        ));
    }
    Ok(())
}

/// Agent identity.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Identity {
    /// This agent's lowercase token; owns `<agent>:messages`.
    #[serde(default = "default_agent")]
    pub agent: String,
    /// Fallback recipient for error breadcrumbs without a reply target.
    #[serde(default = "default_peer")]
    pub default_peer: String,
}

fn default_agent() -> String {
    "serina".to_string()
}

fn default_peer() -> String {
    "boss".to_string()
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            agent: default_agent(),
            default_peer: default_peer(),
        }
    }
}

/// SSH tunnel configuration for the secured transport.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TransportSettings {
    pub ssh_host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    /// Optional explicit SSH private key path.
    pub ssh_key_path: Option<PathBuf>,
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    /// Local connect probe timeout.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Settle time after spawning ssh before probing.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_local_port() -> u16 {
    16379
}

fn default_remote_port() -> u16 {
    6379
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("/tmp/tinyrelay-tunnel.pid")
}

fn default_connect_timeout_ms() -> u64 {
    1500
}

fn default_settle_ms() -> u64 {
    2000
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            ssh_host: String::new(),
            ssh_port: default_ssh_port(),
            ssh_user: default_ssh_user(),
            ssh_key_path: None,
            local_port: default_local_port(),
            remote_port: default_remote_port(),
            pid_file: default_pid_file(),
            connect_timeout_ms: default_connect_timeout_ms(),
            settle_ms: default_settle_ms(),
        }
    }
}

/// Durable log store connection settings (reached through the tunnel).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StoreSettings {
    #[serde(default = "default_store_host")]
    pub host: String,
    #[serde(default = "default_store_username")]
    pub username: String,
    /// Usually left blank here and supplied via the credentials env file.
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_store_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_store_host() -> String {
    "127.0.0.1".to_string()
}

fn default_store_username() -> String {
    "default".to_string()
}

fn default_store_connect_timeout_ms() -> u64 {
    5000
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            host: default_store_host(),
            username: default_store_username(),
            password: String::new(),
            connect_timeout_ms: default_store_connect_timeout_ms(),
        }
    }
}

/// Relay consumer loop settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RelaySettings {
    /// Senders allowed to trigger a reply.
    #[serde(default = "default_allowed_senders")]
    pub allowed_senders: Vec<String>,
    /// All known agent tokens (used by the web API and `all` fan-out).
    #[serde(default = "default_agents")]
    pub agents: Vec<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Most recent N preceding entries included in a dispatch envelope.
    #[serde(default = "default_context_entries")]
    pub context_entries: usize,
    /// Per-entry character cap before head+tail truncation.
    #[serde(default = "default_context_entry_cap")]
    pub context_entry_cap: usize,
    /// Total character budget for the whole context window.
    #[serde(default = "default_context_budget")]
    pub context_budget: usize,
}

fn default_allowed_senders() -> Vec<String> {
    vec!["boss".to_string(), "cortana".to_string(), "roland".to_string()]
}

fn default_agents() -> Vec<String> {
    vec![
        "boss".to_string(),
        "serina".to_string(),
        "cortana".to_string(),
        "roland".to_string(),
    ]
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_batch_size() -> usize {
    20
}

fn default_context_entries() -> usize {
    10
}

fn default_context_entry_cap() -> usize {
    400
}

fn default_context_budget() -> usize {
    2000
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            allowed_senders: default_allowed_senders(),
            agents: default_agents(),
            poll_interval_secs: default_poll_interval_secs(),
            batch_size: default_batch_size(),
            context_entries: default_context_entries(),
            context_entry_cap: default_context_entry_cap(),
            context_budget: default_context_budget(),
        }
    }
}

/// External worker boundary settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WorkerSettings {
    /// Slowpath policy: "wake" (dispatch only), "gateway" (inline HTTP),
    /// or "cli" (inline agent binary).
    #[serde(default = "default_worker_mode")]
    pub mode: String,
    #[serde(default = "default_gateway_port")]
    pub gateway_port: u16,
    #[serde(default)]
    pub gateway_token: String,
    #[serde(default = "default_gateway_timeout_secs")]
    pub gateway_timeout_secs: u64,
    /// Agent CLI binary for the "cli" mode.
    pub agent_bin: Option<PathBuf>,
    #[serde(default = "default_session_id")]
    pub session_id: String,
    #[serde(default)]
    pub wake_token: String,
}

fn default_worker_mode() -> String {
    "wake".to_string()
}

fn default_gateway_port() -> u16 {
    18789
}

fn default_gateway_timeout_secs() -> u64 {
    60
}

fn default_session_id() -> String {
    "tinyrelay-daemon".to_string()
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            mode: default_worker_mode(),
            gateway_port: default_gateway_port(),
            gateway_token: String::new(),
            gateway_timeout_secs: default_gateway_timeout_secs(),
            agent_bin: None,
            session_id: default_session_id(),
            wake_token: String::new(),
        }
    }
}

/// Event-stream bridge settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BridgeSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_hub_url")]
    pub hub_url: String,
    #[serde(default = "default_long_text_threshold")]
    pub long_text_threshold: usize,
    #[serde(default = "default_reconnect_floor_ms")]
    pub reconnect_floor_ms: u64,
    #[serde(default = "default_reconnect_ceiling_ms")]
    pub reconnect_ceiling_ms: u64,
}

fn default_hub_url() -> String {
    "http://127.0.0.1:9800".to_string()
}

fn default_long_text_threshold() -> usize {
    4000
}

fn default_reconnect_floor_ms() -> u64 {
    1000
}

fn default_reconnect_ceiling_ms() -> u64 {
    30000
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            hub_url: default_hub_url(),
            long_text_threshold: default_long_text_threshold(),
            reconnect_floor_ms: default_reconnect_floor_ms(),
            reconnect_ceiling_ms: default_reconnect_ceiling_ms(),
        }
    }
}

/// Read/write web API settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WebSettings {
    #[serde(default = "default_web_port")]
    pub port: u16,
    /// Sender token stamped on messages written through the API.
    #[serde(default = "default_web_sender")]
    pub sender: String,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_web_port() -> u16 {
    8888
}

fn default_web_sender() -> String {
    "boss".to_string()
}

fn default_history_limit() -> usize {
    50
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            port: default_web_port(),
            sender: default_web_sender(),
            history_limit: default_history_limit(),
        }
    }
}

/// tinyrelay settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub identity: Identity,

    #[serde(default)]
    pub transport: TransportSettings,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub relay: RelaySettings,

    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub bridge: BridgeSettings,

    #[serde(default)]
    pub web: WebSettings,
}

impl Settings {
    /// Checkpoint file for this agent's consumer.
    pub fn checkpoint_path(&self) -> Result<PathBuf> {
        Ok(get_state_dir()?.join(format!("relay-state-{}.json", self.identity.agent)))
    }

    /// Idempotency record file for the reply protocol.
    pub fn handled_state_path(&self) -> Result<PathBuf> {
        Ok(get_state_dir()?.join("hub-handler-state.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let settings = Settings::default();
        assert!(validate_settings(&settings).is_ok());
        assert_eq!(settings.identity.agent, "serina");
        assert_eq!(settings.relay.poll_interval_secs, 2);
    }

    #[test]
    fn test_rejects_uppercase_agent() {
        let mut settings = Settings::default();
        settings.identity.agent = "Serina".to_string();
        assert!(validate_settings(&settings).is_err());
    }

    #[test]
    fn test_rejects_bad_backoff_bounds() {
        let mut settings = Settings::default();
        settings.bridge.reconnect_ceiling_ms = 10;
        assert!(validate_settings(&settings).is_err());
    }
}
