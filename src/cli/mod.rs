//! CLI commands for tinyrelay using clap.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::bridge::Bridge;
use crate::config::{load_settings, Settings};
use crate::protocol::reply::{self, ReplyFailure, ReplyOutcome};
use crate::protocol::types::{stream_name, MessageKind};
use crate::relay::{Consumer, InlineResponder, SlowpathHandler, WakeDispatcher};
use crate::store::{self, checkpoint, merge_entries, MailboxLog, RedisMailbox};
use crate::tunnel::Tunnel;
use crate::web::{run_web_server, AppState};
use crate::worker::{AgentCliResponder, GatewayResponder, Responder, WakeClient};

/// tinyrelay - durable mailbox relay between agents.
#[derive(Parser)]
#[command(name = "tinyrelay")]
#[command(version = "0.1.0")]
#[command(about = "Durable per-agent mailbox relay daemon", long_about = None)]
pub struct Commands {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the relay daemon (tunnel + consumer loop, bridge if enabled)
    Daemon,

    /// Run the event-stream bridge alone
    Bridge,

    /// Write a composed reply back through the idempotent reply protocol
    Reply {
        /// File holding the dispatch envelope; stdin when omitted
        #[arg(long)]
        wake_file: Option<PathBuf>,

        /// Override the idempotency state file
        #[arg(long)]
        state_file: Option<PathBuf>,

        /// Reply text to deliver
        #[arg(long)]
        reply: Option<String>,

        /// Validate the envelope without writing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Send a message to one or more agents
    Send {
        /// Recipient token, or a comma list
        to: String,

        /// Message text
        #[arg(required = true)]
        message: Vec<String>,
    },

    /// Read own mailbox entries after a cursor
    Read {
        /// Entry id to read after (default: the consumer checkpoint)
        #[arg(long)]
        from: Option<String>,
    },

    /// Show recent conversation history across mailboxes
    History {
        /// Number of entries to show
        #[arg(short = 'n', long = "limit", default_value_t = 50)]
        limit: usize,
    },

    /// Tunnel operations
    Tunnel {
        #[command(subcommand)]
        action: TunnelCommand,
    },

    /// Run the web read/write API
    Web {
        /// Port override
        #[arg(long)]
        port: Option<u16>,
    },

    /// Check tunnel, store and peer liveness
    Check,
}

#[derive(Subcommand)]
pub enum TunnelCommand {
    Start,
    Stop,
    Status,
}

impl Commands {
    pub async fn run(&self) -> Result<ExitCode> {
        match &self.command {
            Command::Daemon => run_daemon().await,
            Command::Bridge => run_bridge().await,
            Command::Reply {
                wake_file,
                state_file,
                reply,
                dry_run,
            } => run_reply(wake_file.as_deref(), state_file.clone(), reply.as_deref(), *dry_run)
                .await,
            Command::Send { to, message } => run_send(to, &message.join(" ")).await,
            Command::Read { from } => run_read(from.as_deref()).await,
            Command::History { limit } => run_history(*limit).await,
            Command::Tunnel { action } => run_tunnel(action).await,
            Command::Web { port } => run_web(*port).await,
            Command::Check => run_check().await,
        }
    }
}

fn open_store(settings: &Settings) -> Result<(Arc<Tunnel>, Arc<RedisMailbox>)> {
    let tunnel = Arc::new(Tunnel::new(settings.transport.clone()));
    let log = Arc::new(RedisMailbox::new(&settings.store, tunnel.clone())?);
    Ok((tunnel, log))
}

fn build_responder(settings: &Settings) -> Result<Arc<dyn Responder>> {
    match settings.worker.mode.as_str() {
        "cli" => {
            let responder = AgentCliResponder::new(&settings.worker)
                .ok_or_else(|| anyhow!("worker.mode is 'cli' but worker.agent_bin is not set"))?;
            Ok(Arc::new(responder))
        }
        _ => Ok(Arc::new(GatewayResponder::new(&settings.worker))),
    }
}

fn build_handler(
    settings: &Settings,
    log: Arc<dyn MailboxLog>,
) -> Result<Arc<dyn SlowpathHandler>> {
    let wake = WakeClient::new(&settings.worker);
    match settings.worker.mode.as_str() {
        "wake" => Ok(Arc::new(WakeDispatcher::new(wake))),
        "gateway" | "cli" => {
            let responder = build_responder(settings)?;
            Ok(Arc::new(InlineResponder::new(
                responder,
                wake,
                log,
                &settings.identity.agent,
                &settings.identity.default_peer,
                settings.handled_state_path()?,
            )))
        }
        other => Err(anyhow!("unknown worker.mode '{}'", other)),
    }
}

async fn run_daemon() -> Result<ExitCode> {
    let settings = load_settings()?;
    let (tunnel, log) = open_store(&settings)?;

    // Bring the tunnel up front; the consumer retries on its own afterward.
    match tunnel.ensure_ready(false).await {
        Ok(true) => {}
        Ok(false) => tracing::warn!("Tunnel not ready at startup, will keep retrying"),
        Err(e) => tracing::warn!("Tunnel startup failed: {}", e),
    }

    let handler = build_handler(&settings, log.clone())?;
    let mut consumer = Consumer::new(
        &settings,
        log.clone(),
        handler,
        settings.checkpoint_path()?,
    );

    let cancel = CancellationToken::new();

    let consumer_cancel = cancel.clone();
    let consumer_task = tokio::spawn(async move {
        consumer.run(consumer_cancel).await;
    });

    let bridge_task = if settings.bridge.enabled {
        let responder = build_responder(&settings)?;
        let mut bridge = Bridge::new(
            &settings.identity.agent,
            settings.bridge.clone(),
            responder,
        );
        let bridge_cancel = cancel.clone();
        Some(tokio::spawn(async move {
            bridge.run(bridge_cancel).await;
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    cancel.cancel();

    consumer_task.await?;
    if let Some(task) = bridge_task {
        task.await?;
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_bridge() -> Result<ExitCode> {
    let settings = load_settings()?;
    let responder = build_responder(&settings)?;
    let mut bridge = Bridge::new(
        &settings.identity.agent,
        settings.bridge.clone(),
        responder,
    );

    let cancel = CancellationToken::new();
    let bridge_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        bridge.run(bridge_cancel).await;
    });

    tokio::signal::ctrl_c().await?;
    cancel.cancel();
    task.await?;
    Ok(ExitCode::SUCCESS)
}

async fn run_reply(
    wake_file: Option<&std::path::Path>,
    state_file: Option<PathBuf>,
    reply: Option<&str>,
    dry_run: bool,
) -> Result<ExitCode> {
    let settings = load_settings()?;

    let text = match wake_file {
        Some(path) => std::fs::read_to_string(path)?,
        None => std::io::read_to_string(std::io::stdin())?,
    };

    let (_tunnel, log) = open_store(&settings)?;
    let state_path = match state_file {
        Some(path) => path,
        None => settings.handled_state_path()?,
    };

    // A missing --reply without --dry-run goes through the protocol too,
    // so the requester still gets a visible error record.
    match reply::handle(
        log.as_ref(),
        &settings.identity.agent,
        &settings.identity.default_peer,
        &text,
        reply,
        dry_run,
        &state_path,
    )
    .await
    {
        Ok(ReplyOutcome::Sent { msg_id }) => {
            println!("Reply written as {}", msg_id);
            Ok(ExitCode::SUCCESS)
        }
        Ok(ReplyOutcome::AlreadyHandled) => {
            println!("Request already handled, nothing written");
            Ok(ExitCode::SUCCESS)
        }
        Ok(ReplyOutcome::DryRun) => {
            println!("Envelope OK (dry run)");
            Ok(ExitCode::SUCCESS)
        }
        Err(ReplyFailure::Rejected(msg)) => {
            eprintln!("Rejected: {}", msg);
            Ok(ExitCode::from(2))
        }
        Err(ReplyFailure::WriteBack(msg)) => {
            eprintln!("Write-back failed: {}", msg);
            Ok(ExitCode::from(1))
        }
    }
}

async fn run_send(to: &str, message: &str) -> Result<ExitCode> {
    let settings = load_settings()?;
    let (_tunnel, log) = open_store(&settings)?;

    let id = store::send_message(
        log.as_ref(),
        &settings.identity.agent,
        message,
        to,
        MessageKind::Text,
        None,
    )
    .await?;
    println!("Sent as {}", id);
    Ok(ExitCode::SUCCESS)
}

async fn run_read(from: Option<&str>) -> Result<ExitCode> {
    let settings = load_settings()?;
    let (_tunnel, log) = open_store(&settings)?;

    let cursor = match from {
        Some(cursor) => cursor.to_string(),
        None => checkpoint::load(&settings.checkpoint_path()?),
    };
    let mailbox = stream_name(&settings.identity.agent);
    let entries = log.read_from(&mailbox, &cursor, 100).await?;

    if entries.is_empty() {
        println!("No entries after {}", cursor);
        return Ok(ExitCode::SUCCESS);
    }
    for entry in entries {
        print_entry(&entry);
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_history(limit: usize) -> Result<ExitCode> {
    let settings = load_settings()?;
    let (_tunnel, log) = open_store(&settings)?;
    let me = &settings.identity.agent;

    let mut gathered = Vec::new();
    for agent in &settings.relay.agents {
        gathered.extend(log.read_range(&stream_name(agent), limit).await?);
    }

    let merged: Vec<_> = merge_entries(gathered)
        .into_iter()
        .filter(|e| e.from == *me || e.is_addressed_to(me))
        .collect();
    let start = merged.len().saturating_sub(limit);
    for entry in &merged[start..] {
        print_entry(entry);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_entry(entry: &crate::protocol::MessageEntry) {
    let when = chrono::DateTime::from_timestamp_millis(entry.timestamp)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| entry.timestamp.to_string());
    println!(
        "[{}] {} -> {}: {}",
        when,
        entry.from,
        if entry.to.is_empty() { "(inbox)" } else { &entry.to },
        entry.content
    );
}

async fn run_tunnel(action: &TunnelCommand) -> Result<ExitCode> {
    // Tunnel operations only need transport settings; fall back to defaults
    // so `tunnel stop`/`status` work before settings exist.
    let settings = crate::config::load_settings_or_default();
    let tunnel = Tunnel::new(settings.transport.clone());

    match action {
        TunnelCommand::Start => {
            if tunnel.ensure_ready(false).await? {
                println!("Tunnel up: {}", tunnel.status().await);
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("Tunnel did not come up");
                Ok(ExitCode::FAILURE)
            }
        }
        TunnelCommand::Stop => {
            tunnel.stop();
            println!("Tunnel stopped");
            Ok(ExitCode::SUCCESS)
        }
        TunnelCommand::Status => {
            println!("{}", tunnel.status().await);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_web(port: Option<u16>) -> Result<ExitCode> {
    let settings = load_settings()?;
    let (_tunnel, log) = open_store(&settings)?;
    let port = port.unwrap_or(settings.web.port);

    let state = AppState {
        log,
        settings: Arc::new(settings),
    };
    run_web_server(port, state)
        .await
        .map_err(|e| anyhow!("web server failed: {}", e))?;
    Ok(ExitCode::SUCCESS)
}

async fn run_check() -> Result<ExitCode> {
    let settings = load_settings()?;
    let (tunnel, log) = open_store(&settings)?;

    println!("tunnel: {}", tunnel.status().await);

    match log.ping().await {
        Ok(true) => println!("store: ok"),
        Ok(false) => println!("store: unexpected ping reply"),
        Err(e) => {
            println!("store: unreachable ({})", e);
            return Ok(ExitCode::FAILURE);
        }
    }

    for agent in &settings.relay.agents {
        if agent == &settings.identity.agent {
            continue;
        }
        match log.peer_heartbeat_age(agent).await {
            Ok(Some(age_ms)) => println!("{}: seen {}s ago", agent, age_ms / 1000),
            Ok(None) => println!("{}: no heartbeat", agent),
            Err(e) => println!("{}: check failed ({})", agent, e),
        }
    }
    Ok(ExitCode::SUCCESS)
}
