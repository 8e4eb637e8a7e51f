//! Redis-streams implementation of the mailbox log, reached through the
//! SSH tunnel. All calls require the transport to be ready first; a dead
//! tunnel surfaces as a transport error, never as an empty read.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

use crate::config::StoreSettings;
use crate::error::{Error, Result};
use crate::protocol::types::{now_millis, MessageEntry, MessageKind};
use crate::tunnel::Tunnel;

/// Seconds before an agent's liveness key expires.
const HEARTBEAT_TTL_SECS: u64 = 120;

pub struct RedisMailbox {
    client: redis::Client,
    tunnel: Arc<Tunnel>,
    connect_timeout: Duration,
}

impl RedisMailbox {
    /// Build a client talking to the store through the tunnel's local port.
    pub fn new(cfg: &StoreSettings, tunnel: Arc<Tunnel>) -> Result<Self> {
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(cfg.host.clone(), tunnel.local_port()),
            redis: redis::RedisConnectionInfo {
                db: 0,
                username: if cfg.username.is_empty() {
                    None
                } else {
                    Some(cfg.username.clone())
                },
                password: if cfg.password.is_empty() {
                    None
                } else {
                    Some(cfg.password.clone())
                },
                protocol: redis::ProtocolVersion::RESP2,
            },
        };
        Ok(Self {
            client: redis::Client::open(info)?,
            tunnel,
            connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
        })
    }

    /// Ensure the tunnel is up and open a connection.
    async fn conn(&self) -> Result<MultiplexedConnection> {
        if !self.tunnel.ensure_ready(false).await? {
            return Err(Error::Transport("tunnel is not ready".to_string()));
        }
        let connect = self.client.get_multiplexed_async_connection();
        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(Error::Store(e)),
            Err(_) => Err(Error::Transport(format!(
                "store connect timed out after {:?}",
                self.connect_timeout
            ))),
        }
    }

    /// Store round-trip check.
    pub async fn ping(&self) -> Result<bool> {
        let mut conn = self.conn().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(pong == "PONG")
    }

    /// Age of another agent's liveness key in milliseconds, if present.
    pub async fn peer_heartbeat_age(&self, agent: &str) -> Result<Option<i64>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.get(format!("{}:heartbeat", agent)).await?;
        Ok(value
            .and_then(|v| v.parse::<i64>().ok())
            .map(|at| now_millis() - at))
    }
}

#[async_trait]
impl super::MailboxLog for RedisMailbox {
    async fn append(
        &self,
        mailbox: &str,
        from: &str,
        to: &str,
        content: &str,
        timestamp: i64,
        kind: MessageKind,
    ) -> Result<String> {
        let mut conn = self.conn().await?;
        let ts = timestamp.to_string();
        let fields = [
            ("from", from),
            ("to", to),
            ("content", content),
            ("timestamp", ts.as_str()),
            ("type", kind.as_str()),
        ];
        let id: String = conn.xadd(mailbox, "*", &fields).await?;
        tracing::debug!("Appended {} to {} (from={})", id, mailbox, from);
        Ok(id)
    }

    async fn read_from(
        &self,
        mailbox: &str,
        cursor: &str,
        max: usize,
    ) -> Result<Vec<MessageEntry>> {
        let mut conn = self.conn().await?;
        let opts = StreamReadOptions::default().count(max);
        let reply: StreamReadReply = conn.xread_options(&[mailbox], &[cursor], &opts).await?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for sid in key.ids {
                entries.push(decode_entry(&sid));
            }
        }
        Ok(entries)
    }

    async fn read_range(&self, mailbox: &str, max: usize) -> Result<Vec<MessageEntry>> {
        let mut conn = self.conn().await?;
        let reply: StreamRangeReply = conn.xrevrange_count(mailbox, "+", "-", max).await?;
        Ok(reply.ids.iter().map(decode_entry).collect())
    }

    async fn heartbeat(&self, agent: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .set_ex(
                format!("{}:heartbeat", agent),
                now_millis().to_string(),
                HEARTBEAT_TTL_SECS,
            )
            .await?;
        Ok(())
    }
}

fn decode_entry(sid: &StreamId) -> MessageEntry {
    MessageEntry {
        id: sid.id.clone(),
        from: sid
            .get::<String>("from")
            .unwrap_or_default()
            .trim()
            .to_lowercase(),
        to: sid.get::<String>("to").unwrap_or_default(),
        content: sid.get::<String>("content").unwrap_or_default(),
        timestamp: sid
            .get::<String>("timestamp")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        kind: MessageKind::parse(&sid.get::<String>("type").unwrap_or_default()),
    }
}
