//! Transport resilience manager: owns the secured SSH tunnel to the remote
//! log store, health-checks it, and rebuilds it when it goes stale.
//!
//! The pid file is the cross-process singleton: at most one live tunnel per
//! local port. In-process, a mutex serialises rebuilds so concurrent
//! callers observe a single rebuild in flight.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::config::TransportSettings;
use crate::error::{Error, Result};

/// Owned handle to the tunnel. Construct once and share by reference; there
/// is no ambient global.
pub struct Tunnel {
    cfg: TransportSettings,
    rebuild: Mutex<()>,
}

impl Tunnel {
    pub fn new(cfg: TransportSettings) -> Self {
        Self {
            cfg,
            rebuild: Mutex::new(()),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.cfg.local_port
    }

    /// Ensure the tunnel is up, rebuilding it if needed. Returns `false`
    /// when a rebuild was attempted and the re-probe still failed; never
    /// optimistically reports a tunnel it could not verify.
    pub async fn ensure_ready(&self, force_restart: bool) -> Result<bool> {
        if self.cfg.ssh_host.is_empty() {
            return Err(Error::Transport(
                "transport.ssh_host is not configured".to_string(),
            ));
        }

        if !force_restart && self.record_alive() {
            if self.probe().await {
                return Ok(true);
            }
            tracing::warn!(
                "Tunnel pid alive but local port {} not connectable, rebuilding",
                self.cfg.local_port
            );
        }

        let _guard = self.rebuild.lock().await;

        // A concurrent caller may have finished the rebuild while we waited.
        if !force_restart && self.record_alive() && self.probe().await {
            return Ok(true);
        }

        self.teardown();
        self.spawn_ssh()?;
        tokio::time::sleep(Duration::from_millis(self.cfg.settle_ms)).await;

        let Some(pid) = self.discover_pid() else {
            tracing::warn!("Tunnel rebuild failed: no ssh process found");
            return Ok(false);
        };

        if let Err(e) = std::fs::write(&self.cfg.pid_file, pid.to_string()) {
            tracing::warn!("Failed to record tunnel pid: {}", e);
        }

        if self.probe().await {
            tracing::info!("Tunnel established (pid {})", pid);
            Ok(true)
        } else {
            tracing::warn!("Tunnel port not connectable after rebuild, tearing down");
            self.teardown();
            Ok(false)
        }
    }

    /// Stop the tunnel and remove the pid record.
    pub fn stop(&self) {
        self.teardown();
        tracing::info!("Tunnel stopped");
    }

    /// Cheap local connect probe with a bounded timeout. Side-effect-free;
    /// this is not a store-level ping.
    pub async fn probe(&self) -> bool {
        let addr = format!("127.0.0.1:{}", self.cfg.local_port);
        let timeout = Duration::from_millis(self.cfg.connect_timeout_ms);
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect(&addr)).await,
            Ok(Ok(_))
        )
    }

    /// Whether the recorded pid refers to a live process.
    pub fn record_alive(&self) -> bool {
        match read_pid(&self.cfg.pid_file) {
            Some(pid) => pid_alive(pid),
            None => false,
        }
    }

    fn teardown(&self) {
        if let Some(pid) = read_pid(&self.cfg.pid_file) {
            let _ = Command::new("kill").arg(pid.to_string()).output();
        }
        let _ = std::fs::remove_file(&self.cfg.pid_file);
    }

    fn spawn_ssh(&self) -> Result<()> {
        let forward = format!(
            "{}:127.0.0.1:{}",
            self.cfg.local_port, self.cfg.remote_port
        );
        let dest = format!("{}@{}", self.cfg.ssh_user, self.cfg.ssh_host);

        // -f backgrounds after auth, -N runs no remote command.
        let mut cmd = Command::new("ssh");
        cmd.args([
            "-f",
            "-N",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "ExitOnForwardFailure=yes",
            "-o",
            "ServerAliveInterval=30",
            "-o",
            "ServerAliveCountMax=3",
            "-o",
            "TCPKeepAlive=yes",
        ]);
        if let Some(key) = &self.cfg.ssh_key_path {
            cmd.arg("-i").arg(key);
        }
        cmd.args(["-p", &self.cfg.ssh_port.to_string(), "-L", &forward, &dest]);

        let output = cmd.output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Transport(format!("ssh failed: {}", stderr.trim())));
        }
        Ok(())
    }

    /// Find the backgrounded ssh process for our forward spec.
    fn discover_pid(&self) -> Option<u32> {
        let pattern = format!(
            "ssh.*{}:127.0.0.1:{}",
            self.cfg.local_port, self.cfg.remote_port
        );
        let output = Command::new("pgrep").args(["-f", &pattern]).output().ok()?;
        let text = String::from_utf8_lossy(&output.stdout);
        text.lines().next()?.trim().parse().ok()
    }

    /// Human-readable status line for the CLI.
    pub async fn status(&self) -> String {
        let pid = read_pid(&self.cfg.pid_file);
        let alive = self.record_alive();
        let port_open = self.probe().await;
        match (pid, alive, port_open) {
            (Some(pid), true, true) => format!("up (pid {}, port {})", pid, self.cfg.local_port),
            (Some(pid), true, false) => format!("degraded (pid {} alive, port closed)", pid),
            (Some(pid), false, _) => format!("stale record (pid {} dead)", pid),
            (None, _, true) => format!("port {} open without pid record", self.cfg.local_port),
            (None, _, false) => "down".to_string(),
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    let raw = std::fs::read_to_string(path).ok()?;
    raw.trim().parse().ok()
}

fn pid_alive(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
