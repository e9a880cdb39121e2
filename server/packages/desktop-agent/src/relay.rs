//! websockify/noVNC relay exposing the sandbox VNC port to browsers.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use desktop_agent_error::DesktopError;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::ports::PortAllocator;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub python: String,
    pub novnc_path: PathBuf,
    pub vnc_host: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            python: "python".to_string(),
            novnc_path: PathBuf::from("noVNC"),
            vnc_host: "localhost".to_string(),
        }
    }
}

struct RunningRelay {
    child: Child,
    port: u16,
}

pub struct DisplayRelay {
    config: RelayConfig,
    ports: Arc<PortAllocator>,
    running: Mutex<Option<RunningRelay>>,
}

impl std::fmt::Debug for DisplayRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayRelay")
            .field("config", &self.config)
            .finish()
    }
}

impl DisplayRelay {
    pub fn new(config: RelayConfig, ports: Arc<PortAllocator>) -> Self {
        Self {
            config,
            ports,
            running: Mutex::new(None),
        }
    }

    pub fn command_args(&self, port: u16, vnc_port: u16) -> Vec<String> {
        vec![
            "-m".to_string(),
            "websockify".to_string(),
            "--web".to_string(),
            self.config.novnc_path.display().to_string(),
            port.to_string(),
            format!("{}:{}", self.config.vnc_host, vnc_port),
        ]
    }

    /// Starts the relay unless one is already alive, returning its port.
    pub async fn start(&self, vnc_port: u16) -> Result<u16, DesktopError> {
        let mut running = self.running.lock().await;

        if let Some(relay) = running.as_mut() {
            match relay.child.try_wait() {
                Ok(None) => return Ok(relay.port),
                Ok(Some(status)) => {
                    warn!(port = relay.port, ?status, "relay exited, restarting");
                }
                Err(err) => {
                    warn!(port = relay.port, error = %err, "failed to poll relay, restarting");
                }
            }
            if let Some(stale) = running.take() {
                self.ports.release(stale.port).await;
            }
        }

        let port = self.ports.allocate().await?;
        let mut cmd = Command::new(&self.config.python);
        cmd.args(self.command_args(port, vnc_port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.ports.release(port).await;
                return Err(DesktopError::Provisioning {
                    name: "novnc-relay".to_string(),
                    message: format!("failed to start websockify: {err}"),
                });
            }
        };

        info!(port, vnc_port, pid = ?child.id(), "noVNC relay started");
        *running = Some(RunningRelay { child, port });
        Ok(port)
    }

    pub async fn port(&self) -> Option<u16> {
        self.running.lock().await.as_ref().map(|relay| relay.port)
    }

    pub async fn stop(&self) {
        let relay = self.running.lock().await.take();
        if let Some(mut relay) = relay {
            if let Err(err) = relay.child.kill().await {
                warn!(port = relay.port, error = %err, "failed to kill relay");
            }
            self.ports.release(relay.port).await;
            info!(port = relay.port, "noVNC relay stopped");
        }
    }
}
