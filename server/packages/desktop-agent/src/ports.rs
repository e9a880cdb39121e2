use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Arc;

use desktop_agent_error::DesktopError;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const DEFAULT_BASE_PORT: u16 = 6080;
pub const DEFAULT_MAX_ATTEMPTS: u16 = 100;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("no free port in {attempts} attempts starting at {base_port}")]
    Exhausted { base_port: u16, attempts: u16 },
}

impl From<PortError> for DesktopError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::Exhausted {
                base_port,
                attempts,
            } => DesktopError::PortExhaustion {
                base_port,
                attempts,
            },
        }
    }
}

pub type PortProbe = Arc<dyn Fn(u16) -> bool + Send + Sync>;

/// Returns true when `port` can be bound on all interfaces.
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Serialized free-port scan. Ports it hands out stay reserved until
/// released, so two concurrent allocations never return the same port even
/// before either one is bound.
pub struct PortAllocator {
    base_port: u16,
    max_attempts: u16,
    probe: PortProbe,
    reserved: Mutex<HashSet<u16>>,
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator")
            .field("base_port", &self.base_port)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl PortAllocator {
    pub fn new(base_port: u16, max_attempts: u16) -> Self {
        Self::with_probe(base_port, max_attempts, Arc::new(is_port_available))
    }

    pub fn with_probe(base_port: u16, max_attempts: u16, probe: PortProbe) -> Self {
        Self {
            base_port,
            max_attempts,
            probe,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    pub async fn allocate(&self) -> Result<u16, PortError> {
        let mut reserved = self.reserved.lock().await;
        for offset in 0..self.max_attempts {
            let Some(port) = self.base_port.checked_add(offset) else {
                break;
            };
            if reserved.contains(&port) {
                continue;
            }
            if (self.probe)(port) {
                reserved.insert(port);
                info!(port, "allocated port");
                return Ok(port);
            }
            debug!(port, "port in use");
        }
        Err(PortError::Exhausted {
            base_port: self.base_port,
            attempts: self.max_attempts,
        })
    }

    /// Reserves `port` if it is free and not already handed out.
    pub async fn claim(&self, port: u16) -> bool {
        let mut reserved = self.reserved.lock().await;
        if reserved.contains(&port) || !(self.probe)(port) {
            return false;
        }
        reserved.insert(port);
        true
    }

    pub async fn release(&self, port: u16) {
        self.reserved.lock().await.remove(&port);
    }
}
