//! Port broker
//!
//! Hands out the next usable local port for a pending reverse tunnel. The
//! scan skips ports with a live local socket and ports already reserved in
//! the registry; the reserve step is atomic, so concurrent callers never
//! receive the same port.

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, trace, warn};

use crate::endpoint::ProxyEndpoint;
use crate::error::ControlError;
use crate::registry::ProxyRegistry;

/// Answers "is any local socket bound to this port"
pub trait PortProbe: Send + Sync {
    fn is_bound(&self, port: u16) -> bool;
}

/// Probes by attempting a loopback TCP connect; a successful connect means
/// something is listening there
pub struct TcpProbe;

impl PortProbe for TcpProbe {
    fn is_bound(&self, port: u16) -> bool {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok()
    }
}

/// Port broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// First candidate port
    pub base_port: u16,
    /// Number of candidate ports scanned above the base
    pub window: u16,
    /// How long an unconfirmed reservation holds its port
    pub lease: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            base_port: 32482,
            window: 5000,
            lease: Duration::from_secs(30),
        }
    }
}

/// Allocates free local ports for pending reverse tunnel reservations
pub struct PortBroker {
    registry: Arc<ProxyRegistry>,
    probe: Arc<dyn PortProbe>,
    config: BrokerConfig,
}

impl PortBroker {
    pub fn new(registry: Arc<ProxyRegistry>, probe: Arc<dyn PortProbe>, config: BrokerConfig) -> Self {
        Self {
            registry,
            probe,
            config,
        }
    }

    /// Reserve the lowest usable port for `caller_identity`
    ///
    /// The caller's identity is only a correlation hint for the pending
    /// record; the eventual SSH peer may differ. Returns
    /// [`ControlError::AllocationExhausted`] when the window has no free
    /// port.
    pub fn allocate(&self, caller_identity: &str) -> Result<u16, ControlError> {
        let end = self.config.base_port as u32 + self.config.window as u32;
        for candidate in self.config.base_port as u32..end {
            let Ok(port) = u16::try_from(candidate) else {
                break;
            };
            if self.probe.is_bound(port) {
                trace!(port, "port has a bound socket, skipping");
                continue;
            }
            let endpoint =
                ProxyEndpoint::new(caller_identity, port, Utc::now(), self.config.lease);
            match self.registry.reserve(endpoint) {
                Ok(()) => {
                    info!(port, caller = %caller_identity, "reserved port for reverse tunnel");
                    return Ok(port);
                }
                Err(reason) => {
                    trace!(port, %reason, "port reserved in registry, skipping");
                }
            }
        }

        warn!(
            base = self.config.base_port,
            window = self.config.window,
            "port allocation window exhausted"
        );
        Err(ControlError::AllocationExhausted {
            base: self.config.base_port,
            window: self.config.window,
        })
    }
}
