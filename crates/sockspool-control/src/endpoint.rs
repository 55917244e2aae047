//! Reverse tunnel endpoint model

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Lifecycle state of a reverse tunnel endpoint
///
/// `Pending` means the port is reserved but the tunnel has not been confirmed
/// in the kernel socket table. `Active` means it was confirmed live and is
/// part of the load-balancing rule set. Removed endpoints are deleted
/// outright; nothing transitions back out of `Removed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Pending,
    Active,
    Removed,
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointState::Pending => write!(f, "pending"),
            EndpointState::Active => write!(f, "active"),
            EndpointState::Removed => write!(f, "removed"),
        }
    }
}

/// A reverse SOCKS tunnel endpoint on a reserved local port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    /// Correlation key for the remote peer: the allocation caller's address
    /// or the eventual SSH peer identity
    pub remote_identity: String,
    /// Local port the reverse tunnel's SOCKS listener binds
    pub local_port: u16,
    /// When the reservation was created
    pub reserved_at: DateTime<Utc>,
    /// How long an unconfirmed reservation holds its port
    pub lease: Duration,
}

impl ProxyEndpoint {
    pub fn new(
        remote_identity: impl Into<String>,
        local_port: u16,
        reserved_at: DateTime<Utc>,
        lease: Duration,
    ) -> Self {
        Self {
            remote_identity: remote_identity.into(),
            local_port,
            reserved_at,
            lease,
        }
    }

    /// Identity key: `"{remote_identity}:{local_port}"`. Endpoint equality
    /// across the registry is by this string form.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.remote_identity, self.local_port)
    }

    /// True once the reservation lease has fully elapsed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.lease) {
            Ok(lease) => now - self.reserved_at >= lease,
            // a lease too large for chrono never expires
            Err(_) => false,
        }
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socks5://127.0.0.1:{}", self.local_port)
    }
}
