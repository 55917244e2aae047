//! Proxy endpoint registry
//!
//! The registry holds the pending and active endpoint sets and is the only
//! place state transitions happen. All mutation goes through one mutex, so
//! allocation requests and reconciliation ticks interleave linearizably.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::endpoint::{EndpointState, ProxyEndpoint};

#[derive(Default)]
struct RegistryInner {
    pending: HashMap<String, ProxyEndpoint>,
    active: HashMap<String, ProxyEndpoint>,
    /// Identity keys of `active` in promotion order. Rule generation walks
    /// this order; permuting it would break the round-robin partition.
    active_order: Vec<String>,
}

/// Registry of reverse tunnel endpoints
///
/// Invariants:
/// - a local port appears at most once across pending and active
/// - an identity in `active` was confirmed live at promotion time
/// - `active_order` holds exactly the active identities, in promotion order
pub struct ProxyRegistry {
    inner: Mutex<RegistryInner>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Insert a new pending reservation
    ///
    /// Fails if the port is already held by an active endpoint or an
    /// unexpired pending reservation. An expired pending holder is evicted
    /// and replaced. Checking and inserting happen under the same lock, so
    /// two concurrent callers can never reserve the same port.
    pub fn reserve(&self, endpoint: ProxyEndpoint) -> Result<(), String> {
        let mut inner = self.inner.lock().unwrap();

        if inner
            .active
            .values()
            .any(|e| e.local_port == endpoint.local_port)
        {
            return Err(format!(
                "port {} is held by an active endpoint",
                endpoint.local_port
            ));
        }

        // the new reservation's timestamp is "now" for lease purposes
        let now = endpoint.reserved_at;
        let holder = inner
            .pending
            .values()
            .find(|e| e.local_port == endpoint.local_port)
            .cloned();
        if let Some(holder) = holder {
            if !holder.is_expired(now) {
                return Err(format!(
                    "port {} is reserved by an unexpired pending endpoint",
                    endpoint.local_port
                ));
            }
            inner.pending.remove(&holder.identity());
            tracing::debug!(
                port = holder.local_port,
                remote = %holder.remote_identity,
                "evicted expired reservation"
            );
        }

        tracing::debug!(
            identity = %endpoint.identity(),
            port = endpoint.local_port,
            "reserved port for pending tunnel"
        );
        inner.pending.insert(endpoint.identity(), endpoint);
        Ok(())
    }

    /// Move a pending endpoint to the active set, appending it to the
    /// stable iteration order. Returns the endpoint, or None if the
    /// identity is not pending.
    pub fn promote(&self, identity: &str) -> Option<ProxyEndpoint> {
        let mut inner = self.inner.lock().unwrap();
        let endpoint = inner.pending.remove(identity)?;
        inner.active_order.push(identity.to_string());
        inner.active.insert(identity.to_string(), endpoint.clone());
        tracing::debug!(identity = %identity, "promoted endpoint to active");
        Some(endpoint)
    }

    /// Delete a pending endpoint outright
    pub fn remove_pending(&self, identity: &str) -> Option<ProxyEndpoint> {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.remove(identity)
    }

    /// Delete an active endpoint outright, dropping it from the iteration
    /// order as well
    pub fn remove_active(&self, identity: &str) -> Option<ProxyEndpoint> {
        let mut inner = self.inner.lock().unwrap();
        let endpoint = inner.active.remove(identity)?;
        inner.active_order.retain(|id| id != identity);
        tracing::debug!(identity = %identity, "removed active endpoint");
        Some(endpoint)
    }

    /// Delete and return every pending endpoint whose lease has elapsed
    pub fn remove_expired(&self, now: DateTime<Utc>) -> Vec<ProxyEndpoint> {
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<String> = inner
            .pending
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.identity())
            .collect();
        expired
            .iter()
            .filter_map(|identity| inner.pending.remove(identity))
            .collect()
    }

    /// All pending endpoints (no ordering guarantee)
    pub fn snapshot_pending(&self) -> Vec<ProxyEndpoint> {
        let inner = self.inner.lock().unwrap();
        inner.pending.values().cloned().collect()
    }

    /// All active endpoints, in stable promotion order
    pub fn snapshot_active(&self) -> Vec<ProxyEndpoint> {
        let inner = self.inner.lock().unwrap();
        inner
            .active_order
            .iter()
            .filter_map(|identity| inner.active.get(identity))
            .cloned()
            .collect()
    }

    /// Current state of an identity. Absent identities are `Removed`.
    pub fn state_of(&self, identity: &str) -> EndpointState {
        let inner = self.inner.lock().unwrap();
        if inner.active.contains_key(identity) {
            EndpointState::Active
        } else if inner.pending.contains_key(identity) {
            EndpointState::Pending
        } else {
            EndpointState::Removed
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().active.len()
    }
}

impl Default for ProxyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn endpoint(remote: &str, port: u16) -> ProxyEndpoint {
        ProxyEndpoint::new(remote, port, Utc::now(), Duration::from_secs(30))
    }

    fn expired_endpoint(remote: &str, port: u16) -> ProxyEndpoint {
        ProxyEndpoint::new(
            remote,
            port,
            Utc::now() - chrono::Duration::seconds(60),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn test_reserve_and_promote() {
        let registry = ProxyRegistry::new();
        let ep = endpoint("10.0.0.5", 32482);

        registry.reserve(ep.clone()).unwrap();
        assert_eq!(registry.pending_count(), 1);
        assert_eq!(registry.state_of(&ep.identity()), EndpointState::Pending);

        let promoted = registry.promote(&ep.identity()).unwrap();
        assert_eq!(promoted.local_port, 32482);
        assert_eq!(registry.pending_count(), 0);
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.state_of(&ep.identity()), EndpointState::Active);
    }

    #[test]
    fn test_reserve_rejects_pending_port() {
        let registry = ProxyRegistry::new();
        registry.reserve(endpoint("10.0.0.5", 32482)).unwrap();

        let result = registry.reserve(endpoint("10.0.0.6", 32482));
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("unexpired pending"));
    }

    #[test]
    fn test_reserve_rejects_active_port() {
        let registry = ProxyRegistry::new();
        let ep = endpoint("10.0.0.5", 32482);
        registry.reserve(ep.clone()).unwrap();
        registry.promote(&ep.identity()).unwrap();

        let result = registry.reserve(endpoint("10.0.0.6", 32482));
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("active"));
    }

    #[test]
    fn test_reserve_evicts_expired_holder() {
        let registry = ProxyRegistry::new();
        registry.reserve(expired_endpoint("10.0.0.5", 32482)).unwrap();

        // same port, new caller: the stale reservation gives way
        registry.reserve(endpoint("10.0.0.6", 32482)).unwrap();
        assert_eq!(registry.pending_count(), 1);
        assert_eq!(
            registry.state_of("10.0.0.6:32482"),
            EndpointState::Pending
        );
        assert_eq!(
            registry.state_of("10.0.0.5:32482"),
            EndpointState::Removed
        );
    }

    #[test]
    fn test_remove_expired() {
        let registry = ProxyRegistry::new();
        registry.reserve(expired_endpoint("10.0.0.5", 32482)).unwrap();
        registry.reserve(endpoint("10.0.0.6", 32483)).unwrap();

        let removed = registry.remove_expired(Utc::now());
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].local_port, 32482);
        assert_eq!(registry.pending_count(), 1);
    }

    #[test]
    fn test_active_order_is_promotion_order() {
        let registry = ProxyRegistry::new();
        for port in [32484, 32482, 32483] {
            let ep = endpoint("10.0.0.5", port);
            registry.reserve(ep.clone()).unwrap();
            registry.promote(&ep.identity()).unwrap();
        }

        let ports: Vec<u16> = registry
            .snapshot_active()
            .iter()
            .map(|e| e.local_port)
            .collect();
        assert_eq!(ports, vec![32484, 32482, 32483]);
    }

    #[test]
    fn test_remove_active_keeps_order_of_rest() {
        let registry = ProxyRegistry::new();
        for port in [32482, 32483, 32484] {
            let ep = endpoint("10.0.0.5", port);
            registry.reserve(ep.clone()).unwrap();
            registry.promote(&ep.identity()).unwrap();
        }

        registry.remove_active("10.0.0.5:32483").unwrap();
        let ports: Vec<u16> = registry
            .snapshot_active()
            .iter()
            .map(|e| e.local_port)
            .collect();
        assert_eq!(ports, vec![32482, 32484]);
        assert_eq!(registry.state_of("10.0.0.5:32483"), EndpointState::Removed);
    }

    #[test]
    fn test_port_freed_after_removal() {
        let registry = ProxyRegistry::new();
        let ep = endpoint("10.0.0.5", 32482);
        registry.reserve(ep.clone()).unwrap();
        registry.promote(&ep.identity()).unwrap();
        registry.remove_active(&ep.identity()).unwrap();

        registry.reserve(endpoint("10.0.0.7", 32482)).unwrap();
    }
}
