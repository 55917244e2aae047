//! Reconciliation loop
//!
//! One timer-driven task owns the registry transitions and the NAT engine.
//! Each tick promotes reservations whose tunnel showed up in the socket
//! table, reaps reservations whose lease ran out, and demotes active
//! tunnels that disappeared. Kernel rule changes land before the matching
//! registry transition commits, so traffic is never balanced onto a port
//! with no forwarding rule.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::endpoint::ProxyEndpoint;
use crate::error::ControlError;
use crate::exec::CommandRunner;
use crate::health::HealthMonitor;
use crate::nat::NatRuleEngine;
use crate::registry::ProxyRegistry;

/// What a tick changed, so callers can react without a full rebuild
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub promoted: bool,
    pub demoted: bool,
}

/// Reconciliation loop configuration
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between ticks
    pub interval: Duration,
    /// When false, the pool is tracked but kernel rules are never touched
    pub nat_enabled: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            nat_enabled: true,
        }
    }
}

/// The single control task tying registry, health probe and NAT engine
/// together
pub struct ReconciliationLoop {
    registry: Arc<ProxyRegistry>,
    monitor: HealthMonitor,
    engine: NatRuleEngine,
    runner: Arc<dyn CommandRunner>,
    config: ReconcilerConfig,
}

impl ReconciliationLoop {
    pub fn new(
        registry: Arc<ProxyRegistry>,
        monitor: HealthMonitor,
        engine: NatRuleEngine,
        runner: Arc<dyn CommandRunner>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            registry,
            monitor,
            engine,
            runner,
            config,
        }
    }

    /// The NAT engine, for inspecting the installed rule set
    pub fn engine(&self) -> &NatRuleEngine {
        &self.engine
    }

    /// Run one reconciliation pass
    ///
    /// A probe that errors (as opposed to answering "dead") leaves its
    /// endpoint untouched for this tick. A rule-install failure aborts the
    /// tick with the registry unchanged; the engine has already rolled the
    /// kernel back, and the next tick retries.
    pub async fn tick(&mut self) -> Result<TickOutcome, ControlError> {
        let mut outcome = TickOutcome::default();

        // Pending -> Active once the tunnel shows up in the socket table.
        // Rules first, then the registry transition.
        for endpoint in self.registry.snapshot_pending() {
            match self.monitor.check(&endpoint).await {
                Ok(true) => {
                    if self.config.nat_enabled {
                        self.engine.add_rule(endpoint.clone()).await?;
                    }
                    self.registry.promote(&endpoint.identity());
                    outcome.promoted = true;
                    info!(
                        endpoint = %endpoint,
                        remote = %endpoint.remote_identity,
                        "new reverse SOCKS tunnel"
                    );
                }
                Ok(false) => {}
                Err(probe_error) => warn!(
                    endpoint = %endpoint,
                    error = %probe_error,
                    "health probe failed, leaving reservation untouched"
                ),
            }
        }

        // Pending -> Removed when the lease ran out without a tunnel
        for endpoint in self.registry.remove_expired(Utc::now()) {
            info!(endpoint = %endpoint, "reservation lease expired, port released");
        }

        // Active -> Removed when the tunnel disappeared. Kill the SSH
        // session, shrink the rule set, then drop the registry entry.
        for endpoint in self.registry.snapshot_active() {
            match self.monitor.check(&endpoint).await {
                Ok(false) => {
                    self.kill_session(&endpoint).await;
                    if self.config.nat_enabled {
                        self.engine.remove_rule(&endpoint.identity()).await?;
                    }
                    self.registry.remove_active(&endpoint.identity());
                    outcome.demoted = true;
                    info!(
                        endpoint = %endpoint,
                        remote = %endpoint.remote_identity,
                        "removed dead reverse SOCKS tunnel"
                    );
                }
                Ok(true) => {}
                Err(probe_error) => warn!(
                    endpoint = %endpoint,
                    error = %probe_error,
                    "health probe failed, keeping endpoint active"
                ),
            }
        }

        Ok(outcome)
    }

    /// Kill the established SSH session carrying this endpoint's tunnel
    async fn kill_session(&self, endpoint: &ProxyEndpoint) {
        let args: Vec<String> = vec![
            "-KHt4".into(),
            "state".into(),
            "established".into(),
            "sport".into(),
            "=".into(),
            ":ssh".into(),
            "and".into(),
            "dst".into(),
            "=".into(),
            endpoint.remote_identity.clone(),
        ];
        match self.runner.run("ss", &args).await {
            Ok(output) if output.success => {
                debug!(remote = %endpoint.remote_identity, "terminated ssh session")
            }
            Ok(output) => warn!(
                remote = %endpoint.remote_identity,
                stderr = %output.stderr.trim(),
                "session kill reported failure"
            ),
            Err(kill_error) => warn!(
                remote = %endpoint.remote_identity,
                error = %kill_error,
                "session kill could not run"
            ),
        }
    }

    /// Drive ticks until the shutdown signal fires, then tear down
    ///
    /// Tick errors are logged and the loop continues at the next interval.
    /// Teardown always runs before this returns.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ControlError> {
        if self.config.nat_enabled {
            // baseline scaffolding: an empty set installs no rules but
            // seeds the engine's known-good state
            self.engine.apply(&[]).await?;
        }

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(outcome) => {
                            if outcome.promoted || outcome.demoted {
                                debug!(
                                    pending = self.registry.pending_count(),
                                    active = self.registry.active_count(),
                                    "pool changed"
                                );
                            }
                        }
                        Err(tick_error) => {
                            error!(error = %tick_error, "reconciliation tick failed, retrying next interval")
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        self.shutdown().await
    }

    /// Tear down every session and every installed rule
    ///
    /// Runs on all exit paths. Attempts the whole teardown even when a step
    /// fails, then reports the first failure.
    pub async fn shutdown(&mut self) -> Result<(), ControlError> {
        info!(
            active = self.registry.active_count(),
            "shutting down proxy pool"
        );

        for endpoint in self.registry.snapshot_active() {
            self.kill_session(&endpoint).await;
            self.registry.remove_active(&endpoint.identity());
        }

        if self.config.nat_enabled {
            self.engine.stop().await?;
        }
        Ok(())
    }
}
