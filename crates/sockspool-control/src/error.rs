//! Error types for the control plane

use thiserror::Error;

/// Control plane errors
#[derive(Debug, Error)]
pub enum ControlError {
    /// The port scan window contained no allocatable port. Fatal to the
    /// allocation call, not to the process.
    #[error("no free port in the {window}-port window starting at {base}")]
    AllocationExhausted { base: u16, window: u16 },

    /// An iptables invocation failed while changing the rule set. The engine
    /// rolls back to the previous known-good set before surfacing this.
    #[error("NAT rule install failed: {0}")]
    RuleInstallFailure(String),

    /// The health probe itself could not be executed. Distinct from a
    /// negative probe result: callers must not treat this as a dead tunnel.
    #[error("health probe failed to execute: {0}")]
    HealthCheckFailure(String),

    /// A required OS binary is missing. Checked once at startup, fatal.
    #[error("required binary '{binary}' not found in PATH")]
    DependencyMissing { binary: String },

    /// An OS command could not be spawned.
    #[error("command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },
}
