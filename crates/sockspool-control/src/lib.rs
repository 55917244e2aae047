//! Control plane for a pool of reverse SOCKS tunnels
//!
//! Remote hosts establish reverse SSH tunnels back to this machine, each one
//! opening a local SOCKS listener. This crate tracks those tunnels from
//! reservation to confirmed-live, generates kernel DNAT rules that spread
//! outbound traffic round-robin across the live set, and tears everything
//! down on shutdown.
//!
//! ## Key components
//!
//! - [`registry::ProxyRegistry`]: pending/active endpoint state, the only
//!   place transitions happen
//! - [`broker::PortBroker`]: hands out the next usable local port
//! - [`health::HealthMonitor`]: asks the kernel socket table whether a
//!   reserved port has a live listener
//! - [`nat::NatRuleEngine`]: installs and removes the iptables round-robin
//!   rule set
//! - [`reconciler::ReconciliationLoop`]: the single control task that
//!   promotes, expires and demotes endpoints each tick
//!
//! Everything that shells out to OS tooling goes through the
//! [`exec::CommandRunner`] seam, so tests substitute recording fakes.

pub mod broker;
pub mod endpoint;
pub mod error;
pub mod exec;
pub mod health;
pub mod nat;
pub mod reconciler;
pub mod registry;

pub use broker::{BrokerConfig, PortBroker, PortProbe, TcpProbe};
pub use endpoint::{EndpointState, ProxyEndpoint};
pub use error::ControlError;
pub use exec::{check_dependencies, CommandOutput, CommandRunner, SystemRunner, REQUIRED_BINARIES};
pub use health::HealthMonitor;
pub use nat::{NatConfig, NatRule, NatRuleEngine};
pub use reconciler::{ReconcilerConfig, ReconciliationLoop, TickOutcome};
pub use registry::ProxyRegistry;
