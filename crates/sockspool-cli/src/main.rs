//! sockspool daemon
//!
//! Reserves local ports for reverse SOCKS tunnels that remote hosts dial
//! back to this machine, promotes tunnels once they appear in the kernel
//! socket table, and keeps iptables DNAT rules spreading outbound traffic
//! round-robin across the live set. All pool state is in-memory; rules and
//! sessions are torn down on exit.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sockspool_api::AppState;
use sockspool_control::{
    check_dependencies, BrokerConfig, HealthMonitor, NatConfig, NatRuleEngine, PortBroker,
    ProxyRegistry, ReconcilerConfig, ReconciliationLoop, SystemRunner, TcpProbe,
    REQUIRED_BINARIES,
};

/// Round-robin outbound traffic across reverse SOCKS tunnels
#[derive(Parser, Debug)]
#[command(name = "sockspool")]
#[command(about = "Load-balance outbound traffic across reverse SOCKS tunnels", long_about = None)]
#[command(version)]
struct Cli {
    /// Base listening port for reverse SOCKS reservations
    #[arg(long, default_value = "32482", env = "SOCKSPOOL_BASE_PORT")]
    base_port: u16,

    /// Number of candidate ports scanned above the base port
    #[arg(long, default_value = "5000")]
    window: u16,

    /// Seconds an unconfirmed reservation holds its port
    #[arg(long, default_value = "30")]
    lease_secs: u64,

    /// Seconds between reconciliation ticks
    #[arg(long, default_value = "1")]
    interval_secs: u64,

    /// Allocation API bind address
    #[arg(long, default_value = "0.0.0.0:8080", env = "SOCKSPOOL_API_ADDR")]
    api_addr: SocketAddr,

    /// Address clients dial to reach the balanced SOCKS service
    #[arg(long, default_value = "127.0.0.1")]
    socks_addr: String,

    /// Port clients dial to reach the balanced SOCKS service
    #[arg(long, default_value = "1080")]
    socks_port: u16,

    /// Track the tunnel pool without touching kernel NAT rules
    #[arg(long)]
    no_nat: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    // missing OS tooling is fatal before any pool state exists
    check_dependencies(REQUIRED_BINARIES).context("startup dependency check failed")?;

    let runner = Arc::new(SystemRunner::new());
    let registry = Arc::new(ProxyRegistry::new());
    let broker = Arc::new(PortBroker::new(
        registry.clone(),
        Arc::new(TcpProbe),
        BrokerConfig {
            base_port: cli.base_port,
            window: cli.window,
            lease: Duration::from_secs(cli.lease_secs),
        },
    ));

    let monitor = HealthMonitor::new(runner.clone());
    let engine = NatRuleEngine::new(
        runner.clone(),
        NatConfig {
            address: cli.socks_addr.clone(),
            socks_port: cli.socks_port,
        },
    );
    let reconciler = ReconciliationLoop::new(
        registry.clone(),
        monitor,
        engine,
        runner,
        ReconcilerConfig {
            interval: Duration::from_secs(cli.interval_secs),
            nat_enabled: !cli.no_nat,
        },
    );

    let state = Arc::new(AppState { broker, registry });
    let api_addr = cli.api_addr;
    tokio::spawn(async move {
        if let Err(serve_error) = sockspool_api::serve(api_addr, state).await {
            error!(error = %serve_error, "allocation API server exited");
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        shutdown_tx.send(true).ok();
    });

    info!(
        base_port = cli.base_port,
        socks_port = cli.socks_port,
        nat = !cli.no_nat,
        "sockspool running"
    );

    // run drives the pool until the signal fires, then tears down every
    // session and rule before returning
    reconciler
        .run(shutdown_rx)
        .await
        .context("shutdown cleanup failed")?;

    info!("all sessions terminated and rules removed");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut term) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            return;
        }
    }
    tokio::signal::ctrl_c().await.ok();
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
