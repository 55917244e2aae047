//! Tunnel health probing
//!
//! Asks the kernel socket table whether a reserved port actually has a
//! listener behind it. Pure observation; the privileged `ss` query goes
//! through the command runner.

use std::sync::Arc;

use tracing::trace;

use crate::endpoint::ProxyEndpoint;
use crate::error::ControlError;
use crate::exec::CommandRunner;

/// Queries local socket state for reverse tunnel liveness
pub struct HealthMonitor {
    runner: Arc<dyn CommandRunner>,
}

impl HealthMonitor {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// True if a LISTEN or ESTABLISHED socket is bound to the endpoint's
    /// local port
    ///
    /// A probe that cannot run (missing binary, permission error) is
    /// [`ControlError::HealthCheckFailure`], never `false`: a failed probe
    /// must not be read as a confirmed-dead tunnel.
    pub async fn check(&self, endpoint: &ProxyEndpoint) -> Result<bool, ControlError> {
        let args: Vec<String> = vec![
            "-Hlt4".into(),
            "state".into(),
            "all".into(),
            "sport".into(),
            "=".into(),
            format!(":{}", endpoint.local_port),
        ];

        let output = self
            .runner
            .run("ss", &args)
            .await
            .map_err(|e| ControlError::HealthCheckFailure(e.to_string()))?;

        if !output.success {
            return Err(ControlError::HealthCheckFailure(format!(
                "ss exited with failure: {}",
                output.stderr.trim()
            )));
        }

        let live = !output.stdout.trim().is_empty();
        trace!(port = endpoint.local_port, live, "health probe");
        Ok(live)
    }
}
