//! OS command execution
//!
//! Everything privileged (iptables changes, socket table queries, session
//! kills) goes through the [`CommandRunner`] seam. The real implementation
//! shells out with a sudo prefix when not running as root; tests substitute
//! recording fakes.

use std::process::Stdio;

use async_trait::async_trait;
use tracing::debug;

use crate::error::ControlError;

/// Binaries the daemon shells out to. Checked once at startup.
pub const REQUIRED_BINARIES: &[&str] = &["ssh", "ss", "iptables", "sudo"];

/// Captured result of an OS command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Whether the process exited with status zero
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Executes privileged OS commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, capturing output. Err only when the
    /// command could not be spawned; a nonzero exit is reported through
    /// [`CommandOutput::success`] so call sites decide what it means.
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, ControlError>;
}

/// Shells out via `tokio::process`, prefixing `sudo` when not root
pub struct SystemRunner {
    use_sudo: bool,
}

impl SystemRunner {
    pub fn new() -> Self {
        let euid = unsafe { libc::geteuid() };
        Self { use_sudo: euid != 0 }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, ControlError> {
        let (program, args) = if self.use_sudo && program != "sudo" {
            let mut prefixed = vec![program.to_string()];
            prefixed.extend_from_slice(args);
            ("sudo", prefixed)
        } else {
            (program, args.to_vec())
        };

        debug!(command = %format!("{} {}", program, args.join(" ")), "running command");

        let output = tokio::process::Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ControlError::CommandFailed {
                command: format!("{} {}", program, args.join(" ")),
                message: e.to_string(),
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Resolve every required binary through PATH. Missing tooling is fatal
/// before any pool state exists.
pub fn check_dependencies(binaries: &[&str]) -> Result<(), ControlError> {
    for binary in binaries {
        if which::which(binary).is_err() {
            return Err(ControlError::DependencyMissing {
                binary: binary.to_string(),
            });
        }
    }
    Ok(())
}
