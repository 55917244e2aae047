//! Kernel NAT rule engine
//!
//! Translates the ordered active endpoint set into iptables DNAT rules that
//! spread connections to the virtual SOCKS port round-robin across the
//! tunnels. For N endpoints, rule i (i < N-1) claims every (N-i)-th
//! unmatched packet via the statistic match and the last rule is an
//! unconditional catch-all; iptables evaluates in insertion order, so the
//! shares come out equal only if that order is preserved end-to-end.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::endpoint::ProxyEndpoint;
use crate::error::ControlError;
use crate::exec::CommandRunner;

/// One DNAT rule, stored as the argv tail shared by `iptables -A` and
/// `iptables -D`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRule {
    args: Vec<String>,
}

impl NatRule {
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// NAT engine configuration: the virtual service endpoint clients dial
#[derive(Debug, Clone)]
pub struct NatConfig {
    pub address: String,
    pub socks_port: u16,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            socks_port: 1080,
        }
    }
}

/// Installs and removes the round-robin DNAT rule set
///
/// The engine remembers exactly the rules it installed and only ever
/// deletes those, so unrelated firewall state is never disturbed.
pub struct NatRuleEngine {
    runner: Arc<dyn CommandRunner>,
    config: NatConfig,
    members: Vec<ProxyEndpoint>,
    installed: Vec<NatRule>,
}

impl NatRuleEngine {
    pub fn new(runner: Arc<dyn CommandRunner>, config: NatConfig) -> Self {
        Self {
            runner,
            config,
            members: Vec::new(),
            installed: Vec::new(),
        }
    }

    /// Rules currently installed in the kernel, in evaluation order
    pub fn installed_rules(&self) -> &[NatRule] {
        &self.installed
    }

    pub fn installed_len(&self) -> usize {
        self.installed.len()
    }

    fn build_rules(&self, active: &[ProxyEndpoint]) -> Vec<NatRule> {
        let count = active.len();
        active
            .iter()
            .enumerate()
            .map(|(index, endpoint)| {
                let mut args: Vec<String> = vec![
                    "OUTPUT".into(),
                    "-t".into(),
                    "nat".into(),
                    "-d".into(),
                    self.config.address.clone(),
                    "-o".into(),
                    "lo".into(),
                    "-p".into(),
                    "tcp".into(),
                    "--dport".into(),
                    self.config.socks_port.to_string(),
                    "-j".into(),
                    "DNAT".into(),
                    "--to-destination".into(),
                    format!("127.0.0.1:{}", endpoint.local_port),
                ];
                // every rule but the last claims every (N-i)-th unmatched
                // packet; the final rule catches the remainder
                if index != count - 1 {
                    args.extend([
                        "-m".into(),
                        "statistic".into(),
                        "--mode".into(),
                        "nth".into(),
                        "--every".into(),
                        (count - index).to_string(),
                        "--packet".into(),
                        "0".into(),
                    ]);
                }
                NatRule { args }
            })
            .collect()
    }

    async fn run_iptables(&self, action: &str, rule: &NatRule) -> Result<(), ControlError> {
        let mut args: Vec<String> = vec![action.to_string()];
        args.extend(rule.args.iter().cloned());

        let output = self
            .runner
            .run("iptables", &args)
            .await
            .map_err(|e| ControlError::RuleInstallFailure(e.to_string()))?;
        if !output.success {
            return Err(ControlError::RuleInstallFailure(format!(
                "iptables {} failed: {}",
                action,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Install the rule set for `active`, in the given order
    ///
    /// Idempotent: the previously installed set is deleted first (rule by
    /// rule, never a table flush), then the new set appended. If an append
    /// fails partway, the partial install is unwound and the previous
    /// known-good set reinstalled before the error surfaces, so the kernel
    /// never holds a half-built rule set.
    pub async fn apply(&mut self, active: &[ProxyEndpoint]) -> Result<(), ControlError> {
        let new_rules = self.build_rules(active);
        let previous = std::mem::take(&mut self.installed);

        for rule in &previous {
            if let Err(error) = self.run_iptables("-D", rule).await {
                warn!(%error, "failed to delete previously installed rule");
            }
        }

        for (index, rule) in new_rules.iter().enumerate() {
            if let Err(error) = self.run_iptables("-A", rule).await {
                // unwind the partial install, then put the old set back
                for installed in &new_rules[..index] {
                    if let Err(undo_error) = self.run_iptables("-D", installed).await {
                        warn!(error = %undo_error, "failed to unwind partially installed rule");
                    }
                }
                for rule in &previous {
                    if let Err(restore_error) = self.run_iptables("-A", rule).await {
                        warn!(error = %restore_error, "failed to restore previous rule");
                    }
                }
                self.installed = previous;
                return Err(error);
            }
        }

        debug!(rules = new_rules.len(), "installed NAT rule set");
        self.members = active.to_vec();
        self.installed = new_rules;
        Ok(())
    }

    /// O(N) rebuild with `endpoint` appended to the member list
    pub async fn add_rule(&mut self, endpoint: ProxyEndpoint) -> Result<(), ControlError> {
        let mut next = self.members.clone();
        next.push(endpoint);
        self.apply(&next).await
    }

    /// O(N) rebuild with the identified member removed
    pub async fn remove_rule(&mut self, identity: &str) -> Result<(), ControlError> {
        let next: Vec<ProxyEndpoint> = self
            .members
            .iter()
            .filter(|e| e.identity() != identity)
            .cloned()
            .collect();
        self.apply(&next).await
    }

    /// Remove every installed rule. Attempts all deletions even if one
    /// fails, then reports the first failure.
    pub async fn stop(&mut self) -> Result<(), ControlError> {
        let mut first_error = None;
        for rule in std::mem::take(&mut self.installed) {
            if let Err(error) = self.run_iptables("-D", &rule).await {
                warn!(%error, "failed to remove rule during teardown");
                first_error.get_or_insert(error);
            }
        }
        self.members.clear();
        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records every iptables invocation; optionally fails the Nth append
    struct RecordingRunner {
        commands: Mutex<Vec<Vec<String>>>,
        appends_seen: AtomicUsize,
        fail_append_at: Option<usize>,
    }

    impl RecordingRunner {
        fn new() -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                appends_seen: AtomicUsize::new(0),
                fail_append_at: None,
            }
        }

        fn failing_append_at(index: usize) -> Self {
            Self {
                fail_append_at: Some(index),
                ..Self::new()
            }
        }

        fn commands(&self) -> Vec<Vec<String>> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, _program: &str, args: &[String]) -> Result<CommandOutput, ControlError> {
            self.commands.lock().unwrap().push(args.to_vec());
            let mut success = true;
            if args.first().map(String::as_str) == Some("-A") {
                let seen = self.appends_seen.fetch_add(1, Ordering::SeqCst);
                if self.fail_append_at == Some(seen) {
                    success = false;
                }
            }
            Ok(CommandOutput {
                success,
                stdout: String::new(),
                stderr: if success {
                    String::new()
                } else {
                    "simulated failure".to_string()
                },
            })
        }
    }

    fn endpoint(port: u16) -> ProxyEndpoint {
        ProxyEndpoint::new("10.0.0.5", port, Utc::now(), Duration::from_secs(30))
    }

    fn engine(runner: Arc<RecordingRunner>) -> NatRuleEngine {
        NatRuleEngine::new(runner, NatConfig::default())
    }

    #[tokio::test]
    async fn test_rule_count_matches_active_count() {
        let runner = Arc::new(RecordingRunner::new());
        let mut engine = engine(runner);

        for n in 1..=4usize {
            let active: Vec<ProxyEndpoint> =
                (0..n).map(|i| endpoint(32482 + i as u16)).collect();
            engine.apply(&active).await.unwrap();
            assert_eq!(engine.installed_len(), n);
        }
    }

    #[tokio::test]
    async fn test_three_endpoint_partition() {
        let runner = Arc::new(RecordingRunner::new());
        let mut engine = engine(runner);
        let active = vec![endpoint(32482), endpoint(32483), endpoint(32484)];
        engine.apply(&active).await.unwrap();

        let rules = engine.installed_rules();
        assert_eq!(rules.len(), 3);

        // rule 0 claims every 3rd packet, rule 1 every 2nd remaining
        let selector = |rule: &NatRule| -> Option<String> {
            let args = rule.args();
            args.iter()
                .position(|a| a == "--every")
                .map(|i| args[i + 1].clone())
        };
        assert_eq!(selector(&rules[0]).as_deref(), Some("3"));
        assert_eq!(selector(&rules[1]).as_deref(), Some("2"));
        // the last rule is the unconditional catch-all
        assert_eq!(selector(&rules[2]), None);

        // destinations follow the active order
        assert!(rules[0].args().contains(&"127.0.0.1:32482".to_string()));
        assert!(rules[1].args().contains(&"127.0.0.1:32483".to_string()));
        assert!(rules[2].args().contains(&"127.0.0.1:32484".to_string()));
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let runner = Arc::new(RecordingRunner::new());
        let mut engine = NatRuleEngine::new(runner.clone(), NatConfig::default());
        let active = vec![endpoint(32482), endpoint(32483)];

        engine.apply(&active).await.unwrap();
        let first = engine.installed_rules().to_vec();

        engine.apply(&active).await.unwrap();
        assert_eq!(engine.installed_rules(), first.as_slice());

        // second apply removed exactly the first set before reinstalling
        let commands = runner.commands();
        let deletes: Vec<&Vec<String>> = commands
            .iter()
            .filter(|c| c.first().map(String::as_str) == Some("-D"))
            .collect();
        assert_eq!(deletes.len(), 2);
        for (delete, rule) in deletes.iter().zip(first.iter()) {
            assert_eq!(&delete[1..], rule.args());
        }
    }

    #[tokio::test]
    async fn test_single_endpoint_gets_plain_catchall() {
        let runner = Arc::new(RecordingRunner::new());
        let mut engine = engine(runner);
        engine.apply(&[endpoint(32482)]).await.unwrap();

        let rules = engine.installed_rules();
        assert_eq!(rules.len(), 1);
        assert!(!rules[0].args().contains(&"statistic".to_string()));
    }

    #[tokio::test]
    async fn test_partial_failure_restores_previous_set() {
        // first apply installs 1 rule (append #0); the next apply appends
        // its first rule fine (#1) and fails on the second (#2)
        let runner = Arc::new(RecordingRunner::failing_append_at(2));
        let mut engine = NatRuleEngine::new(runner.clone(), NatConfig::default());
        engine.apply(&[endpoint(32482)]).await.unwrap();
        let known_good = engine.installed_rules().to_vec();

        let result = engine
            .apply(&[endpoint(32482), endpoint(32483), endpoint(32484)])
            .await;
        assert!(matches!(result, Err(ControlError::RuleInstallFailure(_))));

        // engine remembers the previous known-good set
        assert_eq!(engine.installed_rules(), known_good.as_slice());

        // the partially installed new rule was unwound, then the old set
        // reinstalled: command log ends with -D(new rule 0), -A(old rule)
        let commands = runner.commands();
        let tail: Vec<&str> = commands
            .iter()
            .rev()
            .take(2)
            .map(|c| c[0].as_str())
            .collect();
        assert_eq!(tail, vec!["-A", "-D"]);
    }

    #[tokio::test]
    async fn test_add_and_remove_rule_rebuild() {
        let runner = Arc::new(RecordingRunner::new());
        let mut engine = engine(runner);

        engine.add_rule(endpoint(32482)).await.unwrap();
        assert_eq!(engine.installed_len(), 1);

        engine.add_rule(endpoint(32483)).await.unwrap();
        assert_eq!(engine.installed_len(), 2);

        engine.remove_rule("10.0.0.5:32482").await.unwrap();
        assert_eq!(engine.installed_len(), 1);
        assert!(engine.installed_rules()[0]
            .args()
            .contains(&"127.0.0.1:32483".to_string()));
    }

    #[tokio::test]
    async fn test_stop_removes_everything() {
        let runner = Arc::new(RecordingRunner::new());
        let mut engine = NatRuleEngine::new(runner.clone(), NatConfig::default());
        engine
            .apply(&[endpoint(32482), endpoint(32483)])
            .await
            .unwrap();

        engine.stop().await.unwrap();
        assert_eq!(engine.installed_len(), 0);

        let commands = runner.commands();
        let deletes = commands
            .iter()
            .filter(|c| c.first().map(String::as_str) == Some("-D"))
            .count();
        assert_eq!(deletes, 2);
    }

    #[tokio::test]
    async fn test_empty_set_installs_nothing() {
        let runner = Arc::new(RecordingRunner::new());
        let mut engine = NatRuleEngine::new(runner.clone(), NatConfig::default());
        engine.apply(&[]).await.unwrap();
        assert_eq!(engine.installed_len(), 0);
        assert!(runner.commands().is_empty());
    }
}
