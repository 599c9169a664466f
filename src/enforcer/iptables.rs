//! iptables backend implementation.
//!
//! Rules live in a dedicated `OPENPATH-OUT` chain jumped to from `OUTPUT`.
//! Each family's chain is replaced through `iptables-restore --noflush`,
//! which swaps the chain contents in one commit and leaves foreign rules
//! alone.

use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Write as _;
use std::net::IpAddr;
use tracing::{debug, info};

use super::FirewallBackend;
use crate::cmd_abstraction::{args_to_strings, SharedExecutor};
use crate::firewall::{FirewallRule, FirewallRuleSet, RuleAction, RuleMatch};

const CHAIN_NAME: &str = "OPENPATH-OUT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Family {
    V4,
    V6,
}

impl Family {
    fn iptables(&self) -> &'static str {
        match self {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        }
    }

    fn restore(&self) -> &'static str {
        match self {
            Family::V4 => "iptables-restore",
            Family::V6 => "ip6tables-restore",
        }
    }

    fn matches(&self, ip: &IpAddr) -> bool {
        matches!((self, ip), (Family::V4, IpAddr::V4(_)) | (Family::V6, IpAddr::V6(_)))
    }
}

/// iptables backend
pub struct IptablesBackend {
    executor: SharedExecutor,
}

impl IptablesBackend {
    pub fn new(executor: SharedExecutor) -> Self {
        Self { executor }
    }

    /// Generate the `iptables-restore` input for one address family.
    pub(crate) fn render_restore(rules: &FirewallRuleSet, family: Family) -> String {
        let mut script = String::from("*filter\n");
        // Declaring an existing chain under --noflush empties it first
        let _ = writeln!(script, ":{} - [0:0]", CHAIN_NAME);
        for rule in rules.rules() {
            for spec in render_rule(rule, family) {
                let _ = writeln!(script, "-A {} {}", CHAIN_NAME, spec);
            }
        }
        script.push_str("COMMIT\n");
        script
    }

    fn restore(&self, family: Family, script: &str) -> Result<()> {
        debug!("Executing {} script:\n{}", family.restore(), script);
        self.executor
            .execute_with_stdin(family.restore(), &args_to_strings(&["--noflush"]), script)?
            .into_result(family.restore())?;
        Ok(())
    }

    /// Insert the OUTPUT jump unless it is already there.
    fn ensure_jump(&self, family: Family) -> Result<()> {
        let check = args_to_strings(&["-C", "OUTPUT", "-j", CHAIN_NAME]);
        if self.executor.execute(family.iptables(), &check)?.success {
            return Ok(());
        }
        let insert = args_to_strings(&["-I", "OUTPUT", "1", "-j", CHAIN_NAME]);
        self.executor
            .execute(family.iptables(), &insert)?
            .into_result(family.iptables())?;
        debug!("Inserted {} jump into {} OUTPUT", CHAIN_NAME, family.iptables());
        Ok(())
    }
}

fn render_rule(rule: &FirewallRule, family: Family) -> Vec<String> {
    let target = match rule.action {
        RuleAction::Accept => "-j ACCEPT",
        RuleAction::Drop => "-j DROP",
    };
    match &rule.matcher {
        RuleMatch::Loopback => vec![format!("-o lo {}", target)],
        RuleMatch::EstablishedRelated => {
            vec![format!("-m conntrack --ctstate ESTABLISHED,RELATED {}", target)]
        }
        RuleMatch::Dhcp => {
            let ports = match family {
                Family::V4 => "67:68",
                Family::V6 => "546:547",
            };
            vec![format!("-p udp --dport {} {}", ports, target)]
        }
        RuleMatch::Icmp => {
            let proto = match family {
                Family::V4 => "icmp",
                Family::V6 => "ipv6-icmp",
            };
            vec![format!("-p {} {}", proto, target)]
        }
        RuleMatch::DnsTo { resolver } if family.matches(resolver) => vec![
            format!("-d {} -p udp --dport 53 {}", resolver, target),
            format!("-d {} -p tcp --dport 53 {}", resolver, target),
        ],
        RuleMatch::DnsTo { .. } => Vec::new(),
        RuleMatch::DnsAny => vec![
            format!("-p udp --dport 53 {}", target),
            format!("-p tcp --dport 53 {}", target),
        ],
        RuleMatch::Port { protocol, port } => {
            vec![format!("-p {} --dport {} {}", protocol.as_str(), port, target)]
        }
        RuleMatch::Any => vec![target.to_string()],
    }
}

#[async_trait]
impl FirewallBackend for IptablesBackend {
    fn name(&self) -> &'static str {
        "iptables"
    }

    async fn apply(&self, rules: &FirewallRuleSet) -> Result<()> {
        for family in [Family::V4, Family::V6] {
            let script = Self::render_restore(rules, family);
            self.restore(family, &script)?;
            self.ensure_jump(family)?;
        }
        info!("Applied iptables egress rules ({} rules)", rules.len());
        Ok(())
    }

    async fn is_enforcing(&self) -> Result<bool> {
        let check = args_to_strings(&["-C", "OUTPUT", "-j", CHAIN_NAME]);
        if !self.executor.execute("iptables", &check)?.success {
            return Ok(false);
        }
        let list = self.executor.execute("iptables", &args_to_strings(&["-S", CHAIN_NAME]))?;
        Ok(list.success && list.stdout.lines().any(|l| l.ends_with("-j DROP")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_abstraction::testing::{args_eq, args_has, failed, ok};
    use crate::cmd_abstraction::MockCommandExecutor;
    use crate::firewall::build;
    use crate::state::AgentState;
    use std::sync::Arc;

    fn upstreams() -> Vec<IpAddr> {
        vec!["10.0.0.53".parse().unwrap(), "2620:fe::fe".parse().unwrap()]
    }

    #[test]
    fn test_render_v4_only_has_v4_resolvers() {
        let rules = build(AgentState::Enforcing, &upstreams());
        let v4 = IptablesBackend::render_restore(&rules, Family::V4);
        let v6 = IptablesBackend::render_restore(&rules, Family::V6);

        assert!(v4.starts_with("*filter\n:OPENPATH-OUT - [0:0]\n"));
        assert!(v4.ends_with("COMMIT\n"));
        assert!(v4.contains("-A OPENPATH-OUT -d 10.0.0.53 -p udp --dport 53 -j ACCEPT"));
        assert!(!v4.contains("2620:fe::fe"));
        assert!(v4.contains("-p udp --dport 67:68 -j ACCEPT"));

        assert!(v6.contains("-A OPENPATH-OUT -d 2620:fe::fe -p tcp --dport 53 -j ACCEPT"));
        assert!(!v6.contains("10.0.0.53"));
        assert!(v6.contains("-p ipv6-icmp -j ACCEPT"));
    }

    #[test]
    fn test_render_default_drop_last() {
        let rules = build(AgentState::Enforcing, &upstreams());
        let v4 = IptablesBackend::render_restore(&rules, Family::V4);
        let lines: Vec<&str> = v4.lines().collect();
        assert_eq!(lines[lines.len() - 2], "-A OPENPATH-OUT -j DROP");
    }

    #[test]
    fn test_render_accept_all_is_empty_chain() {
        let script = IptablesBackend::render_restore(&FirewallRuleSet::accept_all(), Family::V4);
        assert_eq!(script, "*filter\n:OPENPATH-OUT - [0:0]\nCOMMIT\n");
    }

    #[tokio::test]
    async fn test_apply_restores_both_families() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute_with_stdin()
            .withf(|cmd, args, _| cmd == "iptables-restore" && args_eq(args, &["--noflush"]))
            .times(1)
            .returning(|_, _, _| Ok(ok("")));
        mock.expect_execute_with_stdin()
            .withf(|cmd, args, _| cmd == "ip6tables-restore" && args_eq(args, &["--noflush"]))
            .times(1)
            .returning(|_, _, _| Ok(ok("")));
        // Jump already present in both families
        mock.expect_execute()
            .withf(|_, args| args_has(args, "-C"))
            .times(2)
            .returning(|_, _| Ok(ok("")));

        let backend = IptablesBackend::new(Arc::new(mock));
        backend
            .apply(&build(AgentState::Enforcing, &upstreams()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_apply_inserts_missing_jump() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute_with_stdin()
            .returning(|_, _, _| Ok(ok("")));
        mock.expect_execute()
            .withf(|_, args| args_has(args, "-C"))
            .times(2)
            .returning(|_, _| Ok(failed("iptables: No chain/target/match by that name.")));
        mock.expect_execute()
            .withf(|_, args| args_eq(args, &["-I", "OUTPUT", "1", "-j", "OPENPATH-OUT"]))
            .times(2)
            .returning(|_, _| Ok(ok("")));

        let backend = IptablesBackend::new(Arc::new(mock));
        backend.apply(&FirewallRuleSet::accept_all()).await.unwrap();
    }

    #[tokio::test]
    async fn test_apply_stops_on_restore_failure() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute_with_stdin()
            .withf(|cmd, _, _| cmd == "iptables-restore")
            .times(1)
            .returning(|_, _, _| Ok(failed("iptables-restore: line 3 failed")));

        let backend = IptablesBackend::new(Arc::new(mock));
        let err = backend
            .apply(&build(AgentState::Enforcing, &upstreams()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("line 3 failed"));
    }

    #[tokio::test]
    async fn test_is_enforcing() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|_, args| args_has(args, "-C"))
            .returning(|_, _| Ok(ok("")));
        mock.expect_execute()
            .withf(|_, args| args_has(args, "-S"))
            .returning(|_, _| Ok(ok("-N OPENPATH-OUT\n-A OPENPATH-OUT -o lo -j ACCEPT\n-A OPENPATH-OUT -j DROP\n")));

        let backend = IptablesBackend::new(Arc::new(mock));
        assert!(backend.is_enforcing().await.unwrap());
    }

    #[tokio::test]
    async fn test_not_enforcing_without_jump() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|_, args| args_has(args, "-C"))
            .returning(|_, _| Ok(failed("")));

        let backend = IptablesBackend::new(Arc::new(mock));
        assert!(!backend.is_enforcing().await.unwrap());
    }
}
