//! nftables backend implementation.

use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Write as _;
use std::net::IpAddr;
use tracing::{debug, info};

use super::FirewallBackend;
use crate::cmd_abstraction::{args_to_strings, SharedExecutor};
use crate::firewall::{FirewallRule, FirewallRuleSet, RuleAction, RuleMatch};

const TABLE_NAME: &str = "openpath";
const CHAIN_NAME: &str = "output";

/// nftables backend; all rules live in one `inet` table so IPv4 and IPv6
/// share a single atomic transaction.
pub struct NftablesBackend {
    executor: SharedExecutor,
}

impl NftablesBackend {
    pub fn new(executor: SharedExecutor) -> Self {
        Self { executor }
    }

    /// Generate the nft script replacing the whole table.
    pub fn render_script(rules: &FirewallRuleSet) -> String {
        let mut script = String::new();

        // add+flush rather than delete+create keeps the swap in one transaction
        let _ = writeln!(script, "add table inet {}", TABLE_NAME);
        let _ = writeln!(script, "flush table inet {}", TABLE_NAME);
        let _ = writeln!(script, "table inet {} {{", TABLE_NAME);
        let _ = writeln!(script, "    chain {} {{", CHAIN_NAME);
        script.push_str("        type filter hook output priority 0; policy accept;\n");
        for rule in rules.rules() {
            for line in render_rule(rule) {
                let _ = writeln!(script, "        {}", line);
            }
        }
        script.push_str("    }\n");
        script.push_str("}\n");
        script
    }
}

fn render_rule(rule: &FirewallRule) -> Vec<String> {
    let verdict = match rule.action {
        RuleAction::Accept => "accept",
        RuleAction::Drop => "counter drop",
    };
    match &rule.matcher {
        RuleMatch::Loopback => vec![format!("oifname \"lo\" {}", verdict)],
        RuleMatch::EstablishedRelated => vec![format!("ct state established,related {}", verdict)],
        RuleMatch::Dhcp => vec![format!("udp dport {{ 67, 68, 546, 547 }} {}", verdict)],
        RuleMatch::Icmp => vec![
            format!("meta l4proto icmp {}", verdict),
            format!("meta l4proto ipv6-icmp {}", verdict),
        ],
        RuleMatch::DnsTo { resolver } => {
            let family = match resolver {
                IpAddr::V4(_) => "ip",
                IpAddr::V6(_) => "ip6",
            };
            vec![
                format!("{} daddr {} udp dport 53 {}", family, resolver, verdict),
                format!("{} daddr {} tcp dport 53 {}", family, resolver, verdict),
            ]
        }
        RuleMatch::DnsAny => vec![
            format!("udp dport 53 {}", verdict),
            format!("tcp dport 53 {}", verdict),
        ],
        RuleMatch::Port { protocol, port } => {
            vec![format!("{} dport {} {}", protocol.as_str(), port, verdict)]
        }
        RuleMatch::Any => vec![verdict.to_string()],
    }
}

#[async_trait]
impl FirewallBackend for NftablesBackend {
    fn name(&self) -> &'static str {
        "nftables"
    }

    async fn apply(&self, rules: &FirewallRuleSet) -> Result<()> {
        let script = Self::render_script(rules);
        debug!("Executing nft script:\n{}", script);

        self.executor
            .execute_with_stdin("nft", &args_to_strings(&["-f", "-"]), &script)?
            .into_result("nft")?;

        info!("Applied nftables egress rules ({} rules)", rules.len());
        Ok(())
    }

    async fn is_enforcing(&self) -> Result<bool> {
        let args = args_to_strings(&["list", "chain", "inet", TABLE_NAME, CHAIN_NAME]);
        let output = self.executor.execute("nft", &args)?;
        if !output.success {
            // Table missing entirely
            return Ok(false);
        }
        Ok(output.stdout.lines().any(|l| l.trim_end().ends_with("drop")))
    }
}
