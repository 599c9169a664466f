//! Firewall rule engine.
//!
//! A pure function of agent state and upstream resolvers. The order of an
//! enforcing rule set is part of its meaning:
//!
//! ```text
//! loopback accept
//! established/related accept
//! DHCP accept
//! ICMP / ICMPv6 accept
//! DNS to approved resolvers accept
//! DNS to anywhere else drop
//! VPN / anonymity / encrypted-DNS ports drop
//! HTTP / HTTPS accept
//! default drop
//! ```
//!
//! Fail-open and captive bypass produce an empty (accept-all) rule set.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

use crate::state::AgentState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// VPN, anonymity network and encrypted-DNS ports that would bypass the sinkhole.
pub const BYPASS_PORTS: &[(Protocol, u16)] = &[
    (Protocol::Tcp, 853),   // DNS over TLS
    (Protocol::Udp, 853),   // DNS over QUIC
    (Protocol::Tcp, 1194),  // OpenVPN
    (Protocol::Udp, 1194),
    (Protocol::Tcp, 1723),  // PPTP
    (Protocol::Udp, 500),   // IPsec IKE
    (Protocol::Udp, 4500),  // IPsec NAT-T
    (Protocol::Udp, 51820), // WireGuard
    (Protocol::Tcp, 9001),  // Tor ORPort
    (Protocol::Tcp, 9030),  // Tor DirPort
    (Protocol::Tcp, 9050),  // Tor SOCKS
    (Protocol::Tcp, 9150),  // Tor Browser SOCKS
];

/// Ports left open for browsing.
pub const WEB_PORTS: &[(Protocol, u16)] = &[(Protocol::Tcp, 80), (Protocol::Tcp, 443)];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RuleMatch {
    Loopback,
    EstablishedRelated,
    Dhcp,
    /// ICMP and ICMPv6; IPv6 neighbor discovery dies without it.
    Icmp,
    /// DNS (udp+tcp 53) to one approved resolver.
    DnsTo { resolver: IpAddr },
    /// DNS (udp+tcp 53) to any destination.
    DnsAny,
    Port { protocol: Protocol, port: u16 },
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Accept,
    Drop,
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleAction::Accept => f.write_str("accept"),
            RuleAction::Drop => f.write_str("drop"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    #[serde(rename = "match")]
    pub matcher: RuleMatch,
    pub action: RuleAction,
}

impl FirewallRule {
    fn accept(matcher: RuleMatch) -> Self {
        Self {
            matcher,
            action: RuleAction::Accept,
        }
    }

    fn deny(matcher: RuleMatch) -> Self {
        Self {
            matcher,
            action: RuleAction::Drop,
        }
    }
}

/// Ordered egress rules. Empty means accept everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FirewallRuleSet {
    rules: Vec<FirewallRule>,
}

impl FirewallRuleSet {
    pub fn accept_all() -> Self {
        Self::default()
    }

    pub fn rules(&self) -> &[FirewallRule] {
        &self.rules
    }

    pub fn is_accept_all(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn position(&self, matcher: &RuleMatch, action: RuleAction) -> Option<usize> {
        self.rules
            .iter()
            .position(|r| &r.matcher == matcher && r.action == action)
    }

    /// Canonical serialization, used for fingerprinting.
    pub fn canonical(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Build the rule set for `state`.
pub fn build(state: AgentState, upstreams: &[IpAddr]) -> FirewallRuleSet {
    match state {
        AgentState::Enforcing => enforcing_rules(upstreams),
        AgentState::FailOpen | AgentState::CaptiveBypass => FirewallRuleSet::accept_all(),
    }
}

fn enforcing_rules(upstreams: &[IpAddr]) -> FirewallRuleSet {
    let mut rules = vec![
        FirewallRule::accept(RuleMatch::Loopback),
        FirewallRule::accept(RuleMatch::EstablishedRelated),
        FirewallRule::accept(RuleMatch::Dhcp),
        FirewallRule::accept(RuleMatch::Icmp),
    ];

    let mut seen = Vec::with_capacity(upstreams.len());
    for resolver in upstreams {
        if !seen.contains(resolver) {
            seen.push(*resolver);
            rules.push(FirewallRule::accept(RuleMatch::DnsTo {
                resolver: *resolver,
            }));
        }
    }
    rules.push(FirewallRule::deny(RuleMatch::DnsAny));

    rules.extend(
        BYPASS_PORTS
            .iter()
            .map(|&(protocol, port)| FirewallRule::deny(RuleMatch::Port { protocol, port })),
    );
    rules.extend(
        WEB_PORTS
            .iter()
            .map(|&(protocol, port)| FirewallRule::accept(RuleMatch::Port { protocol, port })),
    );
    rules.push(FirewallRule::deny(RuleMatch::Any));

    FirewallRuleSet { rules }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstreams() -> Vec<IpAddr> {
        vec!["8.8.8.8".parse().unwrap(), "2001:4860:4860::8888".parse().unwrap()]
    }

    #[test]
    fn test_enforcing_order() {
        let rules = build(AgentState::Enforcing, &upstreams());

        let loopback = rules.position(&RuleMatch::Loopback, RuleAction::Accept).unwrap();
        let established = rules
            .position(&RuleMatch::EstablishedRelated, RuleAction::Accept)
            .unwrap();
        let dns_ok = rules
            .position(
                &RuleMatch::DnsTo { resolver: "8.8.8.8".parse().unwrap() },
                RuleAction::Accept,
            )
            .unwrap();
        let dns_drop = rules.position(&RuleMatch::DnsAny, RuleAction::Drop).unwrap();
        let vpn_drop = rules
            .position(&RuleMatch::Port { protocol: Protocol::Udp, port: 1194 }, RuleAction::Drop)
            .unwrap();
        let https = rules
            .position(&RuleMatch::Port { protocol: Protocol::Tcp, port: 443 }, RuleAction::Accept)
            .unwrap();
        let default_drop = rules.position(&RuleMatch::Any, RuleAction::Drop).unwrap();

        assert_eq!(loopback, 0);
        assert!(loopback < established);
        assert!(established < dns_ok);
        assert!(dns_ok < dns_drop);
        assert!(dns_drop < vpn_drop);
        assert!(vpn_drop < https);
        assert!(https < default_drop);
        assert_eq!(default_drop, rules.len() - 1);
    }

    #[test]
    fn test_fail_open_and_bypass_accept_all() {
        assert!(build(AgentState::FailOpen, &upstreams()).is_accept_all());
        assert!(build(AgentState::CaptiveBypass, &upstreams()).is_accept_all());
    }

    #[test]
    fn test_duplicate_upstreams_collapsed() {
        let ups: Vec<IpAddr> = vec!["1.1.1.1".parse().unwrap(), "1.1.1.1".parse().unwrap()];
        let rules = build(AgentState::Enforcing, &ups);
        let count = rules
            .rules()
            .iter()
            .filter(|r| matches!(r.matcher, RuleMatch::DnsTo { .. }))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = build(AgentState::Enforcing, &upstreams());
        let b = build(AgentState::Enforcing, &upstreams());
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_ruleset_serde_roundtrip() {
        let rules = build(AgentState::Enforcing, &upstreams());
        let json = serde_json::to_string(&rules).unwrap();
        assert!(json.contains("\"kind\":\"dns-to\""));
        let parsed: FirewallRuleSet = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, rules);
    }
}
