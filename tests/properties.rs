//! Property tests for the pure policy pipeline: whitelist parsing, sinkhole
//! generation and the firewall rule engine.

use openpath::firewall::{self, RuleAction, RuleMatch};
use openpath::sinkhole::{self, SinkholeRule};
use openpath::whitelist::{Domain, WhitelistDocument};
use openpath::AgentState;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

fn label() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,6}"
}

/// Hostnames of two to four labels over a small alphabet, so that
/// parent/child overlaps are common.
fn domain_name() -> impl Strategy<Value = String> {
    (
        prop::sample::select(vec!["com", "org", "edu"]),
        prop::sample::select(vec!["example", "school", "test"]),
        prop::collection::vec(label(), 0..3),
    )
        .prop_map(|(tld, sld, mut subs)| {
            subs.push(sld.to_string());
            subs.push(tld.to_string());
            subs.join(".")
        })
}

fn domains() -> impl Strategy<Value = BTreeSet<Domain>> {
    prop::collection::btree_set(domain_name(), 0..40)
        .prop_map(|names| names.iter().map(|n| n.parse::<Domain>().unwrap()).collect())
}

fn upstreams() -> impl Strategy<Value = Vec<IpAddr>> {
    prop::collection::vec(
        prop_oneof![
            any::<u32>().prop_map(|n| IpAddr::V4(Ipv4Addr::from(n))),
            any::<u128>().prop_map(|n| IpAddr::V6(Ipv6Addr::from(n))),
        ],
        1..4,
    )
}

fn document(allowed: &BTreeSet<Domain>, blocked: &[String], disabled: bool) -> WhitelistDocument {
    let mut raw = String::new();
    if disabled {
        raw.push_str("# DESACTIVADO\n");
    }
    for d in allowed {
        raw.push_str(d.as_str());
        raw.push('\n');
    }
    raw.push_str("## BLOCKED-SUBDOMAINS\n");
    for b in blocked {
        raw.push_str(b);
        raw.push('\n');
    }
    WhitelistDocument::parse(raw.as_bytes()).unwrap()
}

proptest! {
    #[test]
    fn covering_set_is_idempotent(set in domains()) {
        let once = sinkhole::covering_set(&set);
        let twice = sinkhole::covering_set(&once);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn covering_set_covers_everything_minimally(set in domains()) {
        let cover = sinkhole::covering_set(&set);
        for d in &set {
            prop_assert!(cover.iter().any(|c| d.is_covered_by(c)), "{} not covered", d);
        }
        for a in &cover {
            for b in &cover {
                prop_assert!(!a.is_subdomain_of(b), "{} redundant under {}", a, b);
            }
        }
    }

    #[test]
    fn deny_all_first_unless_pass_through(
        set in domains(),
        blocked in prop::collection::vec(domain_name(), 0..5),
        ups in upstreams(),
    ) {
        let doc = document(&set, &blocked, false);
        let config = sinkhole::generate(&doc, &ups);
        prop_assert!(!config.is_pass_through());
        prop_assert_eq!(&config.rules()[0], &SinkholeRule::DenyAll);
    }

    #[test]
    fn blocked_subdomains_precede_their_parent(
        set in domains(),
        blocked in prop::collection::vec(domain_name(), 0..8),
        ups in upstreams(),
    ) {
        let doc = document(&set, &blocked, false);
        let rules = sinkhole::generate(&doc, &ups).rules().to_vec();
        for (i, rule) in rules.iter().enumerate() {
            if let SinkholeRule::Deny { domain } = rule {
                let parent = rules.iter().position(|r| matches!(
                    r,
                    SinkholeRule::Forward { domain: p, .. } if domain.is_subdomain_of(p)
                ));
                prop_assert!(parent.map_or(false, |p| i < p));
            }
        }
    }

    #[test]
    fn kill_switch_disables_everything(
        set in domains(),
        blocked in prop::collection::vec(domain_name(), 0..5),
        ups in upstreams(),
    ) {
        let doc = document(&set, &blocked, true);
        prop_assert!(doc.is_disabled());
        prop_assert!(sinkhole::generate(&doc, &ups).is_pass_through());
        // A disabled document never reaches the enforcing rule set
        prop_assert!(firewall::build(AgentState::FailOpen, &ups).is_accept_all());
    }

    #[test]
    fn firewall_order_holds_for_any_upstreams(ups in upstreams()) {
        let rules = firewall::build(AgentState::Enforcing, &ups);
        let loopback = rules.position(&RuleMatch::Loopback, RuleAction::Accept).unwrap();
        let dns_drop = rules.position(&RuleMatch::DnsAny, RuleAction::Drop).unwrap();
        let default_drop = rules.position(&RuleMatch::Any, RuleAction::Drop).unwrap();

        prop_assert!(loopback < default_drop);
        prop_assert_eq!(default_drop, rules.len() - 1);
        for ip in &ups {
            let accept = rules
                .position(&RuleMatch::DnsTo { resolver: *ip }, RuleAction::Accept)
                .unwrap();
            prop_assert!(accept < dns_drop);
        }
    }

    #[test]
    fn parse_never_panics(raw in prop::collection::vec(any::<u8>(), 0..2048)) {
        let _ = WhitelistDocument::parse(&raw);
    }
}
