//! Sinkhole rule generation.
//!
//! Turns a [`WhitelistDocument`] into an ordered list of DNS resolution
//! rules. The first rule is always deny-all; every allowed domain of the
//! minimal covering set then gets a forward rule, preceded by explicit
//! denies for its blocked subdomains.

use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;
use tracing::debug;

use crate::whitelist::{Domain, WhitelistDocument};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "rule", rename_all = "kebab-case")]
pub enum SinkholeRule {
    /// Answer every name with no result.
    DenyAll,
    /// Answer this name (and its subdomains) with no result.
    Deny { domain: Domain },
    /// Resolve this name (and its subdomains) through the upstreams, in order.
    Forward {
        domain: Domain,
        upstreams: Vec<IpAddr>,
    },
    /// Resolve everything through the upstreams.
    PassThrough { upstreams: Vec<IpAddr> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkholeConfig {
    rules: Vec<SinkholeRule>,
}

impl SinkholeConfig {
    /// Resolve-everything configuration used by fail-open and captive bypass.
    pub fn pass_through(upstreams: &[IpAddr]) -> Self {
        Self {
            rules: vec![SinkholeRule::PassThrough {
                upstreams: upstreams.to_vec(),
            }],
        }
    }

    pub fn rules(&self) -> &[SinkholeRule] {
        &self.rules
    }

    pub fn is_pass_through(&self) -> bool {
        matches!(self.rules.as_slice(), [SinkholeRule::PassThrough { .. }])
    }

    /// Domains that get a forward rule.
    pub fn forwarded_domains(&self) -> impl Iterator<Item = &Domain> {
        self.rules.iter().filter_map(|r| match r {
            SinkholeRule::Forward { domain, .. } => Some(domain),
            _ => None,
        })
    }
}

/// Minimal set of domains such that every input domain is either in the
/// set or a subdomain of one of its members.
pub fn covering_set(domains: &BTreeSet<Domain>) -> BTreeSet<Domain> {
    let mut ordered: Vec<&Domain> = domains.iter().collect();
    // Shorter names first so parents are kept before their children
    ordered.sort_by(|a, b| label_depth(a).cmp(&label_depth(b)).then_with(|| a.cmp(b)));

    let mut kept: HashSet<&str> = HashSet::with_capacity(ordered.len());
    let mut covering = BTreeSet::new();

    for domain in ordered {
        if is_covered(domain.as_str(), &kept) {
            debug!("Eliding {} (covered by a shorter allowed domain)", domain);
            continue;
        }
        kept.insert(domain.as_str());
        covering.insert(domain.clone());
    }

    covering
}

fn label_depth(domain: &Domain) -> usize {
    domain.as_str().matches('.').count()
}

/// True if `name` or any of its parent names is in `kept`.
fn is_covered(name: &str, kept: &HashSet<&str>) -> bool {
    let mut rest = name;
    loop {
        if kept.contains(rest) {
            return true;
        }
        match rest.find('.') {
            Some(pos) => rest = &rest[pos + 1..],
            None => return false,
        }
    }
}

/// Generate the ordered sinkhole rules for a document.
///
/// A disabled document always yields a pass-through configuration.
pub fn generate(doc: &WhitelistDocument, upstreams: &[IpAddr]) -> SinkholeConfig {
    if doc.is_disabled() {
        return SinkholeConfig::pass_through(upstreams);
    }

    let covering = covering_set(doc.allowed_domains());
    let mut rules = Vec::with_capacity(covering.len() + doc.blocked_subdomains().len() + 1);
    rules.push(SinkholeRule::DenyAll);

    for domain in covering {
        // Denies for this parent must come before its forward rule
        for blocked in doc
            .blocked_subdomains()
            .iter()
            .filter(|b| b.is_subdomain_of(&domain))
        {
            rules.push(SinkholeRule::Deny {
                domain: blocked.clone(),
            });
        }
        rules.push(SinkholeRule::Forward {
            domain,
            upstreams: upstreams.to_vec(),
        });
    }

    SinkholeConfig { rules }
}
