//! Check command implementation.

use anyhow::Result;
use std::path::Path;

use crate::config::Config;
use crate::dns::query_host;
use crate::whitelist::{Domain, WhitelistDocument};

/// How the cached whitelist treats a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    /// Covered by an allowed parent but explicitly blocked.
    Blocked,
    NotListed,
    /// Always allowed so the agent's own probes work.
    Infrastructure,
    /// Kill switch set, nothing is filtered.
    Disabled,
}

pub fn verdict(doc: &WhitelistDocument, domain: &Domain, infrastructure: &[Domain]) -> Verdict {
    if doc.is_disabled() {
        return Verdict::Disabled;
    }
    if doc.allows(domain) {
        return Verdict::Allowed;
    }
    if infrastructure.iter().any(|d| domain.is_covered_by(d)) {
        return Verdict::Infrastructure;
    }
    if doc.allowed_domains().iter().any(|d| domain.is_covered_by(d)) {
        Verdict::Blocked
    } else {
        Verdict::NotListed
    }
}

/// Run the check command
pub async fn run(domain_str: &str, config_path: &Path) -> Result<()> {
    let domain: Domain = domain_str
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid domain: {}", domain_str))?;

    let config = Config::load_or_default(config_path)?;
    let raw = std::fs::read(&config.whitelist_path)
        .map_err(|e| anyhow::anyhow!("Cannot read whitelist {:?}: {}", config.whitelist_path, e))?;
    let doc = WhitelistDocument::parse(&raw)?;

    println!();
    match verdict(&doc, &domain, &config.infrastructure_domains()) {
        Verdict::Allowed => println!("{} is ALLOWED", domain),
        Verdict::Blocked => println!("{} is BLOCKED (blocked subdomain)", domain),
        Verdict::NotListed => println!("{} is NOT in the whitelist", domain),
        Verdict::Infrastructure => println!("{} is ALLOWED (agent infrastructure)", domain),
        Verdict::Disabled => println!("{} is not filtered (whitelist disabled)", domain),
    }

    match query_host(config.resolver.query_addr(), domain.as_str(), config.probe_timeout()).await {
        Ok(addrs) => {
            let list: Vec<String> = addrs.iter().map(|ip| ip.to_string()).collect();
            println!("Local resolver answers: {}", list.join(", "));
        }
        Err(e) => println!("Local resolver gives no answer: {}", e),
    }
    println!();

    Ok(())
}
