//! Upstream resolver detection.
//!
//! Once the sinkhole is installed, `/etc/resolv.conf` points at it, so the
//! real upstreams come from systemd-resolved's upstream file first. Loopback
//! and stub addresses are never upstreams.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::state::StateRepository;

pub const RESOLV_SOURCES: &[&str] = &["/run/systemd/resolve/resolv.conf", "/etc/resolv.conf"];

/// Extract usable `nameserver` addresses from resolv.conf content.
pub fn parse_nameservers(content: &str) -> Vec<IpAddr> {
    let mut found = Vec::new();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() != Some("nameserver") {
            continue;
        }
        let Some(raw) = fields.next() else { continue };
        // Drop IPv6 zone ids (fe80::1%eth0)
        let raw = raw.split('%').next().unwrap_or(raw);
        match raw.parse::<IpAddr>() {
            Ok(ip) if ip.is_loopback() || ip.is_unspecified() => {
                debug!("Ignoring local nameserver {}", ip);
            }
            Ok(ip) if !found.contains(&ip) => found.push(ip),
            Ok(_) => {}
            Err(_) => debug!("Ignoring unparsable nameserver '{}'", raw),
        }
    }
    found
}

/// Picks the upstream list: configured, detected, persisted, fallback.
#[derive(Debug, Clone)]
pub struct UpstreamDetector {
    configured: Vec<IpAddr>,
    fallback: Vec<IpAddr>,
    sources: Vec<PathBuf>,
}

impl UpstreamDetector {
    pub fn new(configured: Vec<IpAddr>, fallback: Vec<IpAddr>) -> Self {
        Self {
            configured,
            fallback,
            sources: RESOLV_SOURCES.iter().map(PathBuf::from).collect(),
        }
    }

    pub fn with_sources(mut self, sources: Vec<PathBuf>) -> Self {
        self.sources = sources;
        self
    }

    fn detect_from_sources(&self) -> Vec<IpAddr> {
        self.sources
            .iter()
            .find_map(|path| {
                let found = read_nameservers(path);
                (!found.is_empty()).then_some(found)
            })
            .unwrap_or_default()
    }

    /// Determine the upstream list and persist it when it changed.
    pub fn detect(&self, repo: &StateRepository) -> Vec<IpAddr> {
        let persisted = repo.load_upstreams();

        let chosen = if !self.configured.is_empty() {
            self.configured.clone()
        } else {
            let detected = self.detect_from_sources();
            if !detected.is_empty() {
                detected
            } else if !persisted.is_empty() {
                debug!("No upstreams detected, reusing persisted list");
                persisted.clone()
            } else {
                warn!("No upstream resolvers found, using fallback {:?}", self.fallback);
                self.fallback.clone()
            }
        };

        if chosen != persisted {
            info!("Upstream resolvers: {:?}", chosen);
            if let Err(e) = repo.save_upstreams(&chosen) {
                warn!("Failed to persist upstream resolvers: {:#}", e);
            }
        }
        chosen
    }
}

fn read_nameservers(path: &Path) -> Vec<IpAddr> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_nameservers(&content),
        Err(e) => {
            debug!("Cannot read {:?}: {}", path, e);
            Vec::new()
        }
    }
}
