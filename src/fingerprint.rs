//! Content fingerprints of generated artifacts.
//!
//! A fingerprint only decides whether a disruptive action (resolver
//! restart, firewall reprogram, browser close) is needed. It is never
//! consulted for a security decision.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::utils::write_atomic;

const FINGERPRINT_FILE: &str = "fingerprints.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    ResolverConfig,
    FirewallPolicy,
    BrowserPolicy,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::ResolverConfig => "resolver-config",
            ArtifactKind::FirewallPolicy => "firewall-policy",
            ArtifactKind::BrowserPolicy => "browser-policy",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SHA-256 of an artifact's rendered content, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(content: &[u8]) -> Self {
        Self(format!("{:x}", Sha256::digest(content)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

/// Persisted map of artifact kind to the fingerprint last applied.
#[derive(Debug, Clone)]
pub struct FingerprintStore {
    path: PathBuf,
    entries: BTreeMap<ArtifactKind, Fingerprint>,
}

impl FingerprintStore {
    /// Load the store from `state_dir`. A missing or corrupt file yields an
    /// empty store, which simply makes the next cycle apply everything.
    pub fn load(state_dir: &Path) -> Self {
        let path = state_dir.join(FINGERPRINT_FILE);
        let entries = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        Self { path, entries }
    }

    pub fn get(&self, kind: ArtifactKind) -> Option<&Fingerprint> {
        self.entries.get(&kind)
    }

    pub fn entries(&self) -> &BTreeMap<ArtifactKind, Fingerprint> {
        &self.entries
    }

    /// True if `fingerprint` differs from the stored value (or none is stored).
    pub fn has_changed(&self, kind: ArtifactKind, fingerprint: &Fingerprint) -> bool {
        self.entries.get(&kind) != Some(fingerprint)
    }

    pub fn record(&mut self, kind: ArtifactKind, fingerprint: Fingerprint) {
        self.entries.insert(kind, fingerprint);
    }

    pub fn save(&self) -> Result<()> {
        let content =
            serde_json::to_string_pretty(&self.entries).context("Failed to serialize fingerprints")?;
        write_atomic(&self.path, content.as_bytes())
    }
}
