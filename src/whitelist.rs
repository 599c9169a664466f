//! Whitelist document parsing.
//!
//! The document is plain text with three sections:
//!
//! ```text
//! # DESACTIVADO            <- optional kill switch, first non-blank line only
//! ## WHITELIST
//! example.com
//! *.school.edu             # wildcard prefix is accepted and stripped
//! ## BLOCKED-SUBDOMAINS
//! ads.example.com
//! ## BLOCKED-PATHS
//! example.com/games/*
//! ```
//!
//! Lines before any header belong to `WHITELIST`. Only the three names
//! above are headers; any other `##` line is a comment and keeps the
//! current section. A malformed entry, including one that is not valid
//! UTF-8, only costs that entry: one bad line never invalidates the
//! document.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

use crate::error::ParseError;

/// Token that, in the first non-blank comment line, disables enforcement.
pub const DISABLE_TOKEN: &str = "DESACTIVADO";

/// Maximum accepted size of a raw whitelist (5 MB)
pub const MAX_WHITELIST_SIZE: usize = 5 * 1024 * 1024;

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;
const MAX_PATH_LEN: usize = 2048;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid domain '{0}'")]
pub struct InvalidDomain(pub String);

/// A validated, lowercased hostname.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Domain(String);

impl Domain {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if `self` is a strict subdomain of `parent`.
    pub fn is_subdomain_of(&self, parent: &Domain) -> bool {
        self.0.len() > parent.0.len()
            && self.0.ends_with(parent.as_str())
            && self.0.as_bytes()[self.0.len() - parent.0.len() - 1] == b'.'
    }

    /// True if `self` equals `parent` or is one of its subdomains.
    pub fn is_covered_by(&self, parent: &Domain) -> bool {
        self == parent || self.is_subdomain_of(parent)
    }
}

impl FromStr for Domain {
    type Err = InvalidDomain;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let name = trimmed.strip_prefix("*.").unwrap_or(trimmed);
        let name = name.strip_suffix('.').unwrap_or(name).to_ascii_lowercase();

        if is_valid_hostname(&name) {
            Ok(Self(name))
        } else {
            Err(InvalidDomain(s.to_string()))
        }
    }
}

impl TryFrom<String> for Domain {
    type Error = InvalidDomain;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Domain> for String {
    fn from(domain: Domain) -> Self {
        domain.0
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Conservative hostname grammar: dot-separated labels of `[a-zA-Z0-9-]`,
/// 1-63 chars each, never starting or ending with a hyphen.
pub fn is_valid_hostname(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_DOMAIN_LEN {
        return false;
    }

    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Browser-level path glob, e.g. `example.com/games/*`.
///
/// Only consumed by the browser-policy writer; the agent fingerprints
/// these so path changes can trigger a browser restart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathPattern(String);

impl PathPattern {
    pub fn parse(s: &str) -> Option<Self> {
        let trimmed = s.trim();
        let valid = !trimmed.is_empty()
            && trimmed.len() <= MAX_PATH_LEN
            && trimmed
                .chars()
                .all(|c| c.is_ascii_graphic() && c != '"' && c != '\\');
        valid.then(|| Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Whitelist,
    BlockedSubdomains,
    BlockedPaths,
}

impl Section {
    /// `None` for a `##` line that is just a comment.
    fn from_header(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "WHITELIST" => Some(Section::Whitelist),
            "BLOCKED-SUBDOMAINS" => Some(Section::BlockedSubdomains),
            "BLOCKED-PATHS" => Some(Section::BlockedPaths),
            _ => None,
        }
    }
}

/// Parsed policy document. Immutable: a new fetch produces a new document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WhitelistDocument {
    allowed_domains: BTreeSet<Domain>,
    blocked_subdomains: BTreeSet<Domain>,
    blocked_paths: BTreeSet<PathPattern>,
    disabled: bool,
    skipped_lines: usize,
}

impl WhitelistDocument {
    /// Parse a raw whitelist.
    ///
    /// Only an oversized document is an error. Malformed entries are
    /// skipped with a warning; bytes that are not UTF-8 become U+FFFD, so
    /// such a line fails the entry grammar or stays a comment.
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        if raw.len() > MAX_WHITELIST_SIZE {
            return Err(ParseError::TooLarge {
                size: raw.len(),
                max: MAX_WHITELIST_SIZE,
            });
        }

        let text = String::from_utf8_lossy(raw);
        let text = text.strip_prefix('\u{feff}').unwrap_or(&*text);

        let mut doc = Self {
            disabled: is_disabled(text),
            ..Self::default()
        };

        let mut section = Section::Whitelist;

        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(header) = line.strip_prefix("##") {
                if let Some(next) = Section::from_header(header) {
                    section = next;
                }
                continue;
            }

            // Full-line comment or inline comment
            let entry = line.split('#').next().unwrap_or("").trim();
            if entry.is_empty() {
                continue;
            }

            let accepted = match section {
                Section::Whitelist => entry
                    .parse::<Domain>()
                    .map(|d| doc.allowed_domains.insert(d))
                    .is_ok(),
                Section::BlockedSubdomains => entry
                    .parse::<Domain>()
                    .map(|d| doc.blocked_subdomains.insert(d))
                    .is_ok(),
                Section::BlockedPaths => PathPattern::parse(entry)
                    .map(|p| doc.blocked_paths.insert(p))
                    .is_some(),
            };

            if !accepted {
                warn!("Skipping malformed whitelist entry on line {}: {}", index + 1, entry);
                doc.skipped_lines += 1;
            }
        }

        Ok(doc)
    }

    pub fn allowed_domains(&self) -> &BTreeSet<Domain> {
        &self.allowed_domains
    }

    pub fn blocked_subdomains(&self) -> &BTreeSet<Domain> {
        &self.blocked_subdomains
    }

    pub fn blocked_paths(&self) -> &BTreeSet<PathPattern> {
        &self.blocked_paths
    }

    /// Emergency kill switch: enforcement must not run at all.
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    /// A copy of this document with extra allowed domains merged in.
    pub fn with_additional_domains<I>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = Domain>,
    {
        let mut doc = self.clone();
        doc.allowed_domains.extend(extra);
        doc
    }

    /// Whether a query for `domain` would be answered under this policy.
    pub fn allows(&self, domain: &Domain) -> bool {
        if self.disabled {
            return true;
        }
        let allowed = self.allowed_domains.iter().any(|d| domain.is_covered_by(d));
        let blocked = self
            .blocked_subdomains
            .iter()
            .any(|b| domain.is_covered_by(b));
        allowed && !blocked
    }
}

/// The kill switch only looks at the first non-blank line.
fn is_disabled(text: &str) -> bool {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.strip_prefix('#'))
        .map(|comment| comment.to_ascii_uppercase().contains(DISABLE_TOKEN))
        .unwrap_or(false)
}
