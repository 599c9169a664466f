//! Persistent agent state.
//!
//! Every process (scheduled update, watchdog, captive-portal detector,
//! manual CLI overrides) reads and writes the same files under the state
//! directory, always through [`StateRepository`] and, for writes, while
//! holding the coordinator lock.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::firewall::FirewallRuleSet;
use crate::utils::write_atomic;

const STATE_FILE: &str = "state.json";
const UPSTREAMS_FILE: &str = "upstreams.json";
const HEALTH_FILE: &str = "health.json";
const LOCK_FILE: &str = "openpath.lock";

/// Exactly one is active at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentState {
    Enforcing,
    /// Unrestricted connectivity after an error or the kill switch.
    /// Also the state of a fresh install until the first successful cycle.
    #[default]
    FailOpen,
    /// Enforcement suspended while a captive portal awaits login.
    CaptiveBypass,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Enforcing => "enforcing",
            AgentState::FailOpen => "fail-open",
            AgentState::CaptiveBypass => "captive-bypass",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contents of `state.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistedState {
    pub state: AgentState,
    /// State to return to when the captive bypass is released.
    pub resume_state: Option<AgentState>,
    /// Rule set that was installed when the bypass was entered.
    pub rules_before_bypass: Option<FirewallRuleSet>,
    /// Rule set currently programmed into the packet filter.
    pub active_rules: FirewallRuleSet,
    pub last_cycle: Option<DateTime<Utc>>,
    pub last_transition: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl PersistedState {
    /// Record a transition, keeping the timestamp only when it really changed.
    pub fn transition_to(&mut self, next: AgentState) -> AgentState {
        let previous = self.state;
        if previous != next {
            self.state = next;
            self.last_transition = Some(Utc::now());
        }
        previous
    }
}

/// Consecutive-failure counters owned by the watchdog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCounters {
    pub liveness_failures: u32,
    pub resolution_failures: u32,
}

impl HealthCounters {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn record_liveness_failure(&mut self) -> u32 {
        self.liveness_failures = self.liveness_failures.saturating_add(1);
        self.liveness_failures
    }

    pub fn record_resolution_failure(&mut self) -> u32 {
        self.resolution_failures = self.resolution_failures.saturating_add(1);
        self.resolution_failures
    }

    pub fn worst(&self) -> u32 {
        self.liveness_failures.max(self.resolution_failures)
    }
}

/// File-backed access to the agent's persisted state.
#[derive(Debug, Clone)]
pub struct StateRepository {
    dir: PathBuf,
}

impl StateRepository {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    /// Load the agent state. A missing file means a fresh install.
    pub fn load(&self) -> Result<PersistedState> {
        load_json(&self.dir.join(STATE_FILE))
    }

    pub fn save(&self, state: &PersistedState) -> Result<()> {
        save_json(&self.dir.join(STATE_FILE), state)
    }

    pub fn load_upstreams(&self) -> Vec<IpAddr> {
        load_json(&self.dir.join(UPSTREAMS_FILE)).unwrap_or_default()
    }

    pub fn save_upstreams(&self, upstreams: &[IpAddr]) -> Result<()> {
        save_json(&self.dir.join(UPSTREAMS_FILE), &upstreams)
    }

    pub fn load_counters(&self) -> HealthCounters {
        load_json(&self.dir.join(HEALTH_FILE)).unwrap_or_default()
    }

    pub fn save_counters(&self, counters: &HealthCounters) -> Result<()> {
        save_json(&self.dir.join(HEALTH_FILE), counters)
    }
}

fn load_json<T>(path: &Path) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
}

fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)
        .with_context(|| format!("Failed to serialize {:?}", path))?;
    write_atomic(path, content.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fresh_install_is_fail_open() {
        let dir = TempDir::new().unwrap();
        let repo = StateRepository::new(dir.path());
        let state = repo.load().unwrap();
        assert_eq!(state.state, AgentState::FailOpen);
        assert!(state.active_rules.is_accept_all());
    }

    #[test]
    fn test_state_roundtrip() {
        let dir = TempDir::new().unwrap();
        let repo = StateRepository::new(dir.path());

        let mut state = PersistedState::default();
        state.transition_to(AgentState::CaptiveBypass);
        state.resume_state = Some(AgentState::Enforcing);
        state.last_error = Some("boom".to_string());
        repo.save(&state).unwrap();

        assert_eq!(repo.load().unwrap(), state);
    }

    #[test]
    fn test_state_serializes_kebab_case() {
        let json = serde_json::to_string(&AgentState::CaptiveBypass).unwrap();
        assert_eq!(json, "\"captive-bypass\"");
    }

    #[test]
    fn test_transition_timestamp_only_on_change() {
        let mut state = PersistedState::default();
        assert_eq!(state.transition_to(AgentState::FailOpen), AgentState::FailOpen);
        assert!(state.last_transition.is_none());

        assert_eq!(state.transition_to(AgentState::Enforcing), AgentState::FailOpen);
        assert!(state.last_transition.is_some());
    }

    #[test]
    fn test_corrupt_state_is_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(STATE_FILE), "garbage").unwrap();
        let repo = StateRepository::new(dir.path());
        assert!(repo.load().is_err());
    }

    #[test]
    fn test_upstreams_and_counters() {
        let dir = TempDir::new().unwrap();
        let repo = StateRepository::new(dir.path());
        assert!(repo.load_upstreams().is_empty());

        let ups: Vec<IpAddr> = vec!["9.9.9.9".parse().unwrap()];
        repo.save_upstreams(&ups).unwrap();
        assert_eq!(repo.load_upstreams(), ups);

        let mut counters = HealthCounters::default();
        counters.record_resolution_failure();
        counters.record_resolution_failure();
        counters.record_liveness_failure();
        repo.save_counters(&counters).unwrap();
        let loaded = repo.load_counters();
        assert_eq!(loaded.resolution_failures, 2);
        assert_eq!(loaded.worst(), 2);
    }

    #[test]
    fn test_counters_reset() {
        let mut counters = HealthCounters::default();
        counters.record_liveness_failure();
        counters.reset();
        assert_eq!(counters, HealthCounters::default());
    }
}
