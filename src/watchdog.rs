//! Health watchdog.
//!
//! Each tick checks that the resolver process is alive and that the
//! control domain resolves through it. A failed check triggers one
//! recovery attempt (resolver restart, upstream re-detection) and a
//! re-check before anything is counted, so a single blip heals without a
//! state change. Only `failure_threshold` consecutive counted failures
//! while enforcing move the agent to fail-open.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::coordinator::{Coordinator, Tick};
use crate::dns::query_host;
use crate::error::ProbeError;
use crate::resolver::ResolverBackend;
use crate::state::{AgentState, HealthCounters};

/// Reason passed to the coordinator when the threshold is crossed.
pub const UNHEALTHY_REASON: &str = "resolver unhealthy";

/// The two checks a watchdog tick performs.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn resolver_alive(&self) -> bool;

    /// Resolve `domain` through the local resolver.
    async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>, ProbeError>;
}

/// Checks the real resolver process and queries it on its listen address.
pub struct SystemHealthProbe {
    resolver: Arc<dyn ResolverBackend>,
    server: SocketAddr,
    timeout: Duration,
}

impl SystemHealthProbe {
    pub fn new(resolver: Arc<dyn ResolverBackend>, server: SocketAddr, timeout: Duration) -> Self {
        Self {
            resolver,
            server,
            timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for SystemHealthProbe {
    async fn resolver_alive(&self) -> bool {
        self.resolver.is_running().await
    }

    async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>, ProbeError> {
        query_host(self.server, domain, self.timeout).await
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogSettings {
    pub failure_threshold: u32,
    pub control_domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogOutcome {
    Healthy,
    /// A check failed but the recovery attempt fixed it.
    Recovered,
    /// Counted failure below the threshold, or not enforcing.
    Degraded { failures: u32 },
    FailedOpen,
    /// Healthy again and enforcement was restored.
    ReEnforced,
    /// Captive bypass active; counters left untouched.
    Suspended,
}

#[derive(Debug, Clone)]
pub struct WatchdogReport {
    pub outcome: WatchdogOutcome,
    pub counters: HealthCounters,
    pub state: AgentState,
}

#[derive(Debug)]
enum CheckFailure {
    Liveness,
    Resolution(ProbeError),
}

impl std::fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckFailure::Liveness => f.write_str("resolver process is not running"),
            CheckFailure::Resolution(e) => write!(f, "control domain lookup failed: {}", e),
        }
    }
}

pub struct Watchdog {
    coordinator: Arc<Coordinator>,
    probe: Arc<dyn HealthProbe>,
    settings: WatchdogSettings,
}

impl Watchdog {
    pub fn new(coordinator: Arc<Coordinator>, probe: Arc<dyn HealthProbe>, settings: WatchdogSettings) -> Self {
        Self {
            coordinator,
            probe,
            settings,
        }
    }

    pub async fn tick(&self) -> Result<WatchdogReport> {
        let repo = self.coordinator.repository();
        let mut counters = repo.load_counters();

        let state = self.coordinator.current_state();
        if state == AgentState::CaptiveBypass {
            debug!("Captive bypass active, watchdog suspended");
            return Ok(WatchdogReport {
                outcome: WatchdogOutcome::Suspended,
                counters,
                state,
            });
        }

        if state == AgentState::Enforcing {
            if let Tick::Ran(true) = self.coordinator.repair_firewall().await? {
                info!("Firewall rules restored");
            }
        }

        let outcome = match self.check().await {
            Ok(()) => self.on_healthy(&mut counters, false).await?,
            Err(failure) => {
                warn!("Health check failed: {}, attempting recovery", failure);
                match self.coordinator.recover_resolver().await? {
                    Tick::Ran(recovery) => debug!("Recovery attempt: {:?}", recovery),
                    Tick::Skipped => debug!("Recovery skipped, coordinator busy"),
                }
                match self.check().await {
                    Ok(()) => self.on_healthy(&mut counters, true).await?,
                    Err(failure) => self.on_failure(&mut counters, failure).await?,
                }
            }
        };

        repo.save_counters(&counters)
            .context("Failed to persist health counters")?;

        Ok(WatchdogReport {
            outcome,
            counters,
            state: self.coordinator.current_state(),
        })
    }

    async fn check(&self) -> Result<(), CheckFailure> {
        if !self.probe.resolver_alive().await {
            return Err(CheckFailure::Liveness);
        }
        self.probe
            .resolve(&self.settings.control_domain)
            .await
            .map(|addrs| debug!("{} resolved to {:?}", self.settings.control_domain, addrs))
            .map_err(CheckFailure::Resolution)
    }

    async fn on_healthy(&self, counters: &mut HealthCounters, recovered: bool) -> Result<WatchdogOutcome> {
        if counters.worst() > 0 {
            info!("Resolver healthy again after {} failed checks", counters.worst());
        }
        counters.reset();

        if self.coordinator.current_state() == AgentState::FailOpen {
            info!("Resolver healthy while failed open, attempting to restore enforcement");
            if let Tick::Ran(result) = self.coordinator.request_enforcing().await? {
                if result.state == AgentState::Enforcing {
                    return Ok(WatchdogOutcome::ReEnforced);
                }
                debug!("Enforcement not restored: {:?}", result.failure);
            }
        }

        Ok(if recovered {
            WatchdogOutcome::Recovered
        } else {
            WatchdogOutcome::Healthy
        })
    }

    async fn on_failure(&self, counters: &mut HealthCounters, failure: CheckFailure) -> Result<WatchdogOutcome> {
        let failures = match &failure {
            CheckFailure::Liveness => counters.record_liveness_failure(),
            CheckFailure::Resolution(_) => counters.record_resolution_failure(),
        };
        warn!(
            failures,
            threshold = self.settings.failure_threshold,
            "Health check still failing after recovery: {}",
            failure
        );

        if failures < self.settings.failure_threshold
            || self.coordinator.current_state() != AgentState::Enforcing
        {
            return Ok(WatchdogOutcome::Degraded { failures });
        }

        match self.coordinator.request_fail_open(UNHEALTHY_REASON).await? {
            Tick::Ran(transition) if transition.changed() => Ok(WatchdogOutcome::FailedOpen),
            _ => Ok(WatchdogOutcome::Degraded { failures }),
        }
    }
}
