//! The long-running agent: wiring plus the three periodic loops.
//!
//! The scheduled update, the watchdog and the captive-portal detector each
//! run on their own interval and talk to the shared [`Coordinator`]. A
//! loop whose tick finds the coordinator busy simply waits for its next
//! tick.

use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::captive::{CaptiveAction, CaptivePortalDetector, HttpConnectivityProbe};
use crate::cmd_abstraction::{RealCommandExecutor, SharedExecutor};
use crate::config::Config;
use crate::coordinator::{Coordinator, CoordinatorSettings, CycleResult, Tick};
use crate::enforcer::create_backend;
use crate::management::{self, HealthStatus, HttpManagementClient, ManagementClient};
use crate::resolver::{create_resolver, UpstreamDetector};
use crate::signal::ShutdownToken;
use crate::state::StateRepository;
use crate::watchdog::{SystemHealthProbe, Watchdog, WatchdogReport, WatchdogSettings};

pub struct Agent {
    config: Config,
    executor: SharedExecutor,
    coordinator: Arc<Coordinator>,
    watchdog: Watchdog,
    captive: Option<CaptivePortalDetector>,
    management: Option<Arc<dyn ManagementClient>>,
}

impl Agent {
    /// Build an agent that drives the real host.
    pub fn from_config(config: Config) -> Result<Self> {
        Self::with_executor(config, RealCommandExecutor::shared())
    }

    pub fn with_executor(config: Config, executor: SharedExecutor) -> Result<Self> {
        let repo = StateRepository::new(&config.state_dir);
        let resolver = create_resolver(&config.resolver, executor.clone());
        let firewall = create_backend(config.firewall.backend, executor.clone())?;
        let upstreams = UpstreamDetector::new(
            config.upstream_resolvers.clone(),
            config.fallback_resolvers.clone(),
        );

        let coordinator = Arc::new(Coordinator::new(
            CoordinatorSettings {
                whitelist_path: config.whitelist_path.clone(),
                infrastructure_domains: config.infrastructure_domains(),
            },
            repo,
            resolver.clone(),
            firewall,
            upstreams,
        ));

        let watchdog = Watchdog::new(
            coordinator.clone(),
            Arc::new(SystemHealthProbe::new(
                resolver,
                config.resolver.query_addr(),
                config.probe_timeout(),
            )),
            WatchdogSettings {
                failure_threshold: config.watchdog.failure_threshold,
                control_domain: config.watchdog.control_domain.clone(),
            },
        );

        let captive = if config.captive_portal.enabled {
            let probe = HttpConnectivityProbe::new(&config.captive_portal, config.probe_timeout())?;
            Some(CaptivePortalDetector::new(coordinator.clone(), Arc::new(probe)))
        } else {
            None
        };

        let management = if config.management.whitelist_url.is_some() || config.management.health_url.is_some() {
            let client: Arc<dyn ManagementClient> = Arc::new(HttpManagementClient::new(config.management.clone())?);
            Some(client)
        } else {
            None
        };

        Ok(Self {
            config,
            executor,
            coordinator,
            watchdog,
            captive,
            management,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// One scheduled update: refresh the cached whitelist if a server is
    /// configured, then run a cycle from the cached copy.
    pub async fn update_once(&self) -> Result<Tick<CycleResult>> {
        if let Some(client) = self.management.as_deref() {
            if self.config.management.whitelist_url.is_some() {
                match management::refresh_whitelist(client, &self.config.whitelist_path).await {
                    Ok(changed) => debug!("Whitelist refreshed (changed: {})", changed),
                    Err(e) => warn!("Whitelist download failed, keeping cached copy: {:#}", e),
                }
            }
        }

        let tick = self.coordinator.scheduled_cycle().await?;
        if let Tick::Ran(result) = &tick {
            if result.close_browsers {
                close_browsers(&self.config.close_browsers_command, &self.executor);
            }
        }
        Ok(tick)
    }

    /// One watchdog tick, followed by a health report when configured.
    pub async fn watchdog_once(&self) -> Result<WatchdogReport> {
        let report = self.watchdog.tick().await?;
        if let Some(client) = self.management.as_deref() {
            if self.config.management.health_url.is_some() {
                let last_error = self.coordinator.snapshot().last_error;
                let status = HealthStatus::new(report.state, report.counters, last_error);
                management::report_health_quietly(client, &status).await;
            }
        }
        Ok(report)
    }

    /// One captive-portal probe. `None` when detection is disabled.
    pub async fn captive_once(&self) -> Result<Option<CaptiveAction>> {
        match &self.captive {
            Some(detector) => Ok(Some(detector.tick().await?)),
            None => Ok(None),
        }
    }

    /// Run all loops until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownToken) -> Result<()> {
        let intervals = &self.config.intervals;
        let update_every = intervals.update()?;
        let watchdog_every = intervals.watchdog()?;
        let captive_every = intervals.captive()?;

        info!(
            update = ?update_every,
            watchdog = ?watchdog_every,
            captive = ?captive_every,
            "Agent started"
        );

        let mut handles = Vec::new();

        let agent = self.clone();
        handles.push(spawn_loop("update", update_every, shutdown.clone(), move || {
            let agent = agent.clone();
            async move {
                match agent.update_once().await {
                    Ok(Tick::Ran(result)) => {
                        if let Some(failure) = result.failure {
                            warn!("Update ended in {}: {}", result.state, failure);
                        }
                    }
                    Ok(Tick::Skipped) => debug!("Update skipped, coordinator busy"),
                    Err(e) => error!("Update failed: {:#}", e),
                }
            }
        }));

        let agent = self.clone();
        handles.push(spawn_loop("watchdog", watchdog_every, shutdown.clone(), move || {
            let agent = agent.clone();
            async move {
                match agent.watchdog_once().await {
                    Ok(report) => debug!("Watchdog: {:?} ({})", report.outcome, report.state),
                    Err(e) => error!("Watchdog tick failed: {:#}", e),
                }
            }
        }));

        if self.captive.is_some() {
            let agent = self.clone();
            handles.push(spawn_loop("captive", captive_every, shutdown.clone(), move || {
                let agent = agent.clone();
                async move {
                    match agent.captive_once().await {
                        Ok(Some(action)) => debug!("Captive portal: {:?}", action),
                        Ok(None) => {}
                        Err(e) => error!("Captive portal tick failed: {:#}", e),
                    }
                }
            }));
        } else {
            info!("Captive portal detection disabled");
        }

        for handle in handles {
            handle.await.context("Agent loop panicked")?;
        }
        info!("Agent stopped");
        Ok(())
    }
}

/// Run `tick` every `period` until `shutdown` fires. A tick in progress
/// always completes.
fn spawn_loop<F, Fut>(name: &'static str, period: Duration, shutdown: ShutdownToken, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => tick().await,
            }
            if shutdown.is_cancelled() {
                break;
            }
        }
        debug!("{} loop stopped", name);
    })
}

/// Run the configured browser-close command. Failures are only logged.
pub fn close_browsers(command: &[String], executor: &SharedExecutor) {
    let Some((program, args)) = command.split_first() else {
        debug!("Browser policy changed, no close command configured");
        return;
    };
    info!("Browser policy changed, running {}", program);
    match executor.execute(program, args) {
        Ok(output) if output.success => {}
        Ok(output) => warn!("{} exited with {:?}: {}", program, output.code, output.stderr.trim()),
        Err(e) => warn!("Failed to run {}: {:#}", program, e),
    }
}
