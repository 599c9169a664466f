//! Watchdog command: one health check tick.

use anyhow::Result;
use std::path::Path;

use crate::enforcer::check_root;
use crate::watchdog::WatchdogOutcome;

/// Run the watchdog command
pub async fn run(config_path: &Path) -> Result<()> {
    check_root()?;

    let agent = super::build_agent(config_path)?;
    let report = agent.watchdog_once().await?;

    let summary = match &report.outcome {
        WatchdogOutcome::Healthy => "[OK] Resolver healthy".to_string(),
        WatchdogOutcome::Recovered => "[OK] Resolver recovered after restart".to_string(),
        WatchdogOutcome::Degraded { failures } => format!("[WARN] Resolver unhealthy ({} consecutive failures)", failures),
        WatchdogOutcome::FailedOpen => "[WARN] Resolver unhealthy, enforcement disabled".to_string(),
        WatchdogOutcome::ReEnforced => "[OK] Resolver healthy, enforcement restored".to_string(),
        WatchdogOutcome::Suspended => "[SKIP] Captive portal bypass active".to_string(),
    };
    println!("{}", summary);
    println!("State: {}", report.state);
    Ok(())
}
