//! Captive command: one captive-portal probe.

use anyhow::Result;
use std::path::Path;

use crate::captive::CaptiveAction;
use crate::enforcer::check_root;

/// Run the captive command
pub async fn run(config_path: &Path) -> Result<()> {
    check_root()?;

    let agent = super::build_agent(config_path)?;
    match agent.captive_once().await? {
        None => println!("Captive portal detection is disabled"),
        Some(CaptiveAction::EnteredBypass) => println!("[WARN] Captive portal detected, enforcement suspended"),
        Some(CaptiveAction::ReleasedBypass) => println!("[OK] Captive portal authenticated, bypass released"),
        Some(CaptiveAction::NoChange) => println!("[OK] No change"),
        Some(CaptiveAction::Skipped) => {
            println!("[SKIP] Another OpenPath operation is in progress, try again shortly")
        }
    }
    println!("State: {}", agent.coordinator().current_state());
    Ok(())
}
