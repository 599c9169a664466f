//! Fail-open command: manual override that lifts all restrictions.

use anyhow::Result;
use std::path::Path;
use tracing::info;

use crate::enforcer::check_root;
use crate::state::AgentState;

/// Run the fail-open command
pub async fn run(reason: Option<String>, config_path: &Path) -> Result<()> {
    check_root()?;

    let reason = reason.unwrap_or_else(|| "manual override".to_string());
    info!("Failing open: {}", reason);

    let agent = super::build_agent(config_path)?;
    let Some(transition) = super::report_skipped(agent.coordinator().request_fail_open(&reason).await?) else {
        return Ok(());
    };

    if transition.to == AgentState::CaptiveBypass {
        println!("[OK] Captive portal bypass active, will stay open after login");
    } else if transition.changed() {
        println!("[OK] OpenPath failed open (was {})", transition.from);
    } else {
        println!("[OK] OpenPath already {}", transition.to);
    }
    Ok(())
}
