//! Enforce command: leave fail-open after re-validating the whitelist.

use anyhow::Result;
use std::path::Path;
use tracing::info;

use crate::enforcer::check_root;
use crate::state::AgentState;

/// Run the enforce command
pub async fn run(config_path: &Path) -> Result<()> {
    check_root()?;

    info!("Requesting enforcement...");
    let agent = super::build_agent(config_path)?;
    let Some(result) = super::report_skipped(agent.coordinator().request_enforcing().await?) else {
        return Ok(());
    };

    if result.deferred {
        println!("[OK] Captive portal bypass active, enforcement resumes after login");
    } else if result.state == AgentState::Enforcing {
        println!("[OK] OpenPath enforcing");
    } else {
        anyhow::bail!(
            "Enforcement failed, agent stays {}: {}",
            result.state,
            result.failure.as_deref().unwrap_or("unknown reason")
        );
    }
    Ok(())
}
