//! Update command: one scheduled update cycle.

use anyhow::Result;
use std::path::Path;

use crate::enforcer::check_root;
use crate::state::AgentState;

/// Run the update command
pub async fn run(config_path: &Path) -> Result<()> {
    check_root()?;

    let agent = super::build_agent(config_path)?;
    let Some(result) = super::report_skipped(agent.update_once().await?) else {
        return Ok(());
    };

    if result.deferred {
        println!("[SKIP] Captive portal bypass active, enforcement deferred");
        return Ok(());
    }

    match result.state {
        AgentState::Enforcing => {
            if !result.resolver_reloaded && !result.firewall_reprogrammed {
                println!("[OK] Whitelist unchanged, nothing to apply");
            } else {
                println!("[OK] Whitelist enforced");
                if result.resolver_reloaded {
                    println!("  Resolver reloaded");
                }
                if result.firewall_reprogrammed {
                    println!("  Firewall reprogrammed");
                }
            }
            if result.close_browsers {
                println!("  Browser policy changed");
            }
        }
        state => {
            println!(
                "[WARN] Agent is {}: {}",
                state,
                result.failure.as_deref().unwrap_or("unknown reason")
            );
        }
    }
    Ok(())
}
