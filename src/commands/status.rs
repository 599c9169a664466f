//! Status command implementation.

use anyhow::Result;
use std::path::Path;

use crate::fingerprint::FingerprintStore;
use crate::state::AgentState;
use crate::utils::format_duration_ago;

/// Run the status command
pub async fn run(config_path: &Path) -> Result<()> {
    let agent = super::build_agent(config_path)?;
    let coordinator = agent.coordinator();
    let repo = coordinator.repository();
    let state = coordinator.snapshot();

    println!();
    println!("OpenPath: {}", state.state.as_str().to_uppercase());
    if let Some(resume) = state.resume_state {
        println!("Resumes to: {} after captive portal login", resume);
    }
    match state.last_cycle {
        Some(at) => println!("Last cycle: {} ({})", at.format("%Y-%m-%d %H:%M:%S UTC"), format_duration_ago(at)),
        None => println!("Last cycle: never"),
    }
    if let Some(at) = state.last_transition {
        println!("Last transition: {}", format_duration_ago(at));
    }
    if let Some(error) = &state.last_error {
        println!("Last error: {}", error);
    }
    println!();

    let resolver = coordinator.resolver();
    println!(
        "Resolver ({}): {}",
        resolver.name(),
        if resolver.is_running().await { "running" } else { "NOT RUNNING" }
    );
    println!("  Config: {:?}", resolver.config_path());

    let firewall = coordinator.firewall();
    let enforcing = match firewall.is_enforcing().await {
        Ok(true) => "enforcing rules installed",
        Ok(false) => "open",
        Err(_) => "unknown (cannot query)",
    };
    println!("Firewall ({}): {}", firewall.name(), enforcing);
    if state.state == AgentState::Enforcing {
        println!("  Rules: {}", state.active_rules.len());
    }

    let upstreams = repo.load_upstreams();
    if upstreams.is_empty() {
        println!("Upstream resolvers: not detected yet");
    } else {
        let list: Vec<String> = upstreams.iter().map(|ip| ip.to_string()).collect();
        println!("Upstream resolvers: {}", list.join(", "));
    }

    let counters = repo.load_counters();
    if counters.worst() > 0 {
        println!(
            "Health: {} liveness / {} resolution failures in a row",
            counters.liveness_failures, counters.resolution_failures
        );
    } else {
        println!("Health: OK");
    }

    let fingerprints = FingerprintStore::load(repo.dir());
    if !fingerprints.entries().is_empty() {
        println!();
        println!("Fingerprints:");
        for (kind, fp) in fingerprints.entries() {
            println!("  {:<16} {}", kind.as_str(), fp.short());
        }
    }
    println!();

    Ok(())
}
