//! CLI command implementations.

pub mod captive;
pub mod check;
pub mod enforce;
pub mod fail_open;
pub mod run;
pub mod status;
pub mod update;
pub mod watchdog;

use anyhow::Result;
use std::path::Path;

use crate::agent::Agent;
use crate::config::Config;
use crate::coordinator::Tick;

/// Load the config file, falling back to defaults when it does not exist.
pub fn load_config(config_path: &Path) -> Result<Config> {
    Config::load_or_default(config_path)
}

pub fn build_agent(config_path: &Path) -> Result<Agent> {
    Agent::from_config(load_config(config_path)?)
}

/// Print the standard message for an operation that lost the lock race.
/// Returns the inner value when the operation ran.
pub(crate) fn report_skipped<T>(tick: Tick<T>) -> Option<T> {
    match tick {
        Tick::Ran(value) => Some(value),
        Tick::Skipped => {
            println!("[SKIP] Another OpenPath operation is in progress, try again shortly");
            None
        }
    }
}
