//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Parser)]
#[command(name = "openpath")]
#[command(author, version, about = "Allow-list DNS and firewall enforcement agent")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config: PathBuf,

    /// Quiet mode (for cron/systemd timer)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the agent daemon (update, watchdog and captive-portal loops)
    Run,

    /// Fetch the whitelist and apply it once
    Update,

    /// Run one health check
    Watchdog,

    /// Run one captive-portal probe
    Captive,

    /// Show agent state
    Status,

    /// Check whether a domain is allowed by the cached whitelist
    Check {
        /// Domain to check
        domain: String,
    },

    /// Lift all restrictions until the next successful enforcement
    FailOpen {
        /// Reason recorded in the state file
        reason: Option<String>,
    },

    /// Re-validate the whitelist and enforce it
    Enforce,

    /// Show version
    Version,
}
