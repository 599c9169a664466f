//! # OpenPath - allow-list enforcement agent for shared Linux endpoints
//!
//! Turns a plain-text whitelist into a deny-all DNS sinkhole plus an
//! egress firewall that only lets DNS reach the local resolver. Built for
//! classroom machines, where losing connectivity is worse than briefly
//! losing enforcement: every unrecoverable error fails open.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        OpenPath                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CLI (clap)                                                 │
//! │    └── Commands: run, update, watchdog, captive, status... │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Agent loops (tokio)                                        │
//! │    ├── Scheduled update  (management fetch + cycle)         │
//! │    ├── Watchdog          (liveness, resolution, repair)     │
//! │    └── Captive detector  (HTTP probe, bypass)               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Coordinator (state machine, lock, fingerprints)            │
//! │    ├── Whitelist → Sinkhole generator → ResolverBackend     │
//! │    └── Firewall rule engine → FirewallBackend               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Backends                                                   │
//! │    ├── DnsmasqBackend                                       │
//! │    └── NftablesBackend / IptablesBackend                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## States
//!
//! - `enforcing`: sinkhole and firewall active
//! - `fail-open`: firewall open, resolver in pass-through
//! - `captive-bypass`: like fail-open, until a captive portal login completes
//!
//! ## Example Usage
//!
//! ```no_run
//! use openpath::agent::Agent;
//! use openpath::config::Config;
//! use openpath::enforcer::check_root;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     check_root()?;
//!
//!     let config = Config::load("/etc/openpath/config.yaml")?;
//!     let agent = Agent::from_config(config)?;
//!
//!     // One update cycle from the cached whitelist
//!     if let Some(result) = agent.update_once().await?.ran() {
//!         println!("Agent is {}", result.state);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`agent`] - Wiring and the periodic loops
//! - [`captive`] - Captive-portal detection
//! - [`cli`] - Command-line interface definitions
//! - [`cmd_abstraction`] - System command execution (mockable)
//! - [`commands`] - CLI command implementations
//! - [`config`] - Configuration parsing and validation
//! - [`coordinator`] - Enforcement state machine
//! - [`dns`] - DNS resolution with timeout
//! - [`enforcer`] - Firewall backends (nftables, iptables)
//! - [`error`] - Error taxonomy
//! - [`fingerprint`] - Artifact change detection
//! - [`firewall`] - Pure firewall rule engine
//! - [`lock`] - Cross-process lock file
//! - [`logging`] - tracing subscriber setup
//! - [`management`] - Management server client
//! - [`resolver`] - DNS sinkhole backends and upstream detection
//! - [`signal`] - Graceful shutdown signal handling
//! - [`sinkhole`] - Sinkhole config generator
//! - [`state`] - Persisted agent state
//! - [`utils`] - Atomic writes and formatting helpers
//! - [`watchdog`] - Resolver health watchdog
//! - [`whitelist`] - Whitelist document model

pub mod agent;
pub mod captive;
pub mod cli;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod dns;
pub mod enforcer;
pub mod error;
pub mod fingerprint;
pub mod firewall;
pub mod lock;
pub mod logging;
pub mod management;
pub mod resolver;
pub mod signal;
pub mod sinkhole;
pub mod state;
pub mod utils;
pub mod watchdog;
pub mod whitelist;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use coordinator::{Coordinator, CycleResult, Tick};
pub use state::AgentState;
