//! Run command: the long-lived agent daemon.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::enforcer::check_root;
use crate::signal::{listen_for_signals, ShutdownToken};

/// Run the agent until SIGINT or SIGTERM
pub async fn run(config_path: &Path) -> Result<()> {
    check_root()?;

    let agent = Arc::new(super::build_agent(config_path)?);
    info!("OpenPath {} starting", env!("CARGO_PKG_VERSION"));

    let shutdown = ShutdownToken::new();
    listen_for_signals(shutdown.clone());
    agent.run(shutdown).await
}
