//! DNS sinkhole resolver backends.

mod dnsmasq;
pub mod upstream;

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

pub use dnsmasq::DnsmasqBackend;
pub use upstream::UpstreamDetector;

use crate::cmd_abstraction::SharedExecutor;
use crate::config::ResolverConfig;
use crate::sinkhole::SinkholeConfig;

/// The local DNS process that enforces a [`SinkholeConfig`].
#[async_trait]
pub trait ResolverBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// File the resolver reads its generated configuration from.
    fn config_path(&self) -> &Path;

    /// Render `config` in the resolver's own syntax. Must be deterministic
    /// so fingerprints only change with the policy.
    fn render(&self, config: &SinkholeConfig) -> String;

    /// Syntax-check a candidate file before it is swapped in.
    async fn validate(&self, candidate: &Path) -> Result<()>;

    /// Restart the resolver so it picks up the current config file.
    async fn restart(&self) -> Result<()>;

    async fn is_running(&self) -> bool;
}

pub fn create_resolver(config: &ResolverConfig, executor: SharedExecutor) -> Arc<dyn ResolverBackend> {
    Arc::new(DnsmasqBackend::new(config.clone(), executor))
}
