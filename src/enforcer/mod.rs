//! Packet-filter backends (nftables, iptables) for the egress rule set.

mod iptables;
mod nftables;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub use iptables::IptablesBackend;
pub use nftables::NftablesBackend;

use crate::cmd_abstraction::{args_to_strings, SharedExecutor};
use crate::config::FirewallKind;
use crate::firewall::FirewallRuleSet;

/// Trait for firewall backends
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Replace the agent's egress rules with `rules`, atomically where the
    /// backend allows it. An empty rule set leaves all traffic accepted.
    async fn apply(&self, rules: &FirewallRuleSet) -> Result<()>;

    /// Check whether the restrictive egress rules are currently installed.
    async fn is_enforcing(&self) -> Result<bool>;
}

/// Detect available firewall backend
pub fn detect_backend(executor: &SharedExecutor) -> Result<FirewallKind> {
    let probe = args_to_strings(&["--version"]);

    // nftables first (preferred)
    if executor.execute("nft", &probe).map(|o| o.success).unwrap_or(false) {
        return Ok(FirewallKind::Nftables);
    }
    if executor
        .execute("iptables-restore", &probe)
        .map(|o| o.success)
        .unwrap_or(false)
    {
        return Ok(FirewallKind::Iptables);
    }

    anyhow::bail!("No firewall backend available (nft or iptables-restore required)")
}

/// Create a firewall backend based on configuration
pub fn create_backend(kind: FirewallKind, executor: SharedExecutor) -> Result<Arc<dyn FirewallBackend>> {
    let actual = match kind {
        FirewallKind::Auto => detect_backend(&executor)?,
        other => other,
    };
    debug!("Using {:?} firewall backend", actual);

    match actual {
        FirewallKind::Nftables => Ok(Arc::new(NftablesBackend::new(executor))),
        FirewallKind::Iptables => Ok(Arc::new(IptablesBackend::new(executor))),
        FirewallKind::Auto => anyhow::bail!("Firewall backend detection returned auto"),
    }
}

/// Check if running as root (effective UID == 0)
///
/// Programming the packet filter and restarting the resolver service both
/// need it; CAP_NET_ADMIN alone would not cover the latter.
pub fn check_root() -> Result<()> {
    // SAFETY: geteuid() has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        anyhow::bail!("This operation requires root privileges. Please run with sudo.")
    }
    Ok(())
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// In-memory backend recording every applied rule set.
    #[derive(Default)]
    pub struct MockFirewall {
        pub applied: Mutex<Vec<FirewallRuleSet>>,
        pub installed: Mutex<FirewallRuleSet>,
        pub fail_apply: AtomicBool,
        /// Fail only for restrictive rule sets; accept-all still succeeds.
        pub fail_enforcing_apply: AtomicBool,
    }

    impl MockFirewall {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn apply_count(&self) -> usize {
            self.applied.lock().unwrap().len()
        }

        pub fn installed(&self) -> FirewallRuleSet {
            self.installed.lock().unwrap().clone()
        }

        /// Simulate someone flushing the packet filter behind our back.
        pub fn flush_externally(&self) {
            *self.installed.lock().unwrap() = FirewallRuleSet::accept_all();
        }

        pub fn set_fail_apply(&self, fail: bool) {
            self.fail_apply.store(fail, Ordering::SeqCst);
        }

        pub fn set_fail_enforcing_apply(&self, fail: bool) {
            self.fail_enforcing_apply.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl FirewallBackend for MockFirewall {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn apply(&self, rules: &FirewallRuleSet) -> Result<()> {
            if self.fail_apply.load(Ordering::SeqCst)
                || (self.fail_enforcing_apply.load(Ordering::SeqCst) && !rules.is_accept_all())
            {
                anyhow::bail!("mock firewall refused the rule set");
            }
            self.applied.lock().unwrap().push(rules.clone());
            *self.installed.lock().unwrap() = rules.clone();
            Ok(())
        }

        async fn is_enforcing(&self) -> Result<bool> {
            Ok(!self.installed.lock().unwrap().is_accept_all())
        }
    }
}
