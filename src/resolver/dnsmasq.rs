//! dnsmasq backend.
//!
//! Deny-all is `address=/#/`, which answers every name locally with no
//! record. Allowed domains get a more specific `server=/domain/ip` line;
//! dnsmasq always prefers the longest matching domain, so per-domain
//! forwards and denies win over the catch-all regardless of line order.
//! The rendered order still follows the rule list.

use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::Path;
use tracing::{debug, info};

use super::ResolverBackend;
use crate::cmd_abstraction::{args_to_strings, run_checked, SharedExecutor};
use crate::config::ResolverConfig;
use crate::sinkhole::{SinkholeConfig, SinkholeRule};

pub struct DnsmasqBackend {
    config: ResolverConfig,
    executor: SharedExecutor,
}

impl DnsmasqBackend {
    pub fn new(config: ResolverConfig, executor: SharedExecutor) -> Self {
        Self { config, executor }
    }
}

#[async_trait]
impl ResolverBackend for DnsmasqBackend {
    fn name(&self) -> &'static str {
        "dnsmasq"
    }

    fn config_path(&self) -> &Path {
        &self.config.config_path
    }

    fn render(&self, sinkhole: &SinkholeConfig) -> String {
        let mut out = String::new();
        out.push_str("# Generated by openpath. Manual edits are overwritten.\n");
        out.push_str("no-resolv\n");
        out.push_str("domain-needed\n");
        out.push_str("bind-interfaces\n");
        let _ = writeln!(out, "listen-address={}", self.config.listen_address);
        let _ = writeln!(out, "cache-size={}", self.config.cache_size);

        for rule in sinkhole.rules() {
            match rule {
                SinkholeRule::DenyAll => out.push_str("address=/#/\n"),
                SinkholeRule::Deny { domain } => {
                    let _ = writeln!(out, "address=/{}/", domain);
                }
                SinkholeRule::Forward { domain, upstreams } => {
                    for upstream in upstreams {
                        let _ = writeln!(out, "server=/{}/{}", domain, upstream);
                    }
                }
                SinkholeRule::PassThrough { upstreams } => {
                    for upstream in upstreams {
                        let _ = writeln!(out, "server={}", upstream);
                    }
                }
            }
        }
        out
    }

    async fn validate(&self, candidate: &Path) -> Result<()> {
        let conf = format!("--conf-file={}", candidate.display());
        let output = self
            .executor
            .execute("dnsmasq", &args_to_strings(&["--test", &conf]))?;
        if !output.success {
            // dnsmasq reports syntax problems on stderr
            anyhow::bail!("dnsmasq rejected {:?}: {}", candidate, output.stderr.trim());
        }
        debug!("dnsmasq accepted {:?}", candidate);
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        run_checked(self.executor.as_ref(), "systemctl", &["restart", &self.config.service])?;
        info!("Restarted {}", self.config.service);
        Ok(())
    }

    async fn is_running(&self) -> bool {
        let args = args_to_strings(&["is-active", "--quiet", &self.config.service]);
        self.executor
            .execute("systemctl", &args)
            .map(|o| o.success)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_abstraction::testing::{args_eq, args_has, failed, ok};
    use crate::cmd_abstraction::MockCommandExecutor;
    use crate::sinkhole::generate;
    use crate::whitelist::WhitelistDocument;
    use std::net::IpAddr;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn backend(mock: MockCommandExecutor) -> DnsmasqBackend {
        DnsmasqBackend::new(ResolverConfig::default(), Arc::new(mock))
    }

    fn upstreams() -> Vec<IpAddr> {
        vec!["192.168.1.1".parse().unwrap(), "8.8.8.8".parse().unwrap()]
    }

    #[test]
    fn test_render_enforcing() {
        let doc = WhitelistDocument::parse(
            b"example.com\napi.example.com\n## BLOCKED-SUBDOMAINS\nads.example.com\n",
        )
        .unwrap();
        let rendered = backend(MockCommandExecutor::new()).render(&generate(&doc, &upstreams()));

        assert!(rendered.contains("no-resolv\n"));
        assert!(rendered.contains("listen-address=127.0.0.1\n"));
        assert!(rendered.contains("server=/example.com/192.168.1.1\nserver=/example.com/8.8.8.8\n"));
        assert!(rendered.contains("address=/ads.example.com/\n"));
        assert!(!rendered.contains("api.example.com"));

        let deny_all = rendered.find("address=/#/").unwrap();
        let deny = rendered.find("address=/ads.example.com/").unwrap();
        let forward = rendered.find("server=/example.com/").unwrap();
        assert!(deny_all < deny);
        assert!(deny < forward);
    }

    #[test]
    fn test_render_pass_through() {
        let rendered = backend(MockCommandExecutor::new())
            .render(&SinkholeConfig::pass_through(&upstreams()));
        assert!(!rendered.contains("address=/#/"));
        assert!(rendered.contains("server=192.168.1.1\nserver=8.8.8.8\n"));
    }

    #[test]
    fn test_render_is_deterministic() {
        let doc = WhitelistDocument::parse(b"b.org\na.org\n").unwrap();
        let backend = backend(MockCommandExecutor::new());
        let config = generate(&doc, &upstreams());
        assert_eq!(backend.render(&config), backend.render(&config));
    }

    #[tokio::test]
    async fn test_validate_runs_dnsmasq_test() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|cmd, args| {
                cmd == "dnsmasq" && args_eq(args, &["--test", "--conf-file=/tmp/.tmpabc"])
            })
            .times(1)
            .returning(|_, _| Ok(ok("dnsmasq: syntax check OK.\n")));
        backend(mock)
            .validate(&PathBuf::from("/tmp/.tmpabc"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_validate_failure() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .returning(|_, _| Ok(failed("dnsmasq: bad option at line 7 of /tmp/x")));
        let err = backend(mock)
            .validate(&PathBuf::from("/tmp/x"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad option"));
    }

    #[tokio::test]
    async fn test_restart_and_liveness() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|cmd, args| cmd == "systemctl" && args_eq(args, &["restart", "dnsmasq"]))
            .times(1)
            .returning(|_, _| Ok(ok("")));
        mock.expect_execute()
            .withf(|cmd, args| cmd == "systemctl" && args_has(args, "is-active"))
            .times(1)
            .returning(|_, _| Ok(failed("")));

        let backend = backend(mock);
        backend.restart().await.unwrap();
        assert!(!backend.is_running().await);
    }
}
