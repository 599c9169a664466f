//! Configuration management for OpenPath.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::utils::write_atomic;
use crate::whitelist::{is_valid_hostname, Domain};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/openpath/config.yaml";

/// Parse an interval such as "30s", "5m", "1h" or "1d".
/// Requires ASCII-only input to prevent Unicode-related edge cases.
pub fn parse_interval(interval: &str) -> Option<Duration> {
    if !interval.is_ascii() || interval.len() < 2 {
        return None;
    }

    let (num_part, suffix) = interval.split_at(interval.len() - 1);
    let value: u64 = num_part.parse().ok()?;
    if value == 0 {
        return None;
    }
    let seconds = match suffix {
        "s" => value,
        "m" => value.checked_mul(60)?,
        "h" => value.checked_mul(3600)?,
        "d" => value.checked_mul(86_400)?,
        _ => return None,
    };
    Some(Duration::from_secs(seconds))
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding state, fingerprints, upstreams and the lock file
    pub state_dir: PathBuf,

    /// Cached whitelist document
    pub whitelist_path: PathBuf,

    /// Append-only agent log; stderr only when unset
    pub log_file: Option<PathBuf>,

    /// Upstream resolvers; empty means auto-detect
    pub upstream_resolvers: Vec<IpAddr>,

    /// Used when detection finds nothing and nothing was persisted
    pub fallback_resolvers: Vec<IpAddr>,

    pub intervals: Intervals,

    pub watchdog: WatchdogConfig,

    pub captive_portal: CaptivePortalConfig,

    /// Deadline for each network probe, in seconds
    pub probe_timeout_secs: u64,

    pub resolver: ResolverConfig,

    pub firewall: FirewallConfig,

    pub management: ManagementConfig,

    /// Command (program + args) run when browser-relevant policy changes
    pub close_browsers_command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/openpath"),
            whitelist_path: PathBuf::from("/var/lib/openpath/whitelist.txt"),
            log_file: Some(PathBuf::from("/var/log/openpath.log")),
            upstream_resolvers: Vec::new(),
            fallback_resolvers: vec![
                IpAddr::from([8, 8, 8, 8]),
                IpAddr::from([1, 1, 1, 1]),
            ],
            intervals: Intervals::default(),
            watchdog: WatchdogConfig::default(),
            captive_portal: CaptivePortalConfig::default(),
            probe_timeout_secs: 5,
            resolver: ResolverConfig::default(),
            firewall: FirewallConfig::default(),
            management: ManagementConfig::default(),
            close_browsers_command: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load the file if it exists, defaults otherwise.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            warn!("Config file {:?} not found, using defaults", path.as_ref());
            Ok(Self::default())
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("intervals.update", &self.intervals.update),
            ("intervals.watchdog", &self.intervals.watchdog),
            ("intervals.captive", &self.intervals.captive),
        ] {
            if parse_interval(value).is_none() {
                anyhow::bail!(
                    "Invalid {} '{}'. Use format like '30s', '5m', '1h', '1d'",
                    name,
                    value
                );
            }
        }

        if self.watchdog.failure_threshold == 0 {
            anyhow::bail!("watchdog.failure_threshold must be at least 1");
        }

        if !is_valid_hostname(&self.watchdog.control_domain) {
            anyhow::bail!(
                "Invalid watchdog.control_domain '{}'",
                self.watchdog.control_domain
            );
        }

        if !(1..=30).contains(&self.probe_timeout_secs) {
            anyhow::bail!(
                "probe_timeout_secs must be between 1 and 30 (got {})",
                self.probe_timeout_secs
            );
        }

        // Portals only intercept cleartext, an https probe would never see them
        if self.captive_portal.enabled {
            if !self.captive_portal.url.starts_with("http://") {
                anyhow::bail!(
                    "Captive portal probe URL must use plain HTTP: {}",
                    self.captive_portal.url
                );
            }
            if self.captive_portal.host().is_none() {
                anyhow::bail!("Captive portal probe URL has no host: {}", self.captive_portal.url);
            }
        }

        for (name, url) in [
            ("management.whitelist_url", &self.management.whitelist_url),
            ("management.health_url", &self.management.health_url),
        ] {
            if let Some(url) = url {
                if !url.starts_with("https://") {
                    anyhow::bail!("{} must use HTTPS: {}", name, url);
                }
            }
        }

        if self.resolver.service.trim().is_empty() {
            anyhow::bail!("resolver.service must not be empty");
        }

        Ok(())
    }

    /// Save configuration to YAML file atomically
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;
        write_atomic(path.as_ref(), content.as_bytes())
            .with_context(|| format!("Failed to save config file: {:?}", path.as_ref()))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Domains the agent itself must be able to resolve: the control
    /// domain and the captive-portal probe host.
    pub fn infrastructure_domains(&self) -> Vec<Domain> {
        let mut domains = Vec::new();
        if let Ok(domain) = self.watchdog.control_domain.parse() {
            domains.push(domain);
        }
        if self.captive_portal.enabled {
            if let Some(Ok(domain)) = self.captive_portal.host().map(|h| h.parse::<Domain>()) {
                domains.push(domain);
            }
        }
        domains
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Intervals {
    pub update: String,
    pub watchdog: String,
    pub captive: String,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            update: "5m".to_string(),
            watchdog: "1m".to_string(),
            captive: "30s".to_string(),
        }
    }
}

impl Intervals {
    pub fn update(&self) -> Result<Duration> {
        parse_field("intervals.update", &self.update)
    }

    pub fn watchdog(&self) -> Result<Duration> {
        parse_field("intervals.watchdog", &self.watchdog)
    }

    pub fn captive(&self) -> Result<Duration> {
        parse_field("intervals.captive", &self.captive)
    }
}

fn parse_field(name: &str, value: &str) -> Result<Duration> {
    parse_interval(value).with_context(|| format!("Invalid {} '{}'", name, value))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Consecutive failures before falling open
    pub failure_threshold: u32,

    /// Known-good domain resolved through the local resolver on every tick
    pub control_domain: String,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            control_domain: "google.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptivePortalConfig {
    pub enabled: bool,
    pub url: String,
    /// Body returned by the endpoint on an open network (compared trimmed)
    pub expected_body: String,
}

impl Default for CaptivePortalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "http://detectportal.firefox.com/success.txt".to_string(),
            expected_body: "success".to_string(),
        }
    }
}

impl CaptivePortalConfig {
    pub fn host(&self) -> Option<String> {
        reqwest::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Generated dnsmasq drop-in
    pub config_path: PathBuf,

    /// systemd unit restarted after a config swap
    pub service: String,

    pub listen_address: IpAddr,

    pub cache_size: u32,
}

impl ResolverConfig {
    /// Where the local resolver answers queries.
    pub fn query_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, crate::dns::DNS_PORT)
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("/etc/dnsmasq.d/openpath.conf"),
            service: "dnsmasq".to_string(),
            listen_address: IpAddr::from([127, 0, 0, 1]),
            cache_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub backend: FirewallKind,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FirewallKind {
    /// Auto-detect backend (checks nftables first, then iptables)
    #[default]
    Auto,
    Iptables,
    Nftables,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagementConfig {
    /// Where the whitelist document is fetched from
    pub whitelist_url: Option<String>,

    /// Where health reports are posted after each watchdog tick
    pub health_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.watchdog.failure_threshold, 3);
        assert_eq!(config.firewall.backend, FirewallKind::Auto);
        assert!(config.upstream_resolvers.is_empty());
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_interval("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_interval("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_interval("1d"), Some(Duration::from_secs(86_400)));

        assert_eq!(parse_interval("0s"), None);
        assert_eq!(parse_interval("5"), None);
        assert_eq!(parse_interval("m"), None);
        assert_eq!(parse_interval("5x"), None);
        assert_eq!(parse_interval("-5m"), None);
        assert_eq!(parse_interval("5µ"), None);
        assert_eq!(parse_interval("99999999999999999999d"), None);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "upstream_resolvers: [9.9.9.9]\nwatchdog:\n  failure_threshold: 5\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.upstream_resolvers, vec![IpAddr::from([9, 9, 9, 9])]);
        assert_eq!(config.watchdog.failure_threshold, 5);
        assert_eq!(config.watchdog.control_domain, "google.com");
        assert_eq!(config.intervals.captive, "30s");
    }

    #[test]
    fn test_firewall_backend_yaml() {
        let config: Config = serde_yaml::from_str("firewall:\n  backend: iptables\n").unwrap();
        assert_eq!(config.firewall.backend, FirewallKind::Iptables);
    }

    #[test]
    fn test_validation_rejects_https_probe() {
        let mut config = Config::default();
        config.captive_portal.url = "https://detectportal.firefox.com/success.txt".to_string();
        assert!(config.validate().is_err());

        // Not checked when the detector is off
        config.captive_portal.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_http_management() {
        let mut config = Config::default();
        config.management.whitelist_url = Some("http://example.com/whitelist.txt".to_string());
        assert!(config.validate().is_err());

        config.management.whitelist_url = Some("https://example.com/whitelist.txt".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_bounds() {
        let mut config = Config::default();
        config.watchdog.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.probe_timeout_secs = 31;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.intervals.watchdog = "soon".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.watchdog.control_domain = "not a domain".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_infrastructure_domains() {
        let config = Config::default();
        let names: Vec<String> = config
            .infrastructure_domains()
            .iter()
            .map(|d| d.to_string())
            .collect();
        assert_eq!(names, vec!["google.com", "detectportal.firefox.com"]);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = Config::default();
        config.upstream_resolvers = vec![IpAddr::from([192, 168, 1, 1])];
        config.close_browsers_command = vec!["pkill".to_string(), "firefox".to_string()];
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.upstream_resolvers, config.upstream_resolvers);
        assert_eq!(loaded.close_browsers_command, config.close_browsers_command);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_or_default(dir.path().join("missing.yaml")).unwrap();
        assert_eq!(config.probe_timeout_secs, 5);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "probe_timeout_secs: 0\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
