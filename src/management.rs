//! Management server client: whitelist download and health reports.
//!
//! Network loss is never fatal here. A failed download keeps the cached
//! whitelist, a failed health report is logged and dropped.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ManagementConfig;
use crate::state::{AgentState, HealthCounters};
use crate::utils::write_atomic;
use crate::whitelist::{WhitelistDocument, MAX_WHITELIST_SIZE};

const TIMEOUT_SECS: u64 = 30;
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 2000;

/// Body posted to the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub hostname: String,
    pub version: &'static str,
    pub state: AgentState,
    pub healthy: bool,
    pub liveness_failures: u32,
    pub resolution_failures: u32,
    pub last_error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl HealthStatus {
    pub fn new(state: AgentState, counters: HealthCounters, last_error: Option<String>) -> Self {
        Self {
            hostname: hostname(),
            version: env!("CARGO_PKG_VERSION"),
            state,
            healthy: counters.worst() == 0,
            liveness_failures: counters.liveness_failures,
            resolution_failures: counters.resolution_failures,
            last_error,
            timestamp: Utc::now(),
        }
    }
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|h| h.trim().to_string())
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[async_trait]
pub trait ManagementClient: Send + Sync {
    /// Download the raw whitelist document.
    async fn fetch_whitelist(&self) -> Result<Vec<u8>>;

    async fn report_health(&self, status: &HealthStatus) -> Result<()>;
}

/// HTTPS client for the management server.
pub struct HttpManagementClient {
    client: Client,
    config: ManagementConfig,
}

impl HttpManagementClient {
    pub fn new(config: ManagementConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .user_agent(format!("openpath/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, config })
    }

    /// Fetch content with retry logic and a size limit
    async fn fetch_with_retry(&self, url: &str, max_size: usize) -> Result<Vec<u8>> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = RETRY_DELAY_MS * (1 << (attempt - 1));
                debug!("Retry {} after {}ms for {}", attempt, delay, url);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            match self.client.get(url).send().await {
                Ok(response) if response.status().is_success() => {
                    if let Some(content_length) = response.content_length() {
                        if content_length as usize > max_size {
                            anyhow::bail!(
                                "Response too large: {} bytes (max: {} bytes)",
                                content_length,
                                max_size
                            );
                        }
                    }

                    let body = response
                        .bytes()
                        .await
                        .context("Failed to read response body")?;

                    // Content-Length may be absent or wrong
                    if body.len() > max_size {
                        anyhow::bail!(
                            "Downloaded content too large: {} bytes (max: {} bytes)",
                            body.len(),
                            max_size
                        );
                    }
                    return Ok(body.to_vec());
                }
                Ok(response) => last_error = Some(anyhow::anyhow!("HTTP {}", response.status())),
                Err(e) => last_error = Some(e.into()),
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Unknown error")))
    }
}

#[async_trait]
impl ManagementClient for HttpManagementClient {
    async fn fetch_whitelist(&self) -> Result<Vec<u8>> {
        let url = self
            .config
            .whitelist_url
            .as_deref()
            .context("No whitelist_url configured")?;
        self.fetch_with_retry(url, MAX_WHITELIST_SIZE)
            .await
            .with_context(|| format!("Failed to fetch whitelist from {}", url))
    }

    async fn report_health(&self, status: &HealthStatus) -> Result<()> {
        let Some(url) = self.config.health_url.as_deref() else {
            return Ok(());
        };
        let response = self
            .client
            .post(url)
            .json(status)
            .send()
            .await
            .with_context(|| format!("Failed to post health report to {}", url))?;
        if !response.status().is_success() {
            anyhow::bail!("Health report rejected: HTTP {}", response.status());
        }
        Ok(())
    }
}

/// Download the whitelist and replace the cached copy if it changed.
///
/// A download that does not parse as a document is discarded so a broken
/// server response never replaces a good cached policy. Returns whether
/// the cached file changed.
pub async fn refresh_whitelist(client: &dyn ManagementClient, path: &Path) -> Result<bool> {
    let fresh = client.fetch_whitelist().await?;
    WhitelistDocument::parse(&fresh).context("Downloaded whitelist rejected")?;

    if std::fs::read(path).ok().as_deref() == Some(fresh.as_slice()) {
        debug!("Whitelist unchanged");
        return Ok(false);
    }

    write_atomic(path, &fresh).with_context(|| format!("Failed to cache whitelist at {:?}", path))?;
    info!("Cached new whitelist ({} bytes)", fresh.len());
    Ok(true)
}

/// Post a health report, logging instead of failing.
pub async fn report_health_quietly(client: &dyn ManagementClient, status: &HealthStatus) {
    if let Err(e) = client.report_health(status).await {
        warn!("Health report failed: {:#}", e);
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Scripted management server.
    #[derive(Default)]
    pub struct MockManagement {
        pub whitelist: Mutex<Option<Vec<u8>>>,
        pub reports: Mutex<Vec<HealthStatus>>,
    }

    impl MockManagement {
        pub fn serving(body: &str) -> Self {
            Self {
                whitelist: Mutex::new(Some(body.as_bytes().to_vec())),
                ..Self::default()
            }
        }

        pub fn offline() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl ManagementClient for MockManagement {
        async fn fetch_whitelist(&self) -> Result<Vec<u8>> {
            self.whitelist
                .lock()
                .unwrap()
                .clone()
                .context("connection refused")
        }

        async fn report_health(&self, status: &HealthStatus) -> Result<()> {
            self.reports.lock().unwrap().push(status.clone());
            Ok(())
        }
    }
}
