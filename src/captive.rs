//! Captive-portal detector.
//!
//! Probes a cleartext connectivity-check URL. A portal that has not been
//! logged into answers with a redirect or its own page instead of the
//! expected body, and enforcement is suspended until the probe passes
//! again. Network errors are inconclusive and change nothing.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{redirect, Client};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::CaptivePortalConfig;
use crate::coordinator::Coordinator;
use crate::error::ProbeError;
use crate::state::AgentState;

/// Longest portal page read before giving up on the comparison.
const MAX_PROBE_BODY: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeVerdict {
    Authenticated,
    CaptivePortal,
    Inconclusive(ProbeError),
}

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> ProbeVerdict;
}

pub struct HttpConnectivityProbe {
    client: Client,
    url: String,
    expected_body: String,
    timeout: Duration,
}

impl HttpConnectivityProbe {
    pub fn new(config: &CaptivePortalConfig, timeout: Duration) -> Result<Self> {
        // Redirects are the portal's answer, not something to follow.
        // Proxies would hide the portal from the probe.
        let client = Client::builder()
            .timeout(timeout)
            .redirect(redirect::Policy::none())
            .no_proxy()
            .user_agent(format!("openpath/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            url: config.url.clone(),
            expected_body: config.expected_body.clone(),
            timeout,
        })
    }

    fn classify(&self, status: reqwest::StatusCode, body: &[u8]) -> ProbeVerdict {
        if status.is_redirection() {
            debug!("Probe redirected ({})", status);
            return ProbeVerdict::CaptivePortal;
        }
        let body = String::from_utf8_lossy(body);
        if status.is_success() && body.trim() == self.expected_body.trim() {
            ProbeVerdict::Authenticated
        } else {
            debug!("Unexpected probe answer: {} {:?}", status, crate::utils::truncate(body.trim(), 80));
            ProbeVerdict::CaptivePortal
        }
    }
}

#[async_trait]
impl ConnectivityProbe for HttpConnectivityProbe {
    async fn probe(&self) -> ProbeVerdict {
        let response = match self.client.get(&self.url).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return ProbeVerdict::Inconclusive(ProbeError::Timeout(self.timeout.as_secs()))
            }
            Err(e) => return ProbeVerdict::Inconclusive(ProbeError::Network(e.to_string())),
        };

        let status = response.status();
        match read_capped(response).await {
            Ok(Some(body)) => self.classify(status, &body),
            Ok(None) => {
                debug!("Probe answer exceeds {} bytes", MAX_PROBE_BODY);
                ProbeVerdict::CaptivePortal
            }
            Err(e) => ProbeVerdict::Inconclusive(ProbeError::Network(e.to_string())),
        }
    }
}

/// Read the body chunk by chunk. `None` once it grows past the cap.
async fn read_capped(mut response: reqwest::Response) -> reqwest::Result<Option<Vec<u8>>> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > MAX_PROBE_BODY {
            return Ok(None);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(Some(body))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptiveAction {
    EnteredBypass,
    ReleasedBypass,
    NoChange,
    /// Coordinator busy; retried next tick.
    Skipped,
}

pub struct CaptivePortalDetector {
    coordinator: Arc<Coordinator>,
    probe: Arc<dyn ConnectivityProbe>,
}

impl CaptivePortalDetector {
    pub fn new(coordinator: Arc<Coordinator>, probe: Arc<dyn ConnectivityProbe>) -> Self {
        Self { coordinator, probe }
    }

    pub async fn tick(&self) -> Result<CaptiveAction> {
        let verdict = self.probe.probe().await;
        let bypassed = self.coordinator.current_state() == AgentState::CaptiveBypass;

        let tick = match verdict {
            ProbeVerdict::Authenticated if bypassed => {
                self.coordinator.release_captive_bypass().await?.ran().map(|t| {
                    info!(to = %t.to, "Captive bypass released");
                    CaptiveAction::ReleasedBypass
                })
            }
            ProbeVerdict::CaptivePortal if !bypassed => self
                .coordinator
                .request_captive_bypass()
                .await?
                .ran()
                .map(|_| CaptiveAction::EnteredBypass),
            ProbeVerdict::Inconclusive(e) => {
                debug!("Captive portal probe inconclusive: {}", e);
                Some(CaptiveAction::NoChange)
            }
            _ => Some(CaptiveAction::NoChange),
        };
        Ok(tick.unwrap_or(CaptiveAction::Skipped))
    }
}
