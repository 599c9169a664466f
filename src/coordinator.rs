//! Enforcement coordinator.
//!
//! Owns the agent state machine and is the only component that touches the
//! resolver config, the firewall table and the state files. Every mutating
//! operation runs under two locks taken without waiting: an in-process
//! mutex and the cross-process lock file. If either is busy the call
//! returns [`Tick::Skipped`] and the caller retries on its next tick.
//!
//! Failure policy is fail-open. Any error while enforcing ends in
//! [`Coordinator::request_fail_open`] semantics: firewall cleared, resolver
//! switched to pass-through, error recorded in the state file.

use anyhow::{Context, Result};
use chrono::Utc;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::enforcer::FirewallBackend;
use crate::error::AgentError;
use crate::fingerprint::{ArtifactKind, Fingerprint, FingerprintStore};
use crate::firewall::{self, FirewallRuleSet};
use crate::lock::LockGuard;
use crate::resolver::{ResolverBackend, UpstreamDetector};
use crate::sinkhole::{self, SinkholeConfig};
use crate::state::{AgentState, PersistedState, StateRepository};
use crate::utils::stage_file;
use crate::whitelist::{Domain, WhitelistDocument};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub whitelist_path: PathBuf,
    /// Always allowed so the agent can still run its own probes.
    pub infrastructure_domains: Vec<Domain>,
}

/// Outcome of a lock-guarded operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick<T> {
    Ran(T),
    /// Another caller held the lock; nothing was done.
    Skipped,
}

impl<T> Tick<T> {
    pub fn ran(self) -> Option<T> {
        match self {
            Tick::Ran(value) => Some(value),
            Tick::Skipped => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Tick::Skipped)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleResult {
    /// State after the cycle.
    pub state: AgentState,
    pub resolver_reloaded: bool,
    pub firewall_reprogrammed: bool,
    /// Browser-relevant policy changed since the last applied cycle.
    pub close_browsers: bool,
    /// Nothing applied because a captive bypass is active.
    pub deferred: bool,
    /// Why the cycle ended in fail-open, if it did.
    pub failure: Option<String>,
}

impl CycleResult {
    fn deferred(state: AgentState) -> Self {
        Self {
            state,
            deferred: true,
            ..Self::default()
        }
    }

    fn failed_open(state: AgentState, reason: impl Into<String>) -> Self {
        Self {
            state,
            failure: Some(reason.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: AgentState,
    pub to: AgentState,
}

impl Transition {
    fn unchanged(state: AgentState) -> Self {
        Self {
            from: state,
            to: state,
        }
    }

    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// What a resolver recovery attempt did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recovery {
    pub resolver_restarted: bool,
    pub upstreams_changed: bool,
}

struct Exclusive<'a> {
    _serial: MutexGuard<'a, ()>,
    _file: LockGuard,
}

pub struct Coordinator {
    settings: CoordinatorSettings,
    repo: StateRepository,
    resolver: Arc<dyn ResolverBackend>,
    firewall: Arc<dyn FirewallBackend>,
    upstreams: UpstreamDetector,
    serial: Mutex<()>,
}

impl Coordinator {
    pub fn new(
        settings: CoordinatorSettings,
        repo: StateRepository,
        resolver: Arc<dyn ResolverBackend>,
        firewall: Arc<dyn FirewallBackend>,
        upstreams: UpstreamDetector,
    ) -> Self {
        Self {
            settings,
            repo,
            resolver,
            firewall,
            upstreams,
            serial: Mutex::new(()),
        }
    }

    pub fn repository(&self) -> &StateRepository {
        &self.repo
    }

    pub fn resolver(&self) -> &Arc<dyn ResolverBackend> {
        &self.resolver
    }

    pub fn firewall(&self) -> &Arc<dyn FirewallBackend> {
        &self.firewall
    }

    fn exclusive(&self) -> Result<Option<Exclusive<'_>>> {
        let serial = match self.serial.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Coordinator busy in this process, skipping");
                return Ok(None);
            }
        };
        let file = LockGuard::try_acquire(&self.repo.lock_path())?;
        Ok(file.map(|file| Exclusive {
            _serial: serial,
            _file: file,
        }))
    }

    fn load_state(&self) -> PersistedState {
        match self.repo.load() {
            Ok(state) => state,
            Err(e) => {
                warn!("Unreadable state file, starting from fail-open: {:#}", e);
                PersistedState::default()
            }
        }
    }

    /// Current persisted state, read without the lock.
    pub fn snapshot(&self) -> PersistedState {
        self.load_state()
    }

    pub fn current_state(&self) -> AgentState {
        self.load_state().state
    }

    /// Read and parse the cached whitelist.
    pub fn load_document(&self) -> Result<WhitelistDocument, AgentError> {
        let path = &self.settings.whitelist_path;
        let raw = std::fs::read(path)
            .map_err(|e| AgentError::Whitelist(format!("cannot read {:?}: {}", path, e)))?;
        let doc = WhitelistDocument::parse(&raw).map_err(|e| AgentError::Whitelist(e.to_string()))?;
        if doc.skipped_lines() > 0 {
            warn!("{} malformed whitelist lines skipped", doc.skipped_lines());
        }
        Ok(doc)
    }

    /// Apply `doc` against `upstreams`, touching only artifacts whose
    /// fingerprint changed. Deferred while a captive bypass is active.
    pub async fn apply_cycle(
        &self,
        doc: &WhitelistDocument,
        upstreams: &[IpAddr],
    ) -> Result<Tick<CycleResult>> {
        let Some(_guard) = self.exclusive()? else {
            return Ok(Tick::Skipped);
        };
        let mut state = self.load_state();
        if state.state == AgentState::CaptiveBypass {
            info!("Captive bypass active, deferring enforcement cycle");
            return Ok(Tick::Ran(CycleResult::deferred(state.state)));
        }
        Ok(Tick::Ran(self.run_cycle(&mut state, doc, upstreams).await?))
    }

    /// Scheduled update: load the cached whitelist, detect upstreams, apply.
    pub async fn scheduled_cycle(&self) -> Result<Tick<CycleResult>> {
        let Some(_guard) = self.exclusive()? else {
            return Ok(Tick::Skipped);
        };
        let mut state = self.load_state();
        if state.state == AgentState::CaptiveBypass {
            info!("Captive bypass active, deferring enforcement cycle");
            return Ok(Tick::Ran(CycleResult::deferred(state.state)));
        }
        let upstreams = self.upstreams.detect(&self.repo);
        Ok(Tick::Ran(self.cycle_from_disk(&mut state, &upstreams).await?))
    }

    /// Drop all restrictions. A no-op when already failed open.
    pub async fn request_fail_open(&self, reason: &str) -> Result<Tick<Transition>> {
        let Some(_guard) = self.exclusive()? else {
            return Ok(Tick::Skipped);
        };
        let mut state = self.load_state();
        let from = state.state;
        if from == AgentState::FailOpen {
            debug!("Already failed open");
            return Ok(Tick::Ran(Transition::unchanged(from)));
        }
        let upstreams = self.upstreams.detect(&self.repo);
        self.enter_fail_open(&mut state, reason, &upstreams, false).await?;
        Ok(Tick::Ran(Transition {
            from,
            to: state.state,
        }))
    }

    /// Re-validate from disk and enforce if everything checks out.
    pub async fn request_enforcing(&self) -> Result<Tick<CycleResult>> {
        let Some(_guard) = self.exclusive()? else {
            return Ok(Tick::Skipped);
        };
        let mut state = self.load_state();
        if state.state == AgentState::CaptiveBypass {
            info!("Captive bypass active, will resume to enforcing");
            state.resume_state = Some(AgentState::Enforcing);
            self.repo.save(&state)?;
            return Ok(Tick::Ran(CycleResult::deferred(state.state)));
        }
        let upstreams = self.upstreams.detect(&self.repo);
        Ok(Tick::Ran(self.cycle_from_disk(&mut state, &upstreams).await?))
    }

    /// Suspend enforcement so a captive portal login can complete.
    pub async fn request_captive_bypass(&self) -> Result<Tick<Transition>> {
        let Some(_guard) = self.exclusive()? else {
            return Ok(Tick::Skipped);
        };
        let mut state = self.load_state();
        let from = state.state;
        if from == AgentState::CaptiveBypass {
            return Ok(Tick::Ran(Transition::unchanged(from)));
        }

        let upstreams = self.upstreams.detect(&self.repo);
        let mut fingerprints = FingerprintStore::load(self.repo.dir());
        self.open_up(&mut fingerprints, &upstreams, false).await?;

        state.rules_before_bypass = Some(std::mem::take(&mut state.active_rules));
        state.resume_state = Some(from);
        state.transition_to(AgentState::CaptiveBypass);
        self.repo.save(&state)?;
        warn!(from = %from, to = %AgentState::CaptiveBypass, "Captive portal detected, enforcement suspended");

        Ok(Tick::Ran(Transition {
            from,
            to: AgentState::CaptiveBypass,
        }))
    }

    /// Leave the bypass, returning to the state it was entered from.
    pub async fn release_captive_bypass(&self) -> Result<Tick<Transition>> {
        let Some(_guard) = self.exclusive()? else {
            return Ok(Tick::Skipped);
        };
        let mut state = self.load_state();
        let from = state.state;
        if from != AgentState::CaptiveBypass {
            return Ok(Tick::Ran(Transition::unchanged(from)));
        }

        let resume = state.resume_state.take().unwrap_or(AgentState::Enforcing);
        let rules_before = state.rules_before_bypass.take();

        // Artifacts are already in their fail-open shape
        state.transition_to(AgentState::FailOpen);
        info!(from = %from, resume = %resume, "Captive portal authenticated, releasing bypass");

        if resume == AgentState::Enforcing {
            let upstreams = self.upstreams.detect(&self.repo);
            self.cycle_from_disk(&mut state, &upstreams).await?;
            if state.state == AgentState::Enforcing && rules_before.as_ref() != Some(&state.active_rules) {
                info!("Firewall rules differ from before the bypass (network changed)");
            }
        } else {
            self.repo.save(&state)?;
        }

        Ok(Tick::Ran(Transition {
            from,
            to: state.state,
        }))
    }

    /// Restart the resolver and re-detect upstreams; re-applies the policy
    /// when the upstream list changed while enforcing.
    pub async fn recover_resolver(&self) -> Result<Tick<Recovery>> {
        let Some(_guard) = self.exclusive()? else {
            return Ok(Tick::Skipped);
        };
        let mut state = self.load_state();
        let mut recovery = Recovery::default();
        if state.state == AgentState::CaptiveBypass {
            return Ok(Tick::Ran(recovery));
        }

        match self.resolver.restart().await {
            Ok(()) => recovery.resolver_restarted = true,
            Err(e) => warn!("Resolver restart failed: {:#}", e),
        }

        let before = self.repo.load_upstreams();
        let upstreams = self.upstreams.detect(&self.repo);
        if upstreams != before {
            recovery.upstreams_changed = true;
            if state.state == AgentState::Enforcing {
                info!("Upstream resolvers changed, re-applying policy");
                self.cycle_from_disk(&mut state, &upstreams).await?;
            }
        }
        Ok(Tick::Ran(recovery))
    }

    /// Reprogram the firewall if the enforcing rules went missing.
    /// Returns whether a repair was made.
    pub async fn repair_firewall(&self) -> Result<Tick<bool>> {
        let Some(_guard) = self.exclusive()? else {
            return Ok(Tick::Skipped);
        };
        let mut state = self.load_state();
        if state.state != AgentState::Enforcing {
            return Ok(Tick::Ran(false));
        }
        if self.firewall.is_enforcing().await.unwrap_or(false) {
            return Ok(Tick::Ran(false));
        }

        warn!("Enforcing firewall rules are missing, reprogramming");
        let upstreams = self.upstreams.detect(&self.repo);
        let rules = if state.active_rules.is_accept_all() {
            firewall::build(AgentState::Enforcing, &upstreams)
        } else {
            state.active_rules.clone()
        };

        match self.firewall.apply(&rules).await {
            Ok(()) => {
                state.active_rules = rules;
                self.repo.save(&state)?;
                Ok(Tick::Ran(true))
            }
            Err(e) => {
                let err = AgentError::apply("firewall", format!("{:#}", e));
                self.fail_open_on(&mut state, err, &upstreams).await?;
                Ok(Tick::Ran(false))
            }
        }
    }

    async fn cycle_from_disk(&self, state: &mut PersistedState, upstreams: &[IpAddr]) -> Result<CycleResult> {
        match self.load_document() {
            Ok(doc) => self.run_cycle(state, &doc, upstreams).await,
            Err(err) => self.fail_open_on(state, err, upstreams).await,
        }
    }

    async fn run_cycle(
        &self,
        state: &mut PersistedState,
        doc: &WhitelistDocument,
        upstreams: &[IpAddr],
    ) -> Result<CycleResult> {
        if doc.is_disabled() {
            let reason = "whitelist disabled by kill switch";
            if state.state != AgentState::FailOpen {
                warn!("Whitelist kill switch set, disabling enforcement");
            }
            self.enter_fail_open(state, reason, upstreams, false).await?;
            return Ok(CycleResult::failed_open(state.state, reason));
        }

        match self.enforce(state, doc, upstreams).await {
            Ok(result) => Ok(result),
            Err(err) => self.fail_open_on(state, err, upstreams).await,
        }
    }

    /// The single place errors turn into fail-open.
    async fn fail_open_on(
        &self,
        state: &mut PersistedState,
        err: AgentError,
        upstreams: &[IpAddr],
    ) -> Result<CycleResult> {
        let reason = err.to_string();
        error!("Enforcement failed, failing open: {}", reason);
        // Artifacts may be half-swapped, so fingerprints cannot be trusted
        let force = !matches!(err, AgentError::Whitelist(_));
        self.enter_fail_open(state, &reason, upstreams, force).await?;
        Ok(CycleResult::failed_open(state.state, reason))
    }

    async fn enforce(
        &self,
        state: &mut PersistedState,
        doc: &WhitelistDocument,
        upstreams: &[IpAddr],
    ) -> Result<CycleResult, AgentError> {
        let effective = doc.with_additional_domains(self.settings.infrastructure_domains.iter().cloned());
        let sinkhole = sinkhole::generate(&effective, upstreams);
        let rendered = self.resolver.render(&sinkhole);
        let rules = firewall::build(AgentState::Enforcing, upstreams);

        let mut fingerprints = FingerprintStore::load(self.repo.dir());
        let resolver_fp = Fingerprint::of(rendered.as_bytes());
        let firewall_fp = Fingerprint::of(rules.canonical().as_bytes());
        let browser_fp = browser_policy_fingerprint(doc);

        let mut result = CycleResult {
            state: AgentState::Enforcing,
            ..CycleResult::default()
        };

        // Resolver before firewall: it must answer for the allowed set
        // before DNS egress is narrowed to it
        if fingerprints.has_changed(ArtifactKind::ResolverConfig, &resolver_fp)
            || !self.resolver.config_path().exists()
        {
            debug!("Resolver config changed ({})", resolver_fp.short());
            self.install_resolver_config(&rendered).await?;
            fingerprints.record(ArtifactKind::ResolverConfig, resolver_fp);
            save_fingerprints(&fingerprints)?;
            self.resolver
                .restart()
                .await
                .map_err(|e| AgentError::apply("resolver restart", format!("{:#}", e)))?;
            result.resolver_reloaded = true;
        }

        let installed = self.firewall.is_enforcing().await.unwrap_or(false);
        if fingerprints.has_changed(ArtifactKind::FirewallPolicy, &firewall_fp) || !installed {
            debug!("Firewall policy changed ({}), installed={}", firewall_fp.short(), installed);
            self.firewall
                .apply(&rules)
                .await
                .map_err(|e| AgentError::apply("firewall", format!("{:#}", e)))?;
            fingerprints.record(ArtifactKind::FirewallPolicy, firewall_fp);
            result.firewall_reprogrammed = true;
        }

        if fingerprints.has_changed(ArtifactKind::BrowserPolicy, &browser_fp) {
            // Nothing to close on the very first cycle
            result.close_browsers = fingerprints.get(ArtifactKind::BrowserPolicy).is_some();
            fingerprints.record(ArtifactKind::BrowserPolicy, browser_fp);
        }
        save_fingerprints(&fingerprints)?;

        let previous = state.transition_to(AgentState::Enforcing);
        state.active_rules = rules;
        state.last_cycle = Some(Utc::now());
        state.last_error = None;
        self.repo
            .save(state)
            .map_err(|e| AgentError::State(format!("{:#}", e)))?;

        if previous != AgentState::Enforcing {
            info!(from = %previous, to = %AgentState::Enforcing, "State transition");
        }
        info!(
            resolver_reloaded = result.resolver_reloaded,
            firewall_reprogrammed = result.firewall_reprogrammed,
            allowed = effective.allowed_domains().len(),
            "Enforcement cycle complete"
        );
        Ok(result)
    }

    /// Stage, validate and swap in a resolver config. The live file is
    /// untouched unless validation passes.
    async fn install_resolver_config(&self, rendered: &str) -> Result<(), AgentError> {
        let path = self.resolver.config_path();
        let staged = stage_file(path, rendered.as_bytes())
            .map_err(|e| AgentError::apply("resolver config", format!("{:#}", e)))?;
        self.resolver
            .validate(staged.path())
            .await
            .map_err(|e| AgentError::Validation(format!("{:#}", e)))?;
        staged.persist(path).map_err(|e| AgentError::Io(e.error))?;
        Ok(())
    }

    async fn enter_fail_open(
        &self,
        state: &mut PersistedState,
        reason: &str,
        upstreams: &[IpAddr],
        force: bool,
    ) -> Result<()> {
        if state.state == AgentState::CaptiveBypass {
            // Connectivity is already open; only the landing state changes
            state.resume_state = Some(AgentState::FailOpen);
            state.last_error = Some(reason.to_string());
            self.repo.save(state)?;
            info!("Fail-open requested during captive bypass, will resume to fail-open");
            return Ok(());
        }

        let mut fingerprints = FingerprintStore::load(self.repo.dir());
        self.open_up(&mut fingerprints, upstreams, force).await?;

        let previous = state.transition_to(AgentState::FailOpen);
        state.active_rules = FirewallRuleSet::accept_all();
        state.last_error = Some(reason.to_string());
        self.repo.save(state)?;

        if previous != AgentState::FailOpen {
            warn!(from = %previous, to = %AgentState::FailOpen, reason, "State transition");
        }
        Ok(())
    }

    /// Clear the firewall, then switch the resolver to pass-through.
    ///
    /// Only the firewall step can fail the call: with the firewall open, a
    /// resolver that stays on its old config still leaves the host online
    /// through any upstream.
    async fn open_up(&self, fingerprints: &mut FingerprintStore, upstreams: &[IpAddr], force: bool) -> Result<()> {
        let open = FirewallRuleSet::accept_all();
        let open_fp = Fingerprint::of(open.canonical().as_bytes());
        let installed = self.firewall.is_enforcing().await.unwrap_or(true);
        if force || installed || fingerprints.has_changed(ArtifactKind::FirewallPolicy, &open_fp) {
            self.firewall
                .apply(&open)
                .await
                .context("Failed to clear firewall rules")?;
            fingerprints.record(ArtifactKind::FirewallPolicy, open_fp);
        }

        let rendered = self.resolver.render(&SinkholeConfig::pass_through(upstreams));
        let resolver_fp = Fingerprint::of(rendered.as_bytes());
        if force || fingerprints.has_changed(ArtifactKind::ResolverConfig, &resolver_fp) {
            match self.install_resolver_config(&rendered).await {
                Ok(()) => {
                    fingerprints.record(ArtifactKind::ResolverConfig, resolver_fp);
                    if let Err(e) = self.resolver.restart().await {
                        error!("Resolver restart after pass-through switch failed: {:#}", e);
                    }
                }
                Err(e) => error!("Could not switch resolver to pass-through: {}", e),
            }
        }

        if let Err(e) = fingerprints.save() {
            warn!("Failed to save fingerprints: {:#}", e);
        }
        Ok(())
    }
}

fn save_fingerprints(fingerprints: &FingerprintStore) -> Result<(), AgentError> {
    fingerprints
        .save()
        .map_err(|e| AgentError::State(format!("{:#}", e)))
}

/// Fingerprint of what browsers enforce themselves: domains and paths.
fn browser_policy_fingerprint(doc: &WhitelistDocument) -> Fingerprint {
    let mut canonical = String::new();
    for domain in doc.allowed_domains() {
        canonical.push_str("allow ");
        canonical.push_str(domain.as_str());
        canonical.push('\n');
    }
    for domain in doc.blocked_subdomains() {
        canonical.push_str("block ");
        canonical.push_str(domain.as_str());
        canonical.push('\n');
    }
    for path in doc.blocked_paths() {
        canonical.push_str("path ");
        canonical.push_str(path.as_str());
        canonical.push('\n');
    }
    Fingerprint::of(canonical.as_bytes())
}
