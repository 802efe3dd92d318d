//! Coordinator: the privileged side that owns agent injection.
//!
//! The coordinator guarantees at most one injection in flight per tab,
//! debounces navigation bursts, keeps one liveness port per tab and relays
//! commands from browser events (shortcut, popup) to the agent of the active
//! tab.
//!
//! It never reconnects a channel itself. When a port closes it waits a grace
//! period; if no new port arrived and the tab no longer answers a `ping`, the
//! agent is injected again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::channel::ChannelEnd;
use crate::clock::Clock;
use crate::config::{Config, CoordinatorConfig};
use crate::diagnostics::Diagnostics;
use crate::error::HostError;
use crate::host::{TabHost, TabId};
use crate::message::{AgentRequest, Command, PortMessage, Reply};
use crate::retry::{RetryPolicy, is_retryable_host, with_retry_when};
use crate::runtime::{sleep, with_timeout};
use crate::speed::Speed;
use crate::storage::{
    DEFAULT_SHORTCUT, KeyValueStore, SHORTCUT_KEY, SITE_SETTINGS_KEY, SiteSettings,
    StorageCache, TabSpeedCache, TabSpeedRecord, VERSION_KEY, tab_speed_key,
};
use crate::url_pattern::PatternCache;

/// Keyboard command that opens the in-page speed input.
pub const TOGGLE_SPEED_INPUT_COMMAND: &str = "toggle-speed-input";

// =============================================================================
// Records and outcomes
// =============================================================================

/// Per-tab injection bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InjectionRecord {
    pub tab_id: TabId,
    pub locked: bool,
    pub last_injection_ms: Option<u64>,
    /// Consecutive failed injections.
    pub attempts: u32,
    /// Too many failures; left alone until the tab updates or navigates.
    pub abandoned: bool,
    #[serde(skip)]
    lock_id: u64,
}

impl InjectionRecord {
    #[must_use]
    pub fn new(tab_id: TabId) -> Self {
        Self {
            tab_id,
            locked: false,
            last_injection_ms: None,
            attempts: 0,
            abandoned: false,
            lock_id: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionOutcome {
    Injected,
    /// Another injection for the tab holds the lock.
    AlreadyInFlight,
    /// The host refuses to script this page (browser-internal, web store).
    Refused,
    Failed { attempts: u32 },
    Abandoned,
    /// A navigation arrived too soon after the last injection.
    Debounced,
    /// The tab was cleaned up while the script was running.
    TabClosed,
}

/// `runtime.onInstalled` reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallReason {
    Install,
    Update,
    /// Browser or shared-module update; only re-injection runs.
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShortcutOutcome {
    Delivered(Reply),
    Ignored,
    NoActiveTab,
    ProtectedPage,
    Failed(HostError),
}

struct PortEntry {
    serial: u64,
    end: ChannelEnd,
    watcher: JoinHandle<()>,
}

// =============================================================================
// Coordinator
// =============================================================================

struct CoordinatorInner<H: TabHost> {
    host: Arc<H>,
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
    message_policy: RetryPolicy,
    shortcut_policy: RetryPolicy,
    records: Mutex<HashMap<TabId, InjectionRecord>>,
    ports: Mutex<HashMap<TabId, PortEntry>>,
    grace_timers: Mutex<HashMap<TabId, JoinHandle<()>>>,
    serial: AtomicU64,
    storage: StorageCache<H::Store>,
    tab_speeds: Mutex<TabSpeedCache>,
    spa_patterns: Mutex<PatternCache>,
    diagnostics: Diagnostics,
}

/// Handle to the coordinator. Clones share state.
pub struct Coordinator<H: TabHost> {
    inner: Arc<CoordinatorInner<H>>,
}

impl<H: TabHost> Clone for Coordinator<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: TabHost> std::fmt::Debug for Coordinator<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("records", &lock(&self.inner.records).len())
            .field("ports", &lock(&self.inner.ports).len())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Releases the per-tab injection lock when dropped, including when the
/// injecting future is cancelled.
struct InjectionLock<'a, H: TabHost> {
    coordinator: &'a Coordinator<H>,
    tab: TabId,
    lock_id: u64,
}

impl<H: TabHost> Drop for InjectionLock<'_, H> {
    fn drop(&mut self) {
        let mut records = lock(&self.coordinator.inner.records);
        if let Some(record) = records.get_mut(&self.tab) {
            // The record may have been reset and re-locked by someone else
            if record.lock_id == self.lock_id {
                record.locked = false;
            }
        }
    }
}

impl<H: TabHost> Coordinator<H> {
    #[must_use]
    pub fn new(host: Arc<H>, config: &Config, clock: Arc<dyn Clock>) -> Self {
        let coordinator = config.coordinator.clone();
        let storage = StorageCache::new(host.store(), Arc::clone(&clock), config.storage.cache_ttl_ms);
        let diagnostics = Diagnostics::new("coordinator", config.throttle(), Arc::clone(&clock));
        Self {
            inner: Arc::new(CoordinatorInner {
                host,
                message_policy: coordinator.message_retry.to_policy(),
                shortcut_policy: coordinator.shortcut_retry.to_policy(),
                config: coordinator,
                clock,
                records: Mutex::new(HashMap::new()),
                ports: Mutex::new(HashMap::new()),
                grace_timers: Mutex::new(HashMap::new()),
                serial: AtomicU64::new(0),
                storage,
                tab_speeds: Mutex::new(TabSpeedCache::new(config.storage.cache_ttl_ms)),
                spa_patterns: Mutex::new(PatternCache::new()),
                diagnostics,
            }),
        }
    }

    fn weak(&self) -> Weak<CoordinatorInner<H>> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<CoordinatorInner<H>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn next_serial(&self) -> u64 {
        self.inner.serial.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn message_timeout(&self) -> Duration {
        millis(self.inner.config.message_timeout_ms)
    }

    #[must_use]
    pub fn host(&self) -> &Arc<H> {
        &self.inner.host
    }

    #[must_use]
    pub fn injection_record(&self, tab: TabId) -> Option<InjectionRecord> {
        lock(&self.inner.records).get(&tab).cloned()
    }

    #[must_use]
    pub fn has_port(&self, tab: TabId) -> bool {
        lock(&self.inner.ports).contains_key(&tab)
    }

    #[must_use]
    pub fn port_count(&self) -> usize {
        lock(&self.inner.ports).len()
    }

    // =========================================================================
    // Injection
    // =========================================================================

    fn try_lock(&self, tab: TabId) -> Result<InjectionLock<'_, H>, InjectionOutcome> {
        let now_ms = self.inner.clock.now_ms();
        let lock_id = self.next_serial();
        let mut records = lock(&self.inner.records);
        let record = records
            .entry(tab)
            .or_insert_with(|| InjectionRecord::new(tab));

        if record.abandoned {
            return Err(InjectionOutcome::Abandoned);
        }
        if record.locked {
            return Err(InjectionOutcome::AlreadyInFlight);
        }
        if record.attempts >= self.inner.config.max_injection_attempts {
            warn!(tab_id = %tab, attempts = record.attempts, "Giving up on tab injection");
            *record = InjectionRecord {
                abandoned: true,
                ..InjectionRecord::new(tab)
            };
            return Err(InjectionOutcome::Abandoned);
        }

        record.locked = true;
        record.lock_id = lock_id;
        record.last_injection_ms = Some(now_ms);
        Ok(InjectionLock {
            coordinator: self,
            tab,
            lock_id,
        })
    }

    /// Inject the agent into `tab`, at most once concurrently per tab.
    pub async fn inject_content_script(&self, tab: TabId) -> InjectionOutcome {
        let guard = match self.try_lock(tab) {
            Ok(guard) => guard,
            Err(outcome) => {
                trace!(tab_id = %tab, ?outcome, "Injection skipped");
                return outcome;
            }
        };

        let host = Arc::clone(&self.inner.host);
        let result = with_timeout(self.message_timeout(), host.execute_script(tab)).await;

        let mut records = lock(&self.inner.records);
        let Some(record) = records
            .get_mut(&tab)
            .filter(|record| record.lock_id == guard.lock_id)
        else {
            trace!(tab_id = %tab, "Tab cleaned up during injection");
            return InjectionOutcome::TabClosed;
        };
        match result {
            Ok(()) => {
                record.attempts = 0;
                debug!(tab_id = %tab, "Agent injected");
                InjectionOutcome::Injected
            }
            Err(e) if e.is_protected_page(&self.inner.config.ignored_injection_errors) => {
                trace!(tab_id = %tab, error = %e, "Page cannot be scripted");
                InjectionOutcome::Refused
            }
            Err(e) => {
                record.attempts += 1;
                let attempts = record.attempts;
                drop(records);
                self.inner.diagnostics.warn(
                    "Agent injection failed",
                    &format_args!("tab {tab} attempt {attempts}: {e}"),
                );
                InjectionOutcome::Failed { attempts }
            }
        }
    }

    fn is_debounced(&self, tab: TabId) -> bool {
        let now_ms = self.inner.clock.now_ms();
        lock(&self.inner.records)
            .get(&tab)
            .and_then(|r| r.last_injection_ms)
            .is_some_and(|at| now_ms.saturating_sub(at) < self.inner.config.min_reinject_interval_ms)
    }

    fn clear_abandoned(&self, tab: TabId) {
        if let Some(record) = lock(&self.inner.records).get_mut(&tab) {
            if record.abandoned {
                debug!(tab_id = %tab, "Clearing abandoned injection state");
                record.abandoned = false;
                record.attempts = 0;
            }
        }
    }

    /// Forget everything about `tab`. Safe to call repeatedly.
    pub fn cleanup_tab(&self, tab: TabId) {
        if let Some(timer) = lock(&self.inner.grace_timers).remove(&tab) {
            timer.abort();
        }
        if let Some(entry) = lock(&self.inner.ports).remove(&tab) {
            entry.watcher.abort();
            entry.end.disconnect();
        }
        lock(&self.inner.records).remove(&tab);
        lock(&self.inner.tab_speeds).clear(tab);
        self.inner.storage.clear(&tab_speed_key(tab));
        trace!(tab_id = %tab, "Tab state cleared");
    }

    // =========================================================================
    // Liveness ports
    // =========================================================================

    /// Take ownership of an agent's channel for `tab`, replacing any older
    /// one.
    pub fn accept_channel(&self, tab: TabId, end: ChannelEnd) {
        if let Some(timer) = lock(&self.inner.grace_timers).remove(&tab) {
            timer.abort();
        }

        let serial = self.next_serial();
        let watcher = self.spawn_port_watcher(tab, end.clone(), serial);
        let previous = lock(&self.inner.ports).insert(
            tab,
            PortEntry {
                serial,
                end,
                watcher,
            },
        );
        if let Some(old) = previous {
            old.watcher.abort();
            old.end.disconnect();
        }
        debug!(tab_id = %tab, serial, "Port connected");
    }

    fn spawn_port_watcher(&self, tab: TabId, end: ChannelEnd, serial: u64) -> JoinHandle<()> {
        let weak = self.weak();
        tokio::spawn(async move {
            while let Some(message) = end.recv().await {
                if message == PortMessage::Ping && end.post(PortMessage::Pong { success: true }).is_err() {
                    break;
                }
            }
            if let Some(coordinator) = Self::upgrade(&weak) {
                coordinator.on_port_closed(tab, serial);
            }
        })
    }

    fn on_port_closed(&self, tab: TabId, serial: u64) {
        {
            let mut ports = lock(&self.inner.ports);
            match ports.get(&tab) {
                Some(entry) if entry.serial == serial => {
                    ports.remove(&tab);
                }
                _ => return,
            }
        }
        debug!(tab_id = %tab, serial, "Port disconnected");

        let weak = self.weak();
        let grace = millis(self.inner.config.port_grace_ms);
        let timer = tokio::spawn(async move {
            sleep(grace).await;
            let Some(coordinator) = Self::upgrade(&weak) else {
                return;
            };
            lock(&coordinator.inner.grace_timers).remove(&tab);
            coordinator.check_after_grace(tab).await;
        });
        if let Some(previous) = lock(&self.inner.grace_timers).insert(tab, timer) {
            previous.abort();
        }
    }

    async fn check_after_grace(&self, tab: TabId) {
        if self.has_port(tab) {
            return;
        }
        if self.ping_tab(tab).await {
            trace!(tab_id = %tab, "Agent still answers after port loss");
            return;
        }
        info!(tab_id = %tab, "Agent unreachable after port loss; re-injecting");
        self.inject_content_script(tab).await;
    }

    async fn ping_tab(&self, tab: TabId) -> bool {
        let host = Arc::clone(&self.inner.host);
        with_timeout(self.message_timeout(), host.send_to_tab(tab, Command::Ping))
            .await
            .is_ok_and(|reply| reply.success)
    }

    // =========================================================================
    // Browser events
    // =========================================================================

    /// Committed top-level navigation: clean up, let the page settle, inject.
    pub async fn on_navigation_committed(
        &self,
        tab: TabId,
        url: &str,
        frame_id: u32,
    ) -> Option<InjectionOutcome> {
        if frame_id != 0 {
            return None;
        }
        if self.is_debounced(tab) {
            trace!(tab_id = %tab, url, "Navigation debounced");
            return Some(InjectionOutcome::Debounced);
        }
        self.cleanup_tab(tab);
        sleep(millis(self.inner.config.navigation_settle_ms)).await;
        Some(self.inject_content_script(tab).await)
    }

    /// History API navigation. Only hosts known to tear down their player on
    /// route changes get a (debounced) injection.
    pub async fn on_history_state_updated(
        &self,
        tab: TabId,
        url: &str,
        frame_id: u32,
    ) -> Option<InjectionOutcome> {
        if frame_id != 0 || !self.is_spa_url(url) {
            return None;
        }
        if self.is_debounced(tab) {
            return Some(InjectionOutcome::Debounced);
        }
        Some(self.inject_content_script(tab).await)
    }

    fn is_spa_url(&self, url: &str) -> bool {
        let mut patterns = lock(&self.inner.spa_patterns);
        self.inner
            .config
            .spa_patterns
            .iter()
            .any(|pattern| patterns.matches(pattern, url))
    }

    /// Tab finished loading: make sure an agent answers.
    pub async fn on_tab_updated(&self, tab: TabId, complete: bool) -> Option<InjectionOutcome> {
        if !complete {
            return None;
        }
        self.clear_abandoned(tab);
        match self.send_message_with_retry(tab, Command::Ping).await {
            Ok(reply) if reply.success => None,
            _ => Some(self.inject_content_script(tab).await),
        }
    }

    pub fn on_tab_removed(&self, tab: TabId) {
        self.cleanup_tab(tab);
    }

    /// Seed or migrate storage, then re-inject every scriptable tab.
    pub async fn on_installed(&self, reason: InstallReason) -> Vec<(TabId, InjectionOutcome)> {
        let store = self.inner.host.store();
        let version = self.inner.host.extension_version();
        let seeded = match reason {
            InstallReason::Install => {
                let defaults = [
                    (SHORTCUT_KEY, Value::from(DEFAULT_SHORTCUT)),
                    (SITE_SETTINGS_KEY, SiteSettings::default().to_value()),
                    (VERSION_KEY, Value::from(version.as_str())),
                ];
                let mut result = Ok(());
                for (key, value) in defaults {
                    result = result.and(store.set(key, value).await);
                }
                result
            }
            InstallReason::Update => store.set(VERSION_KEY, Value::from(version.as_str())).await,
            InstallReason::Other => Ok(()),
        };
        match seeded {
            Ok(()) => info!(?reason, version = %version, "Extension settings ready"),
            Err(e) => {
                self.inner.diagnostics.error("Could not write settings", &e);
            }
        }

        let tabs = match self.inner.host.scriptable_tabs().await {
            Ok(tabs) => tabs,
            Err(e) => {
                self.inner.diagnostics.error("Could not list tabs", &e);
                Vec::new()
            }
        };

        let mut outcomes = Vec::with_capacity(tabs.len());
        for tab in tabs {
            self.cleanup_tab(tab.id);
            sleep(millis(self.inner.config.install_spacing_ms)).await;
            outcomes.push((tab.id, self.inject_content_script(tab.id).await));
        }

        self.inner.storage.clear_all();
        outcomes
    }

    /// Keyboard command handler.
    pub async fn on_shortcut(&self, command: &str) -> ShortcutOutcome {
        if command != TOGGLE_SPEED_INPUT_COMMAND {
            return ShortcutOutcome::Ignored;
        }

        let tab = match self.inner.host.active_tab().await {
            Ok(Some(tab)) => tab,
            Ok(None) => return ShortcutOutcome::NoActiveTab,
            Err(e) => {
                self.inner.diagnostics.warn("Could not resolve active tab", &e);
                return ShortcutOutcome::NoActiveTab;
            }
        };
        if self.is_protected_url(&tab.url) {
            return ShortcutOutcome::ProtectedPage;
        }

        let tab_id = tab.id;
        let outcome = with_retry_when(&self.inner.shortcut_policy, is_retryable_host, move || {
            self.toggle_once(tab_id)
        })
        .await;
        match outcome.result {
            Ok(reply) => ShortcutOutcome::Delivered(reply),
            Err(e) => {
                self.inner.diagnostics.error("Shortcut delivery failed", &e);
                ShortcutOutcome::Failed(e)
            }
        }
    }

    async fn toggle_once(&self, tab: TabId) -> Result<Reply, HostError> {
        if !self.ping_tab(tab).await {
            match self.inject_content_script(tab).await {
                InjectionOutcome::Refused => {
                    return Err(HostError::CannotScript(format!("tab {tab}")));
                }
                _ => sleep(millis(self.inner.config.inject_settle_ms)).await,
            }
        }
        let host = Arc::clone(&self.inner.host);
        with_timeout(
            self.message_timeout(),
            host.send_to_tab(tab, Command::ToggleSpeedInput),
        )
        .await
    }

    #[must_use]
    pub fn is_protected_url(&self, url: &str) -> bool {
        self.inner
            .config
            .protected_schemes
            .iter()
            .any(|scheme| url.starts_with(scheme.as_str()))
    }

    // =========================================================================
    // Popup relays
    // =========================================================================

    /// Popup speed control: forward to the active tab's agent.
    pub async fn set_active_tab_speed(&self, speed: f64) -> Reply {
        let Ok(speed) = Speed::new(speed) else {
            return Reply::invalid_speed();
        };
        let tab = match self.inner.host.active_tab().await {
            Ok(Some(tab)) => tab.id,
            Ok(None) => return Reply::failure("No active tab"),
            Err(e) => return Reply::failure(e.to_string()),
        };
        match self
            .send_message_with_retry(tab, Command::set_speed(speed.get()))
            .await
        {
            Ok(reply) => reply,
            Err(e) => Reply::failure(e.to_string()),
        }
    }

    /// Popup display: the active tab's live speed, else its cached speed.
    pub async fn active_tab_speed(&self) -> Option<Speed> {
        let tab = self.inner.host.active_tab().await.ok().flatten()?.id;
        match self.send_message_with_retry(tab, Command::GetSpeed).await {
            Ok(Reply {
                success: true,
                speed: Some(speed),
                ..
            }) => Speed::new(speed).ok(),
            _ => self.load_tab_speed(tab).await,
        }
    }

    // =========================================================================
    // Agent requests
    // =========================================================================

    /// Answer a one-shot request from the agent in `tab`.
    pub async fn handle_agent_request(&self, tab: Option<TabId>, request: AgentRequest) -> Reply {
        trace!(tab_id = ?tab.map(TabId::get), action = request.action(), "Agent request");
        match (request, tab) {
            (AgentRequest::Ping, _) => Reply::ok(),
            (AgentRequest::ReloadContentScript, Some(tab)) => {
                match self.inject_content_script(tab).await {
                    InjectionOutcome::Injected | InjectionOutcome::AlreadyInFlight => {
                        self.apply_tab_speed(tab).await;
                        Reply::ok()
                    }
                    outcome => Reply::failure(format!("Content script reload failed: {outcome:?}")),
                }
            }
            (AgentRequest::SetSpeed { speed }, Some(tab)) => match Speed::from_json(&speed) {
                Ok(speed) => {
                    self.save_tab_speed(tab, speed).await;
                    Reply::ok()
                }
                Err(_) => Reply::invalid_speed(),
            },
            (AgentRequest::GetSpeed, Some(tab)) => {
                let speed = self.load_tab_speed(tab).await.unwrap_or_default();
                Reply::with_speed(true, speed.get())
            }
            _ => Reply::status(false),
        }
    }

    /// Push the cached tab speed to a freshly injected agent.
    async fn apply_tab_speed(&self, tab: TabId) {
        let Some(speed) = self.load_tab_speed(tab).await else {
            return;
        };
        if let Err(e) = self
            .send_message_with_retry(tab, Command::set_speed(speed.get()))
            .await
        {
            self.inner.diagnostics.debug("Could not restore tab speed", &e);
        }
    }

    /// One-shot command with timeout and bounded retries.
    pub async fn send_message_with_retry(
        &self,
        tab: TabId,
        command: Command,
    ) -> Result<Reply, HostError> {
        let timeout = self.message_timeout();
        let host = &self.inner.host;
        with_retry_when(&self.inner.message_policy, is_retryable_host, move || {
            with_timeout(timeout, host.send_to_tab(tab, command.clone()))
        })
        .await
        .result
    }

    // =========================================================================
    // Tab speeds
    // =========================================================================

    /// Last speed recorded for `tab`: memory first, then storage.
    pub async fn load_tab_speed(&self, tab: TabId) -> Option<Speed> {
        let now_ms = self.inner.clock.now_ms();
        if let Some(speed) = lock(&self.inner.tab_speeds).get(tab, now_ms) {
            return Some(speed);
        }

        let key = tab_speed_key(tab);
        let value = match self.inner.storage.get(&key).await {
            Ok(value) => value?,
            Err(e) => {
                self.inner.diagnostics.debug("Could not read tab speed", &e);
                return None;
            }
        };
        let record: TabSpeedRecord = match serde_json::from_value(value) {
            Ok(record) => record,
            Err(e) => {
                self.inner.diagnostics.warn("Malformed tab speed entry", &e);
                return None;
            }
        };
        let speed = Speed::new(record.speed).ok()?;
        lock(&self.inner.tab_speeds).set(tab, speed, self.inner.clock.now_ms());
        Some(speed)
    }

    pub async fn save_tab_speed(&self, tab: TabId, speed: Speed) {
        lock(&self.inner.tab_speeds).set(tab, speed, self.inner.clock.now_ms());
        let record = TabSpeedRecord {
            speed: speed.get(),
            timestamp: epoch_ms(),
        };
        let value = match serde_json::to_value(record) {
            Ok(value) => value,
            Err(e) => {
                self.inner.diagnostics.error("Could not encode tab speed", &e);
                return;
            }
        };
        if let Err(e) = self.inner.storage.set(&tab_speed_key(tab), value).await {
            self.inner.diagnostics.warn("Could not persist tab speed", &e);
        }
    }

    /// Stop every port watcher and grace timer.
    pub fn shutdown(&self) {
        for (_, timer) in lock(&self.inner.grace_timers).drain() {
            timer.abort();
        }
        for (_, entry) in lock(&self.inner.ports).drain() {
            entry.watcher.abort();
            entry.end.disconnect();
        }
    }
}
