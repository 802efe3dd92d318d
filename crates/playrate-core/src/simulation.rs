//! In-memory browser host.
//!
//! [`SimBrowser`] implements [`TabHost`] for the coordinator and hands every
//! page context a [`SimPage`] implementing [`PageHost`]. Agent requests and
//! new channels travel to the coordinator through a pump task, the same way a
//! real runtime dispatches `runtime.sendMessage` and `runtime.connect`.
//!
//! [`Simulation`] wires a browser, a coordinator and the pump together and
//! exposes the browser-side actions tests and the CLI drive: opening tabs,
//! navigating, in-page route changes, severing channels and fault injection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::agent::{AgentStatus, PageAgent};
use crate::channel::{self, ChannelEnd};
use crate::clock::Clock;
use crate::config::Config;
use crate::coordinator::{Coordinator, InjectionRecord, InstallReason};
use crate::error::{HostError, StorageError};
use crate::host::{Document, PageHost, TabHost, TabId, TabInfo, VideoEvent, VideoId};
use crate::message::{AgentRequest, Command, Reply};
use crate::runtime::sleep;
use crate::speed::Speed;
use crate::storage::{KeyValueStore, MemoryStore, SITE_SETTINGS_KEY, SiteSettings};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Schemes the simulated host refuses to script.
const UNSCRIPTABLE_PREFIXES: &[&str] = &["chrome://", "edge://", "about:", "chrome-extension://"];

// =============================================================================
// Faults and stats
// =============================================================================

/// Failure knobs. Counters are consumed one event at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Faults {
    /// Refuse the next N `connect` calls.
    pub refuse_connects: u32,
    /// Drop the next N one-shot messages, in either direction.
    pub drop_messages: u32,
    /// Fail the next N script injections.
    pub fail_injections: u32,
    /// Stall every script injection this long.
    pub injection_delay_ms: u64,
}

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicU64,
    refused_connects: AtomicU64,
    dropped_messages: AtomicU64,
    injections: AtomicU64,
    agents_started: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SimStats {
    pub connects: u64,
    pub refused_connects: u64,
    pub dropped_messages: u64,
    pub injections: u64,
    pub agents_started: u64,
}

// =============================================================================
// Document
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimVideo {
    pub rate: f64,
    pub attached: bool,
    /// Rate writes silently ignored before the element complies.
    pub ignore_writes: u32,
}

impl Default for SimVideo {
    fn default() -> Self {
        Self {
            rate: 1.0,
            attached: true,
            ignore_writes: 0,
        }
    }
}

#[derive(Debug, Default)]
struct DocState {
    url: String,
    videos: IndexMap<VideoId, SimVideo>,
    popup: Option<Speed>,
}

/// A page DOM with video elements and the speed popup.
#[derive(Debug, Default)]
pub struct SimDocument {
    state: Mutex<DocState>,
}

impl SimDocument {
    fn new(url: &str) -> Self {
        Self {
            state: Mutex::new(DocState {
                url: url.to_string(),
                ..DocState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, DocState> {
        lock(&self.state)
    }

    pub fn set_url(&self, url: &str) {
        self.state().url = url.to_string();
    }

    pub fn insert_video(&self, video: VideoId, element: SimVideo) {
        self.state().videos.insert(video, element);
    }

    /// Detach an element. Returns false if it was not in the document.
    pub fn detach_video(&self, video: VideoId) -> bool {
        self.state().videos.shift_remove(&video).is_some()
    }

    /// Write a rate as the page itself would, bypassing `ignore_writes`.
    pub fn page_sets_rate(&self, video: VideoId, rate: f64) -> bool {
        match self.state().videos.get_mut(&video) {
            Some(element) => {
                element.rate = rate;
                true
            }
            None => false,
        }
    }

    pub fn ignore_writes(&self, video: VideoId, count: u32) {
        if let Some(element) = self.state().videos.get_mut(&video) {
            element.ignore_writes = count;
        }
    }

    #[must_use]
    pub fn rates(&self) -> Vec<f64> {
        self.state().videos.values().map(|v| v.rate).collect()
    }

    #[must_use]
    pub fn popup(&self) -> Option<Speed> {
        self.state().popup
    }
}

impl Document for SimDocument {
    fn current_url(&self) -> String {
        self.state().url.clone()
    }

    fn videos(&self) -> Vec<VideoId> {
        self.state()
            .videos
            .iter()
            .filter(|(_, v)| v.attached)
            .map(|(id, _)| *id)
            .collect()
    }

    fn is_attached(&self, video: VideoId) -> bool {
        self.state().videos.get(&video).is_some_and(|v| v.attached)
    }

    fn playback_rate(&self, video: VideoId) -> Option<f64> {
        self.state().videos.get(&video).map(|v| v.rate)
    }

    fn set_playback_rate(&self, video: VideoId, rate: f64) -> bool {
        let mut state = self.state();
        let Some(element) = state.videos.get_mut(&video) else {
            return false;
        };
        if element.ignore_writes > 0 {
            element.ignore_writes -= 1;
        } else {
            element.rate = rate;
        }
        true
    }

    fn show_speed_input(&self, current: Speed) {
        self.state().popup = Some(current);
    }

    fn hide_speed_input(&self) {
        self.state().popup = None;
    }
}

// =============================================================================
// Shared plumbing
// =============================================================================

enum Delivery {
    Request {
        tab: TabId,
        request: AgentRequest,
        reply: oneshot::Sender<Reply>,
    },
    Port {
        tab: TabId,
        end: ChannelEnd,
    },
}

struct Shared {
    store: Arc<MemoryStore>,
    config: Config,
    clock: Arc<dyn Clock>,
    outbox: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    faults: Mutex<Faults>,
    counters: Counters,
    /// Coordinator-side end of each tab's newest channel.
    channels: Mutex<BTreeMap<TabId, ChannelEnd>>,
    next_id: AtomicU64,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn deliver(&self, delivery: Delivery) -> Result<(), HostError> {
        lock(&self.outbox)
            .as_ref()
            .and_then(|tx| tx.send(delivery).ok())
            .ok_or_else(|| HostError::NoReceiver("coordinator is gone".to_string()))
    }

    /// Consume one unit of a fault counter.
    fn take_fault(&self, pick: impl FnOnce(&mut Faults) -> &mut u32) -> bool {
        let mut faults = lock(&self.faults);
        let counter = pick(&mut faults);
        if *counter == 0 {
            return false;
        }
        *counter -= 1;
        true
    }

    fn drop_message(&self) -> bool {
        let dropped = self.take_fault(|f| &mut f.drop_messages);
        if dropped {
            self.counters.dropped_messages.fetch_add(1, Ordering::SeqCst);
        }
        dropped
    }
}

// =============================================================================
// Page host
// =============================================================================

/// One page context in a tab. Navigation replaces it.
pub struct SimPage {
    tab: TabId,
    context_id: u64,
    alive: AtomicBool,
    document: SimDocument,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SimPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimPage")
            .field("tab", &self.tab)
            .field("context_id", &self.context_id)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl SimPage {
    #[must_use]
    pub fn tab(&self) -> TabId {
        self.tab
    }

    #[must_use]
    pub fn context_id(&self) -> u64 {
        self.context_id
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn sim_document(&self) -> &SimDocument {
        &self.document
    }
}

impl PageHost for SimPage {
    type Store = MemoryStore;
    type Document = SimDocument;

    fn store(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.shared.store)
    }

    fn document(&self) -> &SimDocument {
        &self.document
    }

    fn connect(&self, name: &str) -> Result<ChannelEnd, HostError> {
        if !self.is_alive() {
            return Err(HostError::ContextInvalidated);
        }
        if self.shared.take_fault(|f| &mut f.refuse_connects) {
            self.shared.counters.refused_connects.fetch_add(1, Ordering::SeqCst);
            return Err(HostError::ContextInvalidated);
        }

        let (agent_end, coordinator_end) = channel::pair(name);
        lock(&self.shared.channels).insert(self.tab, coordinator_end.clone());
        self.shared.deliver(Delivery::Port {
            tab: self.tab,
            end: coordinator_end,
        })?;
        self.shared.counters.connects.fetch_add(1, Ordering::SeqCst);
        Ok(agent_end)
    }

    async fn send_message(&self, request: AgentRequest) -> Result<Reply, HostError> {
        if !self.is_alive() {
            return Err(HostError::ContextInvalidated);
        }
        if self.shared.drop_message() {
            return Err(HostError::NoReceiver("message dropped".to_string()));
        }
        let (reply, response) = oneshot::channel();
        self.shared.deliver(Delivery::Request {
            tab: self.tab,
            request,
            reply,
        })?;
        response
            .await
            .map_err(|_| HostError::NoReceiver("coordinator dropped the request".to_string()))
    }
}

// =============================================================================
// Browser (tab host)
// =============================================================================

struct SimTab {
    url: String,
    active: bool,
    page: Arc<SimPage>,
    agent: Option<PageAgent<SimPage>>,
}

/// The browser as the coordinator sees it.
pub struct SimBrowser {
    shared: Arc<Shared>,
    version: String,
    tabs: Mutex<BTreeMap<TabId, SimTab>>,
}

impl std::fmt::Debug for SimBrowser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimBrowser")
            .field("version", &self.version)
            .field("tabs", &lock(&self.tabs).len())
            .finish_non_exhaustive()
    }
}

fn is_scriptable(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

impl SimBrowser {
    fn tabs(&self) -> MutexGuard<'_, BTreeMap<TabId, SimTab>> {
        lock(&self.tabs)
    }

    fn new_page(&self, tab: TabId, url: &str) -> Arc<SimPage> {
        Arc::new(SimPage {
            tab,
            context_id: self.shared.next_id(),
            alive: AtomicBool::new(true),
            document: SimDocument::new(url),
            shared: Arc::clone(&self.shared),
        })
    }

    #[must_use]
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.shared.store
    }

    #[must_use]
    pub fn page(&self, tab: TabId) -> Option<Arc<SimPage>> {
        self.tabs().get(&tab).map(|t| Arc::clone(&t.page))
    }

    #[must_use]
    pub fn agent(&self, tab: TabId) -> Option<PageAgent<SimPage>> {
        self.tabs().get(&tab).and_then(|t| t.agent.clone())
    }

    pub fn with_faults(&self, edit: impl FnOnce(&mut Faults)) {
        edit(&mut lock(&self.shared.faults));
    }

    #[must_use]
    pub fn faults(&self) -> Faults {
        *lock(&self.shared.faults)
    }

    #[must_use]
    pub fn stats(&self) -> SimStats {
        let c = &self.shared.counters;
        SimStats {
            connects: c.connects.load(Ordering::SeqCst),
            refused_connects: c.refused_connects.load(Ordering::SeqCst),
            dropped_messages: c.dropped_messages.load(Ordering::SeqCst),
            injections: c.injections.load(Ordering::SeqCst),
            agents_started: c.agents_started.load(Ordering::SeqCst),
        }
    }

    /// Boot an agent in the tab's current page context, unless one runs.
    fn boot_agent(&self, tab: TabId) -> Result<(), HostError> {
        let mut tabs = self.tabs();
        let entry = tabs.get_mut(&tab).ok_or(HostError::TabNotFound(tab.get()))?;

        if entry.agent.as_ref().is_some_and(|a| !a.is_shut_down()) {
            // The script guards against running twice in one context
            return Ok(());
        }

        let config = &self.shared.config;
        let agent = PageAgent::new(
            Arc::clone(&entry.page),
            config.agent.clone(),
            config.throttle(),
            Arc::clone(&self.shared.clock),
        );
        entry.agent = Some(agent.clone());
        drop(tabs);

        self.shared.counters.agents_started.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            agent.start().await;
        });
        Ok(())
    }
}

impl TabHost for SimBrowser {
    type Store = MemoryStore;

    fn store(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.shared.store)
    }

    fn extension_version(&self) -> String {
        self.version.clone()
    }

    async fn execute_script(&self, tab: TabId) -> Result<(), HostError> {
        let url = self
            .tabs()
            .get(&tab)
            .map(|t| t.url.clone())
            .ok_or(HostError::TabNotFound(tab.get()))?;

        let delay = self.faults().injection_delay_ms;
        if delay > 0 {
            sleep(Duration::from_millis(delay)).await;
        }
        if UNSCRIPTABLE_PREFIXES.iter().any(|p| url.starts_with(p)) {
            return Err(HostError::CannotScript(url));
        }
        if self.shared.take_fault(|f| &mut f.fail_injections) {
            return Err(HostError::Other("script injection failed".to_string()));
        }

        self.shared.counters.injections.fetch_add(1, Ordering::SeqCst);
        self.boot_agent(tab)
    }

    async fn send_to_tab(&self, tab: TabId, command: Command) -> Result<Reply, HostError> {
        let agent = {
            let tabs = self.tabs();
            let entry = tabs.get(&tab).ok_or(HostError::TabNotFound(tab.get()))?;
            entry
                .agent
                .clone()
                .filter(|a| !a.is_shut_down())
                .ok_or_else(|| HostError::NoReceiver(format!("tab {tab}")))?
        };
        if self.shared.drop_message() {
            return Err(HostError::NoReceiver("message dropped".to_string()));
        }
        Ok(agent.handle_command(command).await)
    }

    async fn tab(&self, tab: TabId) -> Result<TabInfo, HostError> {
        self.tabs()
            .get(&tab)
            .map(|t| TabInfo {
                id: tab,
                url: t.url.clone(),
                active: t.active,
            })
            .ok_or(HostError::TabNotFound(tab.get()))
    }

    async fn active_tab(&self) -> Result<Option<TabInfo>, HostError> {
        Ok(self.tabs().iter().find(|(_, t)| t.active).map(|(id, t)| TabInfo {
            id: *id,
            url: t.url.clone(),
            active: true,
        }))
    }

    async fn scriptable_tabs(&self) -> Result<Vec<TabInfo>, HostError> {
        Ok(self
            .tabs()
            .iter()
            .filter(|(_, t)| is_scriptable(&t.url))
            .map(|(id, t)| TabInfo {
                id: *id,
                url: t.url.clone(),
                active: t.active,
            })
            .collect())
    }
}

// =============================================================================
// Simulation
// =============================================================================

/// A browser, its coordinator and the message pump between them.
pub struct Simulation {
    browser: Arc<SimBrowser>,
    coordinator: Coordinator<SimBrowser>,
    pump: JoinHandle<()>,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("browser", &self.browser)
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

impl Simulation {
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(config: Config, clock: Arc<dyn Clock>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            store: Arc::new(MemoryStore::new()),
            config: config.clone(),
            clock: Arc::clone(&clock),
            outbox: Mutex::new(Some(tx)),
            faults: Mutex::new(Faults::default()),
            counters: Counters::default(),
            channels: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
        });
        let browser = Arc::new(SimBrowser {
            shared,
            version: crate::VERSION.to_string(),
            tabs: Mutex::new(BTreeMap::new()),
        });
        let coordinator = Coordinator::new(Arc::clone(&browser), &config, clock);

        let pump_coordinator = coordinator.clone();
        let pump = tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                match delivery {
                    Delivery::Port { tab, end } => pump_coordinator.accept_channel(tab, end),
                    Delivery::Request {
                        tab,
                        request,
                        reply,
                    } => {
                        let coordinator = pump_coordinator.clone();
                        tokio::spawn(async move {
                            let response = coordinator.handle_agent_request(Some(tab), request).await;
                            // The agent may have timed out already
                            let _ = reply.send(response);
                        });
                    }
                }
            }
        });

        Self {
            browser,
            coordinator,
            pump,
        }
    }

    #[must_use]
    pub fn browser(&self) -> &Arc<SimBrowser> {
        &self.browser
    }

    #[must_use]
    pub fn coordinator(&self) -> &Coordinator<SimBrowser> {
        &self.coordinator
    }

    #[must_use]
    pub fn agent(&self, tab: TabId) -> Option<PageAgent<SimPage>> {
        self.browser.agent(tab)
    }

    #[must_use]
    pub fn agent_status(&self, tab: TabId) -> Option<AgentStatus> {
        self.agent(tab).map(|a| a.status())
    }

    pub async fn install(&self) {
        self.coordinator.on_installed(InstallReason::Install).await;
    }

    pub async fn set_site_rules(&self, rules: &SiteSettings) -> Result<(), StorageError> {
        self.browser
            .store()
            .set(SITE_SETTINGS_KEY, rules.to_value())
            .await
    }

    /// Open a tab showing `url` with `videos` elements, without loading an
    /// agent. The first tab opened becomes active.
    pub fn open_tab(&self, url: &str, videos: usize) -> TabId {
        let tab = TabId::new(self.browser.shared.next_id());
        let page = self.browser.new_page(tab, url);
        for _ in 0..videos {
            let video = VideoId::new(self.browser.shared.next_id());
            page.document.insert_video(video, SimVideo::default());
        }
        let mut tabs = self.browser.tabs();
        let active = tabs.is_empty();
        tabs.insert(
            tab,
            SimTab {
                url: url.to_string(),
                active,
                page,
                agent: None,
            },
        );
        tab
    }

    pub fn activate(&self, tab: TabId) {
        for (id, entry) in self.browser.tabs().iter_mut() {
            entry.active = *id == tab;
        }
    }

    /// Open a tab and load it.
    pub async fn open_and_load(&self, url: &str, videos: usize) -> TabId {
        let tab = self.open_tab(url, videos);
        self.load(tab).await;
        tab
    }

    /// Page finished loading: the coordinator's navigation and tab-update
    /// handlers run.
    pub async fn load(&self, tab: TabId) {
        let url = self.tab_url(tab).unwrap_or_default();
        self.coordinator.on_navigation_committed(tab, &url, 0).await;
        self.coordinator.on_tab_updated(tab, true).await;
    }

    #[must_use]
    pub fn tab_url(&self, tab: TabId) -> Option<String> {
        self.browser.tabs().get(&tab).map(|t| t.url.clone())
    }

    /// Full navigation: the old page context dies and a new one with
    /// `videos` elements replaces it.
    pub async fn navigate(&self, tab: TabId, url: &str, videos: usize) {
        let page = self.browser.new_page(tab, url);
        for _ in 0..videos {
            let video = VideoId::new(self.browser.shared.next_id());
            page.document.insert_video(video, SimVideo::default());
        }
        let old_agent = {
            let mut tabs = self.browser.tabs();
            let Some(entry) = tabs.get_mut(&tab) else {
                return;
            };
            entry.page.alive.store(false, Ordering::SeqCst);
            entry.url = url.to_string();
            entry.page = page;
            entry.agent.take()
        };
        if let Some(agent) = old_agent {
            agent.shutdown();
        }
        debug!(tab_id = %tab, url, "Navigated");
        self.load(tab).await;
    }

    /// In-page route change through the history API.
    pub async fn push_state(&self, tab: TabId, url: &str) {
        let (page, agent) = {
            let mut tabs = self.browser.tabs();
            let Some(entry) = tabs.get_mut(&tab) else {
                return;
            };
            entry.url = url.to_string();
            (Arc::clone(&entry.page), entry.agent.clone())
        };
        page.document.set_url(url);
        if let Some(agent) = agent {
            agent.notify_url_changed(url).await;
        }
        self.coordinator.on_history_state_updated(tab, url, 0).await;
    }

    pub fn close_tab(&self, tab: TabId) {
        let removed = self.browser.tabs().remove(&tab);
        if let Some(entry) = removed {
            entry.page.alive.store(false, Ordering::SeqCst);
            if let Some(agent) = entry.agent {
                agent.shutdown();
            }
        }
        self.coordinator.on_tab_removed(tab);
    }

    /// Close the tab's current channel from the host side.
    pub fn sever_channel(&self, tab: TabId) -> bool {
        match lock(&self.browser.shared.channels).get(&tab) {
            Some(end) if !end.is_closed() => {
                end.disconnect();
                true
            }
            _ => false,
        }
    }

    /// Add a `<video>` to the tab's page and run the discovery frame.
    pub fn add_video(&self, tab: TabId) -> Option<VideoId> {
        let page = self.browser.page(tab)?;
        let video = VideoId::new(self.browser.shared.next_id());
        page.document.insert_video(video, SimVideo::default());
        if let Some(agent) = self.agent(tab) {
            if agent.notify_video_added(video) {
                agent.on_animation_frame();
            }
        }
        Some(video)
    }

    pub fn remove_video(&self, tab: TabId, video: VideoId) {
        if let Some(page) = self.browser.page(tab) {
            page.document.detach_video(video);
        }
        if let Some(agent) = self.agent(tab) {
            agent.notify_video_removed(video);
        }
    }

    /// The page script changes a video's rate and the element fires
    /// `ratechange`.
    pub fn page_sets_rate(&self, tab: TabId, video: VideoId, rate: f64) {
        if let Some(page) = self.browser.page(tab) {
            page.document.page_sets_rate(video, rate);
        }
        if let Some(agent) = self.agent(tab) {
            agent.on_video_event(video, VideoEvent::RateChange);
        }
    }

    #[must_use]
    pub fn video_rates(&self, tab: TabId) -> Vec<f64> {
        self.browser
            .page(tab)
            .map(|p| p.document.rates())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn videos(&self, tab: TabId) -> Vec<VideoId> {
        self.browser
            .page(tab)
            .map(|p| p.document.videos())
            .unwrap_or_default()
    }

    /// Poll `check` every 10ms until it holds or `timeout` passes.
    pub async fn wait_until(&self, timeout: Duration, mut check: impl FnMut(&Self) -> bool) -> bool {
        let step = Duration::from_millis(10);
        let mut waited = Duration::ZERO;
        loop {
            if check(self) {
                return true;
            }
            if waited >= timeout {
                return false;
            }
            sleep(step).await;
            waited += step;
        }
    }

    /// Wait for the tab's agent to finish starting and hold a valid channel.
    pub async fn wait_connected(&self, tab: TabId, timeout: Duration) -> bool {
        self.wait_until(timeout, |sim| {
            sim.agent_status(tab)
                .is_some_and(|s| s.initialized && s.connection_valid && !s.recovering)
        })
        .await
    }

    pub fn shutdown(&self) {
        for entry in self.browser.tabs().values() {
            if let Some(agent) = &entry.agent {
                agent.shutdown();
            }
        }
        self.coordinator.shutdown();
        lock(&self.browser.shared.outbox).take();
        self.pump.abort();
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Scenario
// =============================================================================

/// One scripted run: install, load a page, then break the channel
/// `closures` times under the configured faults.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub url: String,
    pub rules: SiteSettings,
    pub videos: usize,
    pub drops: u32,
    pub fail_connects: u32,
    pub closures: u32,
    pub settle_timeout: Duration,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            url: "https://example.com/watch".to_string(),
            rules: SiteSettings::default(),
            videos: 1,
            drops: 0,
            fail_connects: 0,
            closures: 1,
            settle_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub url: String,
    pub tab_id: TabId,
    pub connected_after_load: bool,
    pub closures: u32,
    pub recovered: u32,
    pub video_rates: Vec<f64>,
    pub agent: Option<AgentStatus>,
    pub injection: Option<InjectionRecord>,
    pub stats: SimStats,
}

impl Scenario {
    pub async fn run(&self, config: Config, clock: Arc<dyn Clock>) -> Result<ScenarioReport, StorageError> {
        let sim = Simulation::new(config, clock);
        sim.install().await;
        sim.set_site_rules(&self.rules).await?;

        let tab = sim.open_and_load(&self.url, self.videos).await;
        let connected_after_load = sim.wait_connected(tab, self.settle_timeout).await;

        sim.browser().with_faults(|f| {
            f.drop_messages = self.drops;
            f.refuse_connects = self.fail_connects;
        });

        let mut recovered = 0;
        for closure in 1..=self.closures {
            if !sim.sever_channel(tab) {
                debug!(closure, "No open channel to sever");
            }
            // Let the watcher observe the close before polling
            sleep(Duration::from_millis(50)).await;
            if sim.wait_connected(tab, self.settle_timeout).await {
                recovered += 1;
            }
        }

        let report = ScenarioReport {
            url: self.url.clone(),
            tab_id: tab,
            connected_after_load,
            closures: self.closures,
            recovered,
            video_rates: sim.video_rates(tab),
            agent: sim.agent_status(tab),
            injection: sim.coordinator().injection_record(tab),
            stats: sim.browser().stats(),
        };
        info!(recovered, closures = self.closures, "Scenario finished");
        sim.shutdown();
        Ok(report)
    }
}
