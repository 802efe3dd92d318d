//! Page agent: one per page context.
//!
//! The agent keeps a long-lived channel to the coordinator alive, applies
//! site speed rules to the page's videos, and answers coordinator commands.
//!
//! # Connection states
//!
//! `Disconnected → Connecting → Connected → Disconnected` (on channel close).
//! Recovery runs inside `Disconnected` and is non-reentrant: the
//! [`RecoveryFlag`] admits one regular recovery at a time, plus any number of
//! forced ones.
//!
//! Each channel gets a generation number. Watchers of discarded channels
//! compare generations and do nothing, so replacing a channel never triggers
//! a second recovery.
//!
//! State lives behind `std::sync::Mutex`es that are never held across an
//! `.await`; every await point re-reads what it needs afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::channel::ChannelEnd;
use crate::clock::Clock;
use crate::config::AgentConfig;
use crate::diagnostics::{Diagnostics, ThrottleConfig};
use crate::host::{Document, PageHost, VideoEvent, VideoId};
use crate::message::{AgentRequest, Command, PortMessage, Reply};
use crate::reconnect::{
    ReconnectDecision, ReconnectSnapshot, ReconnectState, RecoveryFlag,
};
use crate::runtime::{sleep, with_timeout};
use crate::speed::Speed;
use crate::speed_input::{PopupKey, PopupOutcome, SpeedInput};
use crate::storage::{KeyValueStore, SITE_SETTINGS_KEY, SiteSettings, StorageChange};
use crate::url_pattern::PatternCache;
use crate::video::VideoTracker;

// =============================================================================
// PageContext
// =============================================================================

/// Everything the agent knows about its page.
#[derive(Debug, Clone)]
pub struct PageContext {
    pub connection_valid: bool,
    pub current_speed: Speed,
    pub pending_speed_update: Option<Speed>,
    /// The user picked a speed; site rules stay out of the way.
    pub manual_override: bool,
    pub videos: VideoTracker,
    pub last_url: String,
    pub auto_speed_applied: bool,
    pub initialized: bool,
    pub reconnect: ReconnectState,
    pub generation: u64,
}

impl PageContext {
    #[must_use]
    pub fn new(url: String, reconnect: ReconnectState) -> Self {
        Self {
            connection_valid: false,
            current_speed: Speed::DEFAULT,
            pending_speed_update: None,
            manual_override: false,
            videos: VideoTracker::new(),
            last_url: url,
            auto_speed_applied: false,
            initialized: false,
            reconnect,
            generation: 0,
        }
    }

    /// Speed that wired videos are held at, if any.
    #[must_use]
    pub fn target_speed(&self) -> Option<Speed> {
        self.pending_speed_update
            .or_else(|| (!self.current_speed.is_default()).then_some(self.current_speed))
    }

    /// Forget every speed decision. Reconnect bookkeeping is untouched.
    pub fn clear_speeds(&mut self) {
        self.current_speed = Speed::DEFAULT;
        self.pending_speed_update = None;
        self.manual_override = false;
        self.auto_speed_applied = false;
    }

    /// Back to the initial state for the current URL. Wired videos stay
    /// wired; callers that unwire them do so separately.
    pub fn reset(&mut self) {
        self.clear_speeds();
        self.reconnect.reset();
    }

    /// In-page navigation: the new route starts from scratch.
    pub fn reset_for_navigation(&mut self, url: String) {
        self.reset();
        self.last_url = url;
    }
}

/// Serializable view of an agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStatus {
    pub connection_valid: bool,
    pub current_speed: f64,
    pub pending_speed_update: Option<f64>,
    pub manual_override: bool,
    pub auto_speed_applied: bool,
    pub initialized: bool,
    pub tracked_videos: usize,
    pub last_url: String,
    pub generation: u64,
    pub recovering: bool,
    pub reconnect: ReconnectSnapshot,
}

/// Result of one [`PageAgent::handle_disconnect`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    Recovered { attempt: u32 },
    Failed { attempt: u32 },
    /// Another recovery holds the flag.
    InProgress,
    RateLimited { retry_after_ms: u64 },
    Exhausted,
    ShutDown,
}

// =============================================================================
// PageAgent
// =============================================================================

#[derive(Default)]
struct Tasks {
    watcher: Option<JoinHandle<()>>,
    recovery: Option<JoinHandle<()>>,
    maintenance: Option<JoinHandle<()>>,
    storage: Option<JoinHandle<()>>,
    visibility: Option<JoinHandle<()>>,
    reload: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for handle in [
            self.watcher.take(),
            self.recovery.take(),
            self.maintenance.take(),
            self.storage.take(),
            self.visibility.take(),
            self.reload.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

struct AgentInner<H: PageHost> {
    host: Arc<H>,
    config: AgentConfig,
    clock: Arc<dyn Clock>,
    context: Mutex<PageContext>,
    patterns: Mutex<PatternCache>,
    channel: Mutex<Option<(u64, ChannelEnd)>>,
    popup: Mutex<SpeedInput>,
    recovery: RecoveryFlag,
    diagnostics: Diagnostics,
    tasks: Mutex<Tasks>,
    shut_down: AtomicBool,
}

/// Handle to a page agent. Clones share state.
pub struct PageAgent<H: PageHost> {
    inner: Arc<AgentInner<H>>,
}

impl<H: PageHost> Clone for PageAgent<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: PageHost> std::fmt::Debug for PageAgent<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageAgent")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

impl<H: PageHost> PageAgent<H> {
    #[must_use]
    pub fn new(
        host: Arc<H>,
        config: AgentConfig,
        throttle: ThrottleConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let url = host.document().current_url();
        let reconnect = ReconnectState::new(
            config.reconnect.to_policy(),
            millis(config.min_reconnect_interval_ms),
        );
        let diagnostics = Diagnostics::new("page_agent", throttle, Arc::clone(&clock));
        Self {
            inner: Arc::new(AgentInner {
                host,
                config,
                clock,
                context: Mutex::new(PageContext::new(url, reconnect)),
                patterns: Mutex::new(PatternCache::new()),
                channel: Mutex::new(None),
                popup: Mutex::new(SpeedInput::new()),
                recovery: RecoveryFlag::new(),
                diagnostics,
                tasks: Mutex::new(Tasks::default()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    fn ctx(&self) -> MutexGuard<'_, PageContext> {
        lock(&self.inner.context)
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        lock(&self.inner.tasks)
    }

    fn document(&self) -> &H::Document {
        self.inner.host.document()
    }

    fn weak(&self) -> Weak<AgentInner<H>> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<AgentInner<H>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn connection_timeout(&self) -> Duration {
        millis(self.inner.config.connection_timeout_ms)
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_recovering(&self) -> bool {
        self.inner.recovery.is_set()
    }

    /// Whether the current channel exists and has not been closed.
    #[must_use]
    pub fn is_channel_open(&self) -> bool {
        lock(&self.inner.channel)
            .as_ref()
            .is_some_and(|(_, end)| !end.is_closed())
    }

    #[must_use]
    pub fn status(&self) -> AgentStatus {
        let ctx = self.ctx();
        AgentStatus {
            connection_valid: ctx.connection_valid,
            current_speed: ctx.current_speed.get(),
            pending_speed_update: ctx.pending_speed_update.map(Speed::get),
            manual_override: ctx.manual_override,
            auto_speed_applied: ctx.auto_speed_applied,
            initialized: ctx.initialized,
            tracked_videos: ctx.videos.len(),
            last_url: ctx.last_url.clone(),
            generation: ctx.generation,
            recovering: self.inner.recovery.is_set(),
            reconnect: ctx.reconnect.snapshot(),
        }
    }

    /// Copy of the page context.
    #[must_use]
    pub fn context(&self) -> PageContext {
        self.ctx().clone()
    }

    // =========================================================================
    // Connection state machine
    // =========================================================================

    /// Replace the channel to the coordinator with a fresh one.
    ///
    /// Returns false when the host refuses the connection; never panics.
    pub fn establish_connection(&self) -> bool {
        if self.is_shut_down() {
            return false;
        }

        // Bump first so the old channel's watcher is already stale when it
        // observes the disconnect below.
        let generation = {
            let mut ctx = self.ctx();
            ctx.generation += 1;
            ctx.generation
        };

        if let Some((_, old)) = lock(&self.inner.channel).take() {
            old.disconnect();
        }

        let end = match self.inner.host.connect(&self.inner.config.channel_name) {
            Ok(end) => end,
            Err(e) => {
                self.ctx().connection_valid = false;
                self.inner
                    .diagnostics
                    .warn("Connection establishment failed", &e);
                return false;
            }
        };

        if let Err(e) = end.post(PortMessage::Ping) {
            end.disconnect();
            self.ctx().connection_valid = false;
            self.inner
                .diagnostics
                .warn("Channel closed before first ping", &e);
            return false;
        }

        *lock(&self.inner.channel) = Some((generation, end.clone()));
        self.ctx().connection_valid = true;

        let watcher = self.spawn_watcher(end, generation);
        // The previous watcher exits on its own once its channel closes
        self.tasks().watcher = Some(watcher);
        debug!(generation, "Channel established");
        true
    }

    fn spawn_watcher(&self, end: ChannelEnd, generation: u64) -> JoinHandle<()> {
        let weak = self.weak();
        tokio::spawn(async move {
            while let Some(message) = end.recv().await {
                if let PortMessage::Pong { success } = message {
                    trace!(generation, success, "Channel pong");
                }
            }
            drop(end);
            if let Some(agent) = Self::upgrade(&weak) {
                agent.on_channel_closed(generation);
            }
        })
    }

    fn on_channel_closed(&self, generation: u64) {
        {
            let mut ctx = self.ctx();
            if ctx.generation != generation {
                trace!(generation, current = ctx.generation, "Ignoring stale channel close");
                return;
            }
            ctx.connection_valid = false;
        }
        {
            let mut channel = lock(&self.inner.channel);
            if channel.as_ref().is_some_and(|(g, _)| *g == generation) {
                *channel = None;
            }
        }
        debug!(generation, "Channel closed");

        if self.is_shut_down() || self.inner.recovery.is_set() {
            return;
        }

        let mut tasks = self.tasks();
        if tasks.recovery.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let weak = self.weak();
        tasks.recovery = Some(tokio::spawn(async move {
            if let Some(agent) = Self::upgrade(&weak) {
                agent.recover_until_settled().await;
            }
        }));
    }

    /// One `ping` round trip to the coordinator, raced against `timeout`.
    pub async fn validate_context(&self, timeout: Duration) -> bool {
        let has_channel = lock(&self.inner.channel).is_some();
        if !has_channel && !self.establish_connection() {
            return false;
        }

        let host = Arc::clone(&self.inner.host);
        match with_timeout(timeout, host.send_message(AgentRequest::Ping)).await {
            Ok(reply) => reply.success,
            Err(e) => {
                self.inner.diagnostics.debug("Context validation failed", &e);
                false
            }
        }
    }

    /// Reconnect and validate once.
    ///
    /// Without `force` this is a no-op while another recovery runs or once
    /// the attempt budget is spent.
    pub async fn attempt_recovery(&self, force: bool) -> bool {
        let Some(_guard) = self.inner.recovery.try_enter(force) else {
            return false;
        };
        if !force && self.ctx().reconnect.is_exhausted() {
            return false;
        }
        self.reconnect_and_validate().await
    }

    /// establish + validate; success resets the attempt counter.
    async fn reconnect_and_validate(&self) -> bool {
        if !self.establish_connection() {
            return false;
        }
        let valid = self.validate_context(self.connection_timeout()).await && self.is_channel_open();

        let mut ctx = self.ctx();
        ctx.connection_valid = valid;
        if valid {
            ctx.reconnect.record_success();
        }
        valid
    }

    /// One rate-limited, bounded reconnect attempt with backoff.
    pub async fn handle_disconnect(&self) -> DisconnectOutcome {
        if self.is_shut_down() {
            return DisconnectOutcome::ShutDown;
        }
        let Some(_guard) = self.inner.recovery.try_enter(false) else {
            return DisconnectOutcome::InProgress;
        };

        let now_ms = self.inner.clock.now_ms();
        let decision = self.ctx().reconnect.begin(now_ms);
        let (attempt, delay) = match decision {
            ReconnectDecision::Proceed { attempt, delay } => (attempt, delay),
            ReconnectDecision::RateLimited { retry_after_ms } => {
                return DisconnectOutcome::RateLimited { retry_after_ms };
            }
            ReconnectDecision::Exhausted => return DisconnectOutcome::Exhausted,
        };

        debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting after backoff"
        );
        sleep(delay).await;

        if self.is_shut_down() {
            return DisconnectOutcome::ShutDown;
        }

        if self.reconnect_and_validate().await {
            info!(attempt, "Channel recovered");
            self.apply_site_settings(true).await;
            DisconnectOutcome::Recovered { attempt }
        } else {
            self.inner
                .diagnostics
                .warn("Reconnect attempt failed", &format_args!("attempt {attempt}"));
            DisconnectOutcome::Failed { attempt }
        }
    }

    /// Drive [`handle_disconnect`](Self::handle_disconnect) until it
    /// recovers or the state machine says stop.
    pub async fn recover_until_settled(&self) -> bool {
        loop {
            match self.handle_disconnect().await {
                DisconnectOutcome::Recovered { .. } => return true,
                DisconnectOutcome::Failed { .. } => {}
                DisconnectOutcome::RateLimited { retry_after_ms } => {
                    sleep(millis(retry_after_ms)).await;
                }
                DisconnectOutcome::Exhausted => {
                    // Attempts stay at the ceiling so the agent is dormant
                    // until navigation.
                    let max = {
                        let mut ctx = self.ctx();
                        ctx.clear_speeds();
                        ctx.reconnect.max_attempts()
                    };
                    warn!(max_attempts = max, "Reconnect attempts exhausted; waiting for navigation");
                    return false;
                }
                DisconnectOutcome::InProgress | DisconnectOutcome::ShutDown => return false,
            }
        }
    }

    /// Ask the coordinator to re-inject this page, then force a recovery.
    pub async fn request_reload(&self) -> bool {
        let Some(_guard) = self.inner.recovery.try_enter(false) else {
            return false;
        };

        let host = Arc::clone(&self.inner.host);
        if let Err(e) = with_timeout(
            self.connection_timeout(),
            host.send_message(AgentRequest::ReloadContentScript),
        )
        .await
        {
            self.inner.diagnostics.warn("Reload request failed", &e);
        }

        sleep(millis(self.inner.config.reload_settle_ms)).await;
        self.attempt_recovery(true).await
    }

    // =========================================================================
    // Site rules and videos
    // =========================================================================

    /// Apply the first matching site rule to every video.
    ///
    /// Returns whether a rule is in effect. A manual override always wins.
    pub async fn apply_site_settings(&self, force: bool) -> bool {
        let (manual_override, connection_valid) = {
            let ctx = self.ctx();
            (ctx.manual_override, ctx.connection_valid)
        };
        if manual_override {
            return false;
        }
        if !force && !connection_valid && !self.attempt_recovery(false).await {
            return false;
        }

        let url = self.document().current_url();
        {
            let ctx = self.ctx();
            if !force && ctx.auto_speed_applied && ctx.last_url == url {
                return true;
            }
        }

        let store = self.inner.host.store();
        let rules = match SiteSettings::load(store.as_ref()).await {
            Ok(rules) => rules,
            Err(e) => {
                self.inner.diagnostics.warn("Could not read site rules", &e);
                return false;
            }
        };

        let matched = lock(&self.inner.patterns)
            .first_match(&rules, &url)
            .map(|m| (m.pattern.to_string(), m.speed));

        let speed = {
            let mut ctx = self.ctx();
            // The user may have picked a speed while the rules were loading
            if ctx.manual_override {
                return false;
            }
            ctx.last_url = url;
            match matched {
                Some((ref pattern, speed)) => {
                    debug!(pattern = %pattern, speed = speed.get(), "Applying site rule");
                    ctx.current_speed = speed;
                    ctx.pending_speed_update = Some(speed);
                    ctx.auto_speed_applied = true;
                    speed
                }
                None => {
                    ctx.auto_speed_applied = false;
                    return false;
                }
            }
        };

        let document = self.document();
        for video in document.videos() {
            if document.is_attached(video) {
                document.set_playback_rate(video, speed.get());
            }
        }
        true
    }

    /// Wire a video. No-op if it is already wired or gone.
    pub fn initialize_video(&self, video: VideoId) -> bool {
        let document = self.document();
        if !document.is_attached(video) {
            return false;
        }
        let target = {
            let mut ctx = self.ctx();
            if !ctx.videos.track(video) {
                return false;
            }
            ctx.target_speed()
        };
        if let Some(speed) = target {
            document.set_playback_rate(video, speed.get());
        }
        trace!(%video, "Video wired");
        true
    }

    /// Media event on a wired video.
    pub fn on_video_event(&self, video: VideoId, event: VideoEvent) {
        let document = self.document();
        let Some(rate) = document.playback_rate(video) else {
            return;
        };

        let restore = {
            let mut ctx = self.ctx();
            if !ctx.videos.is_tracked(video) {
                return;
            }
            let Some(target) = ctx.target_speed() else {
                return;
            };
            if target.matches_rate(rate) {
                return;
            }
            if !event.reapplies_speed() && !ctx.videos.begin_restore(video) {
                return;
            }
            target
        };

        if !event.reapplies_speed() {
            debug!(%video, from = rate, to = restore.get(), "Re-asserting playback rate");
        }
        document.set_playback_rate(video, restore.get());
    }

    /// A `<video>` appeared. Returns true when an animation frame should be
    /// requested to process the queue.
    pub fn notify_video_added(&self, video: VideoId) -> bool {
        self.ctx().videos.queue(video)
    }

    /// `src`/`currentSrc` changed on a video.
    pub fn notify_video_source_changed(&self, video: VideoId) -> bool {
        self.ctx().videos.queue(video)
    }

    /// A `<video>` left the document: drop its listeners.
    pub fn notify_video_removed(&self, video: VideoId) {
        self.ctx().videos.untrack(video);
    }

    #[must_use]
    pub fn needs_animation_frame(&self) -> bool {
        self.ctx().videos.frame_requested()
    }

    /// Animation frame: lift rate-change guards and wire queued videos.
    pub fn on_animation_frame(&self) -> usize {
        let queued = {
            let mut ctx = self.ctx();
            ctx.videos.end_frame();
            ctx.videos.drain_queue()
        };
        queued
            .into_iter()
            .filter(|video| self.initialize_video(*video))
            .count()
    }

    /// Set one video's rate, retrying while the player fights back.
    async fn set_video_speed(&self, video: VideoId, speed: Speed) -> bool {
        let document = self.document();
        let mut tries_left = self.inner.config.rate_apply_retries;
        loop {
            if !document.is_attached(video) {
                return false;
            }
            document.set_playback_rate(video, speed.get());
            if document
                .playback_rate(video)
                .is_some_and(|rate| speed.matches_rate(rate))
            {
                return true;
            }
            if tries_left == 0 {
                return false;
            }
            tries_left -= 1;
            sleep(millis(self.inner.config.rate_apply_retry_delay_ms)).await;
        }
    }

    /// Apply a user-chosen speed to every video and tell the coordinator.
    async fn apply_speed_to_all_videos(&self, speed: Speed) -> bool {
        let mut applied = false;
        for video in self.document().videos() {
            applied |= self.set_video_speed(video, speed).await;
        }
        if !applied {
            return false;
        }

        {
            let mut ctx = self.ctx();
            ctx.current_speed = speed;
            ctx.pending_speed_update = None;
        }

        let host = Arc::clone(&self.inner.host);
        let request = AgentRequest::SetSpeed {
            speed: serde_json::Value::from(speed.get()),
        };
        if let Err(e) = with_timeout(self.connection_timeout(), host.send_message(request)).await {
            self.inner
                .diagnostics
                .debug("Could not report speed to coordinator", &e);
        }
        true
    }

    fn set_manual_speed(&self, speed: Speed) {
        let mut ctx = self.ctx();
        ctx.manual_override = true;
        ctx.pending_speed_update = Some(speed);
    }

    // =========================================================================
    // Page events
    // =========================================================================

    /// In-page navigation (history API, popstate).
    ///
    /// The page context resets, including any manual override, and site
    /// rules are re-applied for the new URL.
    pub async fn notify_url_changed(&self, url: &str) -> bool {
        {
            let mut ctx = self.ctx();
            if ctx.last_url == url {
                return false;
            }
            debug!(from = %ctx.last_url, to = url, "In-page navigation");
            ctx.reset_for_navigation(url.to_string());
        }
        self.apply_site_settings(true).await
    }

    pub async fn on_storage_changed(&self, change: &StorageChange) -> bool {
        if change.key != SITE_SETTINGS_KEY {
            return false;
        }
        self.apply_site_settings(true).await
    }

    /// Tab became visible (or hidden). Visible tabs re-validate after a short
    /// debounce.
    pub fn on_visibility_changed(&self, visible: bool) {
        let mut tasks = self.tasks();
        if let Some(previous) = tasks.visibility.take() {
            previous.abort();
        }
        if !visible || self.is_shut_down() {
            return;
        }

        let weak = self.weak();
        let debounce = millis(self.inner.config.visibility_debounce_ms);
        tasks.visibility = Some(tokio::spawn(async move {
            sleep(debounce).await;
            let Some(agent) = Self::upgrade(&weak) else {
                return;
            };
            if !agent.validate_context(agent.connection_timeout()).await {
                agent.attempt_recovery(false).await;
            }
        }));
    }

    /// Periodic self-check.
    pub async fn status_check(&self) {
        if self.inner.recovery.is_set() || self.is_shut_down() {
            return;
        }
        let (valid, needs_rules) = {
            let ctx = self.ctx();
            (
                ctx.connection_valid,
                !ctx.auto_speed_applied && !ctx.manual_override,
            )
        };
        if !valid {
            self.attempt_recovery(false).await;
        } else if needs_rules {
            self.apply_site_settings(false).await;
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Boot the agent in its page.
    ///
    /// On failure a reload request is scheduled after the configured delay.
    pub async fn start(&self) -> bool {
        self.apply_site_settings(true).await;

        if !self.establish_connection() {
            warn!("Agent start failed; scheduling reload");
            self.ctx().initialized = false;
            let weak = self.weak();
            let delay = millis(self.inner.config.init_retry_delay_ms);
            self.tasks().reload = Some(tokio::spawn(async move {
                sleep(delay).await;
                let Some(agent) = Self::upgrade(&weak) else {
                    return;
                };
                if agent.request_reload().await {
                    agent.complete_start().await;
                }
            }));
            return false;
        }

        self.complete_start().await;
        true
    }

    async fn complete_start(&self) {
        self.load_cached_tab_speed().await;

        for video in self.document().videos() {
            self.initialize_video(video);
        }

        self.ctx().initialized = true;
        self.spawn_background_tasks();
        info!(url = %self.ctx().last_url, "Page agent started");
    }

    /// Adopt the tab's last speed from the coordinator unless a site rule
    /// already applies.
    async fn load_cached_tab_speed(&self) {
        let host = Arc::clone(&self.inner.host);
        let reply = match with_timeout(
            self.connection_timeout(),
            host.send_message(AgentRequest::GetSpeed),
        )
        .await
        {
            Ok(reply) if reply.success => reply,
            Ok(_) => return,
            Err(e) => {
                self.inner.diagnostics.debug("Could not load tab speed", &e);
                return;
            }
        };

        let Some(speed) = reply.speed.and_then(|s| Speed::new(s).ok()) else {
            return;
        };
        let mut ctx = self.ctx();
        if !speed.is_default() && !ctx.auto_speed_applied && !ctx.manual_override {
            ctx.current_speed = speed;
            ctx.pending_speed_update = Some(speed);
        }
    }

    fn spawn_background_tasks(&self) {
        let interval = millis(self.inner.config.status_check_interval_ms);
        let weak = self.weak();
        let maintenance = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(agent) = Self::upgrade(&weak) else {
                    return;
                };
                agent.status_check().await;
            }
        });

        let mut changes = self.inner.host.store().subscribe();
        let weak = self.weak();
        let storage = tokio::spawn(async move {
            loop {
                let change = match changes.recv().await {
                    Ok(change) => change,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Storage notifications lagged");
                        StorageChange {
                            key: SITE_SETTINGS_KEY.to_string(),
                            old_value: None,
                            new_value: None,
                        }
                    }
                    Err(RecvError::Closed) => return,
                };
                let Some(agent) = Self::upgrade(&weak) else {
                    return;
                };
                agent.on_storage_changed(&change).await;
            }
        });

        let mut tasks = self.tasks();
        tasks.maintenance = Some(maintenance);
        tasks.storage = Some(storage);
    }

    /// Page unload: stop every task and drop the channel.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tasks().abort_all();
        if let Some((_, end)) = lock(&self.inner.channel).take() {
            end.disconnect();
        }
        self.ctx().videos.clear();
        lock(&self.inner.popup).close();
        self.document().hide_speed_input();
        debug!("Page agent shut down");
    }

    fn cleanup(&self) {
        let removed = {
            let mut ctx = self.ctx();
            ctx.reset();
            ctx.videos.clear()
        };
        lock(&self.inner.popup).close();
        self.document().hide_speed_input();
        debug!(videos = removed.len(), "Agent cleanup");
    }

    // =========================================================================
    // Speed input popup
    // =========================================================================

    fn displayed_speed(&self) -> Speed {
        let document = self.document();
        document
            .videos()
            .first()
            .and_then(|video| document.playback_rate(*video))
            .and_then(|rate| Speed::new(rate).ok())
            .unwrap_or_else(|| self.ctx().current_speed)
    }

    fn toggle_speed_input(&self) {
        let current = self.displayed_speed();
        let now_ms = self.inner.clock.now_ms();
        let shown = lock(&self.inner.popup).toggle(now_ms, current);
        match shown {
            Some(true) => self.document().show_speed_input(current),
            Some(false) => self.document().hide_speed_input(),
            None => {}
        }
    }

    #[must_use]
    pub fn is_speed_input_open(&self) -> bool {
        lock(&self.inner.popup).is_open()
    }

    pub fn speed_input_text(&self, text: &str) {
        lock(&self.inner.popup).set_text(text);
    }

    /// Key press inside the popup.
    pub async fn speed_input_key(&self, key: PopupKey) -> PopupOutcome {
        let outcome = lock(&self.inner.popup).key(key);
        self.finish_popup(outcome).await
    }

    pub async fn speed_input_click_outside(&self) -> PopupOutcome {
        let outcome = lock(&self.inner.popup).click_outside();
        self.finish_popup(outcome).await
    }

    async fn finish_popup(&self, outcome: PopupOutcome) -> PopupOutcome {
        match outcome {
            PopupOutcome::Applied(speed) => {
                self.document().hide_speed_input();
                self.set_manual_speed(speed);
                self.ctx().current_speed = speed;
                self.apply_speed_to_all_videos(speed).await;
            }
            PopupOutcome::Dismissed => self.document().hide_speed_input(),
            PopupOutcome::Rejected | PopupOutcome::Ignored => {}
        }
        outcome
    }

    // =========================================================================
    // Command dispatch
    // =========================================================================

    /// Answer a coordinator command.
    pub async fn handle_command(&self, command: Command) -> Reply {
        trace!(action = command.action(), "Command received");
        match command {
            Command::Ping => Reply::ok(),
            Command::Cleanup => {
                self.cleanup();
                Reply::ok()
            }
            Command::ToggleSpeedInput => {
                let connection_valid = self.ctx().connection_valid;
                if !connection_valid && !self.attempt_recovery(true).await {
                    return Reply::failure("Failed to recover context");
                }
                self.toggle_speed_input();
                Reply::ok()
            }
            Command::GetSpeed => Reply::with_speed(true, self.displayed_speed().get()),
            Command::SetSpeed { speed } => match Speed::from_json(&speed) {
                Ok(speed) => {
                    self.set_manual_speed(speed);
                    let success = self.apply_speed_to_all_videos(speed).await;
                    Reply::with_speed(success, speed.get())
                }
                Err(_) => Reply::invalid_speed(),
            },
            Command::InitializeCheck => Reply::status(self.ctx().initialized),
            Command::Unknown => Reply::unknown_action(),
        }
    }

    /// Decode and answer a raw JSON command.
    pub async fn handle_json(&self, raw: &serde_json::Value) -> Reply {
        match serde_json::from_value::<Command>(raw.clone()) {
            Ok(command) => self.handle_command(command).await,
            Err(e) => Reply::failure(e.to_string()),
        }
    }
}
