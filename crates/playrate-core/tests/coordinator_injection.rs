//! Coordinator injection tracking, liveness ports and relays.

mod common;

use std::time::Duration;

use playrate_core::config::Config;
use playrate_core::coordinator::{InjectionOutcome, InstallReason, ShortcutOutcome};
use playrate_core::host::TabId;
use playrate_core::message::{AgentRequest, INVALID_SPEED};
use playrate_core::storage::{
    DEFAULT_SHORTCUT, KeyValueStore, SHORTCUT_KEY, SITE_SETTINGS_KEY, VERSION_KEY, tab_speed_key,
};
use serde_json::json;

use common::*;

// ────────────────────────────────────────────────────────────────────
// Exactly-once injection
// ────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn concurrent_injection_is_a_no_op() {
    let sim = sim();
    let tab = sim.open_tab("https://example.com/", 1);
    sim.browser().with_faults(|f| f.injection_delay_ms = 200);

    let coordinator = sim.coordinator();
    let (first, second) = tokio::join!(
        coordinator.inject_content_script(tab),
        coordinator.inject_content_script(tab)
    );

    assert_eq!(first, InjectionOutcome::Injected);
    assert_eq!(second, InjectionOutcome::AlreadyInFlight);
    assert_eq!(sim.browser().stats().injections, 1);
    assert_eq!(sim.browser().stats().agents_started, 1);
    assert!(!coordinator.injection_record(tab).unwrap().locked);
}

#[tokio::test(start_paused = true)]
async fn reinjection_into_live_context_keeps_agent() {
    let sim = sim();
    let tab = sim.open_and_load("https://example.com/", 1).await;
    assert!(sim.wait_connected(tab, SETTLE).await);

    assert_eq!(
        sim.coordinator().inject_content_script(tab).await,
        InjectionOutcome::Injected
    );
    assert_eq!(sim.browser().stats().agents_started, 1);
}

#[tokio::test(start_paused = true)]
async fn protected_pages_are_refused_quietly() {
    let sim = sim();
    let tab = sim.open_tab("chrome://settings", 0);

    let outcome = sim.coordinator().inject_content_script(tab).await;
    assert_eq!(outcome, InjectionOutcome::Refused);
    assert_eq!(sim.coordinator().injection_record(tab).unwrap().attempts, 0);
    assert_eq!(sim.browser().stats().agents_started, 0);
}

#[tokio::test(start_paused = true)]
async fn repeated_failures_abandon_until_tab_update() {
    let sim = sim();
    let tab = sim.open_tab("https://example.com/", 0);
    sim.browser().with_faults(|f| f.fail_injections = 3);
    let coordinator = sim.coordinator();

    for expected in 1..=3 {
        assert_eq!(
            coordinator.inject_content_script(tab).await,
            InjectionOutcome::Failed { attempts: expected }
        );
    }
    assert_eq!(
        coordinator.inject_content_script(tab).await,
        InjectionOutcome::Abandoned
    );
    let record = coordinator.injection_record(tab).unwrap();
    assert!(record.abandoned);
    assert_eq!(record.attempts, 0);

    // Still abandoned on a plain retry
    assert_eq!(
        coordinator.inject_content_script(tab).await,
        InjectionOutcome::Abandoned
    );

    // A completed load clears the mark and the tab gets its agent
    assert_eq!(
        coordinator.on_tab_updated(tab, true).await,
        Some(InjectionOutcome::Injected)
    );
    assert!(sim.wait_connected(tab, SETTLE).await);
}

// ────────────────────────────────────────────────────────────────────
// Navigation
// ────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn navigation_bursts_are_debounced() {
    let sim = sim();
    let tab = sim.open_and_load("https://example.com/", 1).await;
    let coordinator = sim.coordinator();

    assert_eq!(
        coordinator
            .on_navigation_committed(tab, "https://example.com/", 0)
            .await,
        Some(InjectionOutcome::Debounced)
    );

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(
        coordinator
            .on_navigation_committed(tab, "https://example.com/", 0)
            .await,
        Some(InjectionOutcome::Injected)
    );
}

#[tokio::test(start_paused = true)]
async fn subframe_navigation_is_ignored() {
    let sim = sim();
    let tab = sim.open_tab("https://example.com/", 0);
    assert_eq!(
        sim.coordinator()
            .on_navigation_committed(tab, "https://ads.example.net/frame", 2)
            .await,
        None
    );
    assert!(sim.coordinator().injection_record(tab).is_none());
}

#[tokio::test(start_paused = true)]
async fn history_updates_only_inject_on_spa_hosts() {
    let sim = sim();
    let coordinator = sim.coordinator();

    let plain = sim.open_tab("https://example.com/a", 0);
    assert_eq!(
        coordinator
            .on_history_state_updated(plain, "https://example.com/b", 0)
            .await,
        None
    );

    let spa = sim.open_tab("https://www.youtube.com/watch?v=1", 1);
    assert_eq!(
        coordinator
            .on_history_state_updated(spa, "https://www.youtube.com/watch?v=2", 0)
            .await,
        Some(InjectionOutcome::Injected)
    );
    assert_eq!(
        coordinator
            .on_history_state_updated(spa, "https://www.youtube.com/watch?v=3", 0)
            .await,
        Some(InjectionOutcome::Debounced)
    );
}

// ────────────────────────────────────────────────────────────────────
// Cleanup and ports
// ────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn cleanup_is_idempotent() {
    let sim = sim();
    let tab = sim.open_and_load("https://example.com/", 1).await;
    assert!(sim.wait_connected(tab, SETTLE).await);
    let coordinator = sim.coordinator();
    assert!(coordinator.has_port(tab));

    coordinator.cleanup_tab(tab);
    assert!(!coordinator.has_port(tab));
    assert!(coordinator.injection_record(tab).is_none());

    coordinator.cleanup_tab(tab);
    coordinator.cleanup_tab(TabId::new(9_999));
    assert!(!coordinator.has_port(tab));

    // The agent notices the closed channel and reconnects on its own
    settle().await;
    assert!(sim.wait_connected(tab, SETTLE).await);
    assert!(coordinator.has_port(tab));
}

#[tokio::test(start_paused = true)]
async fn removed_tab_is_forgotten() {
    let sim = sim();
    let tab = sim.open_and_load("https://example.com/", 1).await;
    assert!(sim.wait_connected(tab, SETTLE).await);

    sim.close_tab(tab);
    assert!(!sim.coordinator().has_port(tab));
    assert!(sim.coordinator().injection_record(tab).is_none());
}

#[tokio::test(start_paused = true)]
async fn tab_closed_during_injection_leaves_no_record() {
    let sim = sim();
    let tab = sim.open_tab("https://example.com/", 1);
    sim.browser().with_faults(|f| f.injection_delay_ms = 200);

    let coordinator = sim.coordinator();
    let (outcome, ()) = tokio::join!(coordinator.inject_content_script(tab), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        sim.close_tab(tab);
    });

    assert_eq!(outcome, InjectionOutcome::TabClosed);
    assert!(coordinator.injection_record(tab).is_none());
}

fn slow_reconnect_config() -> Config {
    let mut config = Config::default();
    // Keep the agent's own reconnect well behind the coordinator's grace period
    config.agent.reconnect.base_delay_ms = 3_000;
    config
}

#[tokio::test(start_paused = true)]
async fn responsive_agent_is_not_reinjected_after_port_loss() {
    let sim = sim_with(slow_reconnect_config());
    let tab = sim.open_and_load("https://example.com/", 1).await;
    assert!(sim.wait_connected(tab, SETTLE).await);
    let before = sim.browser().stats().injections;

    assert!(sim.sever_channel(tab));
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert_eq!(sim.browser().stats().injections, before);
}

#[tokio::test(start_paused = true)]
async fn silent_agent_is_reinjected_after_grace_period() {
    let sim = sim_with(slow_reconnect_config());
    let tab = sim.open_and_load("https://example.com/", 1).await;
    assert!(sim.wait_connected(tab, SETTLE).await);
    let before = sim.browser().stats().injections;

    assert!(sim.sever_channel(tab));
    sim.browser().with_faults(|f| f.drop_messages = 1);
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert_eq!(sim.browser().stats().injections, before + 1);
    assert_eq!(sim.browser().stats().dropped_messages, 1);

    // The agent still recovers its own channel afterwards
    assert!(sim.wait_connected(tab, SETTLE).await);
}

// ────────────────────────────────────────────────────────────────────
// Install / update
// ────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn install_seeds_defaults_and_injects_web_tabs() {
    let sim = sim();
    let a = sim.open_tab("https://example.com/", 1);
    let b = sim.open_tab("http://plain.example.org/", 0);
    sim.open_tab("chrome://newtab", 0);

    let outcomes = sim.coordinator().on_installed(InstallReason::Install).await;
    assert_eq!(
        outcomes,
        vec![(a, InjectionOutcome::Injected), (b, InjectionOutcome::Injected)]
    );

    let store = sim.browser().store();
    assert_eq!(
        store.get(SHORTCUT_KEY).await.unwrap(),
        Some(json!(DEFAULT_SHORTCUT))
    );
    assert_eq!(store.get(SITE_SETTINGS_KEY).await.unwrap(), Some(json!({})));
    assert_eq!(
        store.get(VERSION_KEY).await.unwrap(),
        Some(json!(playrate_core::VERSION))
    );
}

#[tokio::test(start_paused = true)]
async fn update_keeps_user_settings() {
    let sim = sim();
    sim.set_site_rules(&rules(&[("example.com", 1.5)]))
        .await
        .unwrap();
    sim.browser()
        .store()
        .set(VERSION_KEY, json!("0.0.1"))
        .await
        .unwrap();

    sim.coordinator().on_installed(InstallReason::Update).await;

    let store = sim.browser().store();
    assert_eq!(
        store.get(SITE_SETTINGS_KEY).await.unwrap(),
        Some(json!({"example.com": {"speed": 1.5, "enabled": true}}))
    );
    assert_eq!(
        store.get(VERSION_KEY).await.unwrap(),
        Some(json!(playrate_core::VERSION))
    );
    assert_eq!(store.get(SHORTCUT_KEY).await.unwrap(), None);
}

// ────────────────────────────────────────────────────────────────────
// Shortcut relay
// ────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn shortcut_toggles_popup_on_active_tab() {
    let sim = sim();
    let tab = sim.open_and_load("https://example.com/", 1).await;
    assert!(sim.wait_connected(tab, SETTLE).await);
    let page = sim.browser().page(tab).unwrap();

    let outcome = sim.coordinator().on_shortcut("toggle-speed-input").await;
    assert!(matches!(outcome, ShortcutOutcome::Delivered(ref r) if r.success));
    assert_eq!(page.sim_document().popup().map(|s| s.get()), Some(1.0));

    // Debounced inside 200ms
    sim.coordinator().on_shortcut("toggle-speed-input").await;
    assert!(page.sim_document().popup().is_some());

    tokio::time::sleep(Duration::from_millis(300)).await;
    sim.coordinator().on_shortcut("toggle-speed-input").await;
    assert!(page.sim_document().popup().is_none());
}

#[tokio::test(start_paused = true)]
async fn shortcut_injects_missing_agent() {
    let sim = sim();
    let tab = sim.open_tab("https://example.com/", 1);

    let outcome = sim.coordinator().on_shortcut("toggle-speed-input").await;
    assert!(matches!(outcome, ShortcutOutcome::Delivered(ref r) if r.success));
    assert_eq!(sim.browser().stats().agents_started, 1);
    assert!(sim.browser().page(tab).unwrap().sim_document().popup().is_some());
}

#[tokio::test(start_paused = true)]
async fn shortcut_skips_protected_and_unknown() {
    let sim = sim();
    sim.open_tab("chrome://extensions", 0);

    assert_eq!(
        sim.coordinator().on_shortcut("toggle-speed-input").await,
        ShortcutOutcome::ProtectedPage
    );
    assert_eq!(
        sim.coordinator().on_shortcut("open-options").await,
        ShortcutOutcome::Ignored
    );
}

#[tokio::test(start_paused = true)]
async fn shortcut_without_tabs() {
    let sim = sim();
    assert_eq!(
        sim.coordinator().on_shortcut("toggle-speed-input").await,
        ShortcutOutcome::NoActiveTab
    );
}

// ────────────────────────────────────────────────────────────────────
// Agent requests and tab speeds
// ────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn tab_speed_requests() {
    let sim = sim();
    let tab = sim.open_tab("https://example.com/", 0);
    let coordinator = sim.coordinator();

    let reply = coordinator
        .handle_agent_request(Some(tab), AgentRequest::GetSpeed)
        .await;
    assert_eq!(reply.speed, Some(1.0));

    let reply = coordinator
        .handle_agent_request(Some(tab), AgentRequest::SetSpeed { speed: json!("2") })
        .await;
    assert!(!reply.success);
    assert_eq!(reply.error.as_deref(), Some(INVALID_SPEED));

    let reply = coordinator
        .handle_agent_request(Some(tab), AgentRequest::SetSpeed { speed: json!(2.5) })
        .await;
    assert!(reply.success);

    let reply = coordinator
        .handle_agent_request(Some(tab), AgentRequest::GetSpeed)
        .await;
    assert_eq!(reply.speed, Some(2.5));

    let stored = sim
        .browser()
        .store()
        .get(&tab_speed_key(tab))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored["speed"], 2.5);

    let reply = coordinator
        .handle_agent_request(None, AgentRequest::GetSpeed)
        .await;
    assert!(!reply.success);
}

#[tokio::test(start_paused = true)]
async fn tab_speed_survives_memory_cache_expiry() {
    let sim = sim();
    let tab = sim.open_tab("https://example.com/", 0);
    let coordinator = sim.coordinator();

    coordinator
        .handle_agent_request(Some(tab), AgentRequest::SetSpeed { speed: json!(1.75) })
        .await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(
        coordinator.load_tab_speed(tab).await.map(|s| s.get()),
        Some(1.75)
    );
}

#[tokio::test(start_paused = true)]
async fn reload_request_pushes_cached_speed() {
    let sim = sim();
    let tab = sim.open_and_load("https://example.com/", 1).await;
    assert!(sim.wait_connected(tab, SETTLE).await);
    let coordinator = sim.coordinator();

    coordinator
        .handle_agent_request(Some(tab), AgentRequest::SetSpeed { speed: json!(2.5) })
        .await;
    let reply = coordinator
        .handle_agent_request(Some(tab), AgentRequest::ReloadContentScript)
        .await;

    assert!(reply.success);
    assert_eq!(sim.video_rates(tab), vec![2.5]);
}

#[tokio::test(start_paused = true)]
async fn popup_relays_reject_bad_speeds() {
    let sim = sim();
    sim.open_and_load("https://example.com/", 1).await;

    let reply = sim.coordinator().set_active_tab_speed(40.0).await;
    assert!(!reply.success);
    assert_eq!(reply.error.as_deref(), Some(INVALID_SPEED));
}

#[tokio::test(start_paused = true)]
async fn active_tab_speed_reads_live_rate() {
    let sim = sim_with_rules(&[("example.com", 1.5)]).await;
    let tab = sim.open_and_load("https://example.com/", 1).await;
    assert!(sim.wait_connected(tab, SETTLE).await);

    assert_eq!(
        sim.coordinator().active_tab_speed().await.map(|s| s.get()),
        Some(1.5)
    );
}
