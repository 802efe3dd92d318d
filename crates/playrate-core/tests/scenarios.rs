//! End-to-end scenarios over the simulation host.
//!
//! - A site rule for example.com reaches every video on load
//! - A manual speed survives rule edits but resets on in-page navigation
//! - Five channel closures, some with refused reconnects, all recover

mod common;

use std::time::Duration;

use playrate_core::clock::MonotonicClock;
use playrate_core::config::Config;
use playrate_core::simulation::Scenario;

use common::*;

#[tokio::test(start_paused = true)]
async fn example_rule_applies_to_every_video() {
    let sim = sim_with_rules(&[("example.com", 1.5)]).await;

    let tab = sim.open_and_load("https://example.com/video", 2).await;
    assert!(sim.wait_connected(tab, SETTLE).await);

    assert_eq!(sim.video_rates(tab), vec![1.5, 1.5]);
    let status = sim.agent_status(tab).unwrap();
    assert!(status.auto_speed_applied);
    assert!(!status.manual_override);
    assert_eq!(status.current_speed, 1.5);
}

#[tokio::test(start_paused = true)]
async fn unmatched_site_is_left_alone() {
    let sim = sim_with_rules(&[("example.com", 1.5)]).await;

    let tab = sim.open_and_load("https://other.org/video", 1).await;
    assert!(sim.wait_connected(tab, SETTLE).await);

    assert_eq!(sim.video_rates(tab), vec![1.0]);
    assert!(!sim.agent_status(tab).unwrap().auto_speed_applied);
}

#[tokio::test(start_paused = true)]
async fn late_video_picks_up_rule_speed() {
    let sim = sim_with_rules(&[("example.com", 2.0)]).await;
    let tab = sim.open_and_load("https://example.com/", 0).await;
    assert!(sim.wait_connected(tab, SETTLE).await);

    sim.add_video(tab).unwrap();
    assert_eq!(sim.video_rates(tab), vec![2.0]);
    assert_eq!(sim.agent_status(tab).unwrap().tracked_videos, 1);
}

#[tokio::test(start_paused = true)]
async fn manual_override_until_spa_navigation() {
    let sim = sim_with_rules(&[("example.com", 2.0)]).await;
    let tab = sim.open_and_load("https://example.com/a", 1).await;
    assert!(sim.wait_connected(tab, SETTLE).await);
    assert_eq!(sim.video_rates(tab), vec![2.0]);

    let reply = sim.coordinator().set_active_tab_speed(3.0).await;
    assert!(reply.success);
    assert_eq!(reply.speed, Some(3.0));
    assert_eq!(sim.video_rates(tab), vec![3.0]);
    assert!(sim.agent_status(tab).unwrap().manual_override);

    // Rule edits do not beat a manual choice
    sim.set_site_rules(&rules(&[("example.com", 2.5)]))
        .await
        .unwrap();
    settle().await;
    assert_eq!(sim.video_rates(tab), vec![3.0]);

    // In-page navigation resets the override and re-applies rules
    sim.push_state(tab, "https://example.com/b").await;
    assert_eq!(sim.video_rates(tab), vec![2.5]);
    let status = sim.agent_status(tab).unwrap();
    assert!(!status.manual_override);
    assert!(status.auto_speed_applied);
    assert_eq!(status.last_url, "https://example.com/b");
}

#[tokio::test(start_paused = true)]
async fn five_closures_recover_without_new_agents() {
    let sim = sim_with_rules(&[("example.com", 1.25)]).await;
    let tab = sim.open_and_load("https://example.com/watch", 1).await;
    assert!(sim.wait_connected(tab, SETTLE).await);

    sim.browser().with_faults(|f| f.refuse_connects = 3);

    for closure in 0..5 {
        assert!(sim.sever_channel(tab), "closure {closure}: channel already closed");
        settle().await;
        assert!(
            sim.wait_connected(tab, SETTLE).await,
            "closure {closure} did not recover"
        );
    }

    let status = sim.agent_status(tab).unwrap();
    assert_eq!(status.reconnect.attempts, 0);
    assert!(status.reconnect.attempts <= status.reconnect.max_attempts);
    assert_eq!(sim.video_rates(tab), vec![1.25]);

    let stats = sim.browser().stats();
    assert_eq!(stats.refused_connects, 3);
    assert_eq!(stats.connects, 6);
    assert_eq!(stats.agents_started, 1);
    assert_eq!(sim.coordinator().port_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn full_navigation_boots_a_fresh_agent() {
    let sim = sim_with_rules(&[("example.com", 1.5)]).await;
    let tab = sim.open_and_load("https://other.org/", 1).await;
    assert!(sim.wait_connected(tab, SETTLE).await);
    let first_context = sim.browser().page(tab).unwrap().context_id();

    tokio::time::sleep(Duration::from_secs(2)).await;
    sim.navigate(tab, "https://example.com/next", 1).await;
    assert!(sim.wait_connected(tab, SETTLE).await);

    assert_ne!(sim.browser().page(tab).unwrap().context_id(), first_context);
    assert_eq!(sim.video_rates(tab), vec![1.5]);
    assert_eq!(sim.browser().stats().agents_started, 2);
}

#[tokio::test(start_paused = true)]
async fn scenario_runner_reports_recovery() {
    let scenario = Scenario {
        url: "https://example.com/watch".to_string(),
        rules: rules(&[("example.com", 2.0)]),
        videos: 2,
        fail_connects: 2,
        closures: 3,
        settle_timeout: SETTLE,
        ..Scenario::default()
    };

    let report = scenario
        .run(Config::default(), std::sync::Arc::new(MonotonicClock::new()))
        .await
        .unwrap();

    assert!(report.connected_after_load);
    assert_eq!(report.recovered, 3);
    assert_eq!(report.video_rates, vec![2.0, 2.0]);
    assert_eq!(report.stats.refused_connects, 2);
}

#[tokio::test(start_paused = true)]
async fn scheme_wildcard_rule_applies_on_page_load() {
    let sim = sim_with_rules(&[("*://example.com/*", 2.0)]).await;

    let tab = sim.open_and_load("https://example.com/page", 1).await;
    assert!(sim.wait_connected(tab, SETTLE).await);

    assert_eq!(sim.video_rates(tab), vec![2.0]);
}
