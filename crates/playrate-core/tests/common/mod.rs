//! Shared test infrastructure for playrate-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use playrate_core::clock::MonotonicClock;
use playrate_core::config::Config;
use playrate_core::simulation::Simulation;
use playrate_core::storage::{SiteSettings, SiteSpeedRule};

/// Generous bound for anything that should settle under paused time.
pub const SETTLE: Duration = Duration::from_secs(30);

/// Longer bound for runs that walk the whole reconnect schedule.
pub const EXHAUST: Duration = Duration::from_secs(180);

/// A simulation on default config. Call inside a paused tokio runtime.
pub fn sim() -> Simulation {
    sim_with(Config::default())
}

pub fn sim_with(config: Config) -> Simulation {
    Simulation::new(config, Arc::new(MonotonicClock::new()))
}

pub fn rules(entries: &[(&str, f64)]) -> SiteSettings {
    let mut rules = SiteSettings::default();
    for (pattern, speed) in entries {
        rules.insert(*pattern, SiteSpeedRule::new(*speed, true));
    }
    rules
}

/// Installed simulation with `entries` as site rules.
pub async fn sim_with_rules(entries: &[(&str, f64)]) -> Simulation {
    let sim = sim();
    sim.install().await;
    sim.set_site_rules(&rules(entries)).await.unwrap();
    sim
}

/// Let spawned tasks (storage watchers, channel watchers) run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
