//! playrate-core: Core library for playrate
//!
//! This crate implements the protocol between a privileged **coordinator**
//! and the **page agents** it injects into tabs to control video playback
//! rate. The host runtime (tabs, script execution, messaging, storage, the
//! page DOM) sits behind traits so the protocol runs the same against a real
//! embedding or the in-memory simulation host.
//!
//! # Architecture
//!
//! ```text
//! shortcut / popup → Coordinator ──inject──→ PageAgent ──→ <video> elements
//!                        ↑  ↓ one-shot messages   ↑
//!                        └── long-lived channel ──┘
//!                                 ↓
//!                        KeyValueStore (siteSettings, tab speeds)
//! ```
//!
//! # Modules
//!
//! - `agent`: page agent connection state machine, site rules, command dispatch
//! - `coordinator`: exactly-once injection, liveness ports, relays
//! - `channel`: long-lived named channel pairs
//! - `message`: wire commands, requests and replies
//! - `reconnect`: reconnect bookkeeping and the recovery flag
//! - `retry`: retry policies with bounded backoff
//! - `url_pattern`: wildcard URL patterns
//! - `storage`: key-value store, site rules, caches
//! - `diagnostics`: rate-limited logging
//! - `speed` / `speed_input`: speed values, shortcut chords, the in-page popup
//! - `video`: per-page video element tracking
//! - `host`: host runtime traits
//! - `simulation`: in-memory browser host
//! - `config` / `logging`: configuration and tracing setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod agent;
pub mod channel;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod error;
pub mod host;
pub mod logging;
pub mod message;
pub mod reconnect;
pub mod retry;
pub mod runtime;
pub mod simulation;
pub mod speed;
pub mod speed_input;
pub mod storage;
pub mod url_pattern;
pub mod video;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
