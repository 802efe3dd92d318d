//! Host runtime boundary.
//!
//! The browser side of the system (tabs, script execution, one-shot
//! messaging, long-lived channels, the page DOM) sits behind these traits.
//! [`PageHost`] is what a page agent sees; [`TabHost`] is what the
//! coordinator sees. [`crate::simulation::SimBrowser`] implements both.
//!
//! Every method that crosses a context boundary returns a `Send` future so
//! handles can drive it from spawned tasks.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::channel::ChannelEnd;
use crate::error::HostError;
use crate::message::{AgentRequest, Command, Reply};
use crate::speed::Speed;
use crate::storage::KeyValueStore;

/// Browser tab identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(u64);

impl TabId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a `<video>` element within one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VideoId(u64);

impl VideoId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "video#{}", self.0)
    }
}

/// Media events the agent listens for on each tracked video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoEvent {
    LoadedMetadata,
    LoadStart,
    CanPlay,
    Play,
    RateChange,
}

impl VideoEvent {
    /// Events after which the target speed is pushed again.
    #[must_use]
    pub fn reapplies_speed(self) -> bool {
        !matches!(self, Self::RateChange)
    }
}

/// The page DOM as seen by an agent.
pub trait Document: Send + Sync + 'static {
    fn current_url(&self) -> String;

    /// Every `<video>` currently in the document, in document order.
    fn videos(&self) -> Vec<VideoId>;

    fn is_attached(&self, video: VideoId) -> bool;

    fn playback_rate(&self, video: VideoId) -> Option<f64>;

    /// Set the element's rate. False if the element is gone.
    fn set_playback_rate(&self, video: VideoId, rate: f64) -> bool;

    fn show_speed_input(&self, current: Speed);

    fn hide_speed_input(&self);
}

/// Runtime services available to a page agent.
pub trait PageHost: Send + Sync + 'static {
    type Store: KeyValueStore;
    type Document: Document;

    fn store(&self) -> Arc<Self::Store>;

    fn document(&self) -> &Self::Document;

    /// Open a long-lived named channel to the coordinator.
    fn connect(&self, name: &str) -> Result<ChannelEnd, HostError>;

    /// One-shot request to the coordinator.
    fn send_message(
        &self,
        request: AgentRequest,
    ) -> impl Future<Output = Result<Reply, HostError>> + Send;
}

/// A tab as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: TabId,
    pub url: String,
    #[serde(default)]
    pub active: bool,
}

/// Runtime services available to the coordinator.
pub trait TabHost: Send + Sync + 'static {
    type Store: KeyValueStore;

    fn store(&self) -> Arc<Self::Store>;

    /// Version string written to storage on install/update.
    fn extension_version(&self) -> String;

    /// Run the agent script in `tab`'s current page context.
    fn execute_script(&self, tab: TabId) -> impl Future<Output = Result<(), HostError>> + Send;

    /// One-shot command to the agent in `tab`.
    fn send_to_tab(
        &self,
        tab: TabId,
        command: Command,
    ) -> impl Future<Output = Result<Reply, HostError>> + Send;

    fn tab(&self, tab: TabId) -> impl Future<Output = Result<TabInfo, HostError>> + Send;

    /// The focused tab of the current window, if any.
    fn active_tab(&self) -> impl Future<Output = Result<Option<TabInfo>, HostError>> + Send;

    /// Tabs with `http`/`https` URLs.
    fn scriptable_tabs(&self) -> impl Future<Output = Result<Vec<TabInfo>, HostError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_and_serialize_transparently() {
        assert_eq!(TabId::new(3).to_string(), "3");
        assert_eq!(VideoId::new(9).to_string(), "video#9");
        assert_eq!(serde_json::to_string(&TabId::new(3)).unwrap(), "3");
    }

    #[test]
    fn rate_change_does_not_reapply() {
        assert!(VideoEvent::Play.reapplies_speed());
        assert!(VideoEvent::LoadedMetadata.reapplies_speed());
        assert!(!VideoEvent::RateChange.reapplies_speed());
    }
}
