//! Per-page video bookkeeping.
//!
//! [`VideoTracker`] records which `<video>` elements have listeners wired,
//! which are mid-restore after a `ratechange`, and which newly discovered
//! elements wait for the next animation frame.

use std::collections::BTreeSet;

use indexmap::IndexSet;

use crate::host::VideoId;

#[derive(Debug, Default, Clone)]
pub struct VideoTracker {
    initialized: BTreeSet<VideoId>,
    restoring: BTreeSet<VideoId>,
    pending: IndexSet<VideoId>,
    frame_requested: bool,
}

impl VideoTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `video` as wired. False if it already was.
    pub fn track(&mut self, video: VideoId) -> bool {
        self.initialized.insert(video)
    }

    /// Drop `video` and any transient state for it.
    pub fn untrack(&mut self, video: VideoId) -> bool {
        self.restoring.remove(&video);
        self.pending.shift_remove(&video);
        self.initialized.remove(&video)
    }

    #[must_use]
    pub fn is_tracked(&self, video: VideoId) -> bool {
        self.initialized.contains(&video)
    }

    #[must_use]
    pub fn tracked(&self) -> Vec<VideoId> {
        self.initialized.iter().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.initialized.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.initialized.is_empty()
    }

    /// Queue a discovered element for the next frame. Returns true when this
    /// call is the one that needs a frame requested.
    pub fn queue(&mut self, video: VideoId) -> bool {
        if self.initialized.contains(&video) {
            return false;
        }
        self.pending.insert(video);
        !std::mem::replace(&mut self.frame_requested, true)
    }

    #[must_use]
    pub fn frame_requested(&self) -> bool {
        self.frame_requested
    }

    /// Take everything queued since the last frame, skipping elements that
    /// got wired in the meantime.
    pub fn drain_queue(&mut self) -> Vec<VideoId> {
        self.frame_requested = false;
        let initialized = &self.initialized;
        self.pending
            .drain(..)
            .filter(|video| !initialized.contains(video))
            .collect()
    }

    /// Enter the `ratechange` restore guard. False if already restoring.
    pub fn begin_restore(&mut self, video: VideoId) -> bool {
        self.restoring.insert(video)
    }

    /// Animation frame boundary: every restore guard lifts.
    pub fn end_frame(&mut self) {
        self.restoring.clear();
    }

    /// Forget everything, returning the elements that were wired.
    pub fn clear(&mut self) -> Vec<VideoId> {
        self.restoring.clear();
        self.pending.clear();
        self.frame_requested = false;
        std::mem::take(&mut self.initialized).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(id: u64) -> VideoId {
        VideoId::new(id)
    }

    #[test]
    fn track_is_idempotent() {
        let mut t = VideoTracker::new();
        assert!(t.track(v(1)));
        assert!(!t.track(v(1)));
        assert_eq!(t.len(), 1);
        assert!(t.untrack(v(1)));
        assert!(!t.untrack(v(1)));
    }

    #[test]
    fn queue_coalesces_bursts_into_one_frame() {
        let mut t = VideoTracker::new();
        assert!(t.queue(v(1)));
        assert!(!t.queue(v(2)));
        assert!(!t.queue(v(1)));
        assert!(t.frame_requested());

        assert_eq!(t.drain_queue(), vec![v(1), v(2)]);
        assert!(!t.frame_requested());
        assert!(t.drain_queue().is_empty());
    }

    #[test]
    fn drain_skips_already_tracked() {
        let mut t = VideoTracker::new();
        t.queue(v(1));
        t.queue(v(2));
        t.track(v(2));
        assert_eq!(t.drain_queue(), vec![v(1)]);
        // Tracked elements are never queued
        assert!(!t.queue(v(2)));
    }

    #[test]
    fn restore_guard_lifts_on_frame() {
        let mut t = VideoTracker::new();
        assert!(t.begin_restore(v(1)));
        assert!(!t.begin_restore(v(1)));
        t.end_frame();
        assert!(t.begin_restore(v(1)));
    }

    #[test]
    fn clear_returns_wired_elements() {
        let mut t = VideoTracker::new();
        t.track(v(3));
        t.track(v(1));
        t.queue(v(5));
        assert_eq!(t.clear(), vec![v(1), v(3)]);
        assert!(t.is_empty());
        assert!(!t.frame_requested());
    }
}
