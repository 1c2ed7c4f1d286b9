//! Process-wide store of context lanes.
//!
//! The map is guarded by a plain `std::sync::Mutex`; callers get access only
//! through closures, so the lock can never be held across an `.await`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::context_lane::{ContextLane, LaneEstimate, LaneKey, Turn};

/// Result of asking to start a compaction on a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionSlot {
    /// The caller now owns the lane's compaction
    Acquired,
    /// Another compaction is running; the request was recorded as queued
    Queued,
    /// Another compaction is running; nothing was recorded
    Busy,
}

#[derive(Debug, Default)]
pub struct ContextLaneStore {
    lanes: Mutex<HashMap<LaneKey, ContextLane>>,
}

impl ContextLaneStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<LaneKey, ContextLane>> {
        self.lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` against the lane for `key`, creating it on first use.
    pub fn with_lane<R>(&self, key: &LaneKey, f: impl FnOnce(&mut ContextLane) -> R) -> R {
        let mut lanes = self.lock();
        let lane = lanes
            .entry(key.clone())
            .or_insert_with(|| ContextLane::new(key.clone()));
        f(lane)
    }

    pub fn snapshot(&self, key: &LaneKey) -> ContextLane {
        self.with_lane(key, |lane| lane.clone())
    }

    pub fn append_turn(&self, key: &LaneKey, turn: Turn, usage_fraction: f32) {
        self.with_lane(key, |lane| lane.append_turn(turn, usage_fraction));
    }

    pub fn estimate(
        &self,
        key: &LaneKey,
        incoming_prompt: &str,
        context_window: u32,
        reserve_tokens: u32,
    ) -> LaneEstimate {
        self.with_lane(key, |lane| lane.estimate(incoming_prompt, context_window, reserve_tokens))
    }

    pub fn render_memory(&self, key: &LaneKey) -> String {
        self.with_lane(key, |lane| lane.render_memory())
    }

    pub fn try_begin_compaction(&self, key: &LaneKey, queue_if_busy: bool) -> CompactionSlot {
        self.with_lane(key, |lane| {
            if !lane.compaction_in_flight {
                lane.compaction_in_flight = true;
                lane.compaction_queued = false;
                CompactionSlot::Acquired
            } else if queue_if_busy {
                lane.compaction_queued = true;
                CompactionSlot::Queued
            } else {
                CompactionSlot::Busy
            }
        })
    }

    /// Release the lane's compaction slot. Returns whether another run was queued meanwhile.
    pub fn finish_compaction(&self, key: &LaneKey) -> bool {
        self.with_lane(key, |lane| {
            lane.compaction_in_flight = false;
            std::mem::take(&mut lane.compaction_queued)
        })
    }

    pub fn lane_count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lanes_are_created_lazily_and_isolated() {
        let store = ContextLaneStore::new();
        let a = LaneKey::new("s1", "notes");
        let b = LaneKey::new("s1", "weather");

        store.with_lane(&a, |lane| lane.summary = "about notes".to_string());
        assert_eq!(store.lane_count(), 1);
        assert_eq!(store.snapshot(&b).summary, "");
        assert_eq!(store.snapshot(&a).summary, "about notes");
        assert_eq!(store.lane_count(), 2);
    }

    #[test]
    fn test_compaction_slot_coalesces_triggers() {
        let store = ContextLaneStore::new();
        let key = LaneKey::new("s", "app");

        assert_eq!(store.try_begin_compaction(&key, true), CompactionSlot::Acquired);
        assert_eq!(store.try_begin_compaction(&key, false), CompactionSlot::Busy);
        assert!(!store.snapshot(&key).compaction_queued);
        assert_eq!(store.try_begin_compaction(&key, true), CompactionSlot::Queued);
        assert_eq!(store.try_begin_compaction(&key, true), CompactionSlot::Queued);

        assert!(store.finish_compaction(&key));
        let lane = store.snapshot(&key);
        assert!(!lane.compaction_in_flight);
        assert!(!lane.compaction_queued);
        assert!(!store.finish_compaction(&key));
    }
}
