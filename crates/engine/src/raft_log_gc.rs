//! Eager raft-log GC hints
//!
//! The raft layer normally truncates its log when a compact-log command
//! commits, which follows a flush. Under write-heavy load a region can
//! accumulate a long log tail before any flush triggers, so after each
//! write apply the store compares `applied - truncated` against a
//! configurable gap and, when exceeded, records a hint. The raft layer
//! periodically drains the hints, runs its own GC tasks, and reports the
//! results back so the hint table tracks the advanced truncated state.

use parking_lot::Mutex;
use raftshard_core::{RaftIndex, RegionId};
use rustc_hash::FxHashMap;
use tracing::debug;

/// Suggestion to the raft layer to truncate one region's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaftLogGcHint {
    /// Region whose log tail grew past the eager gap.
    pub region_id: RegionId,
    /// Applied index at hint time; the raft layer may truncate up to it.
    pub applied_index: RaftIndex,
    /// Truncated state known when the hint was recorded.
    pub truncated_index: RaftIndex,
}

/// Result of one raft-log GC task executed by the raft layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaftLogGcTaskRes {
    /// Region the task ran for.
    pub region_id: RegionId,
    /// Truncated index after the task completed.
    pub new_truncated_index: RaftIndex,
}

#[derive(Debug, Default, Clone, Copy)]
struct GcState {
    /// Last truncated index confirmed by a completed GC task.
    confirmed_truncated: RaftIndex,
    /// Hint currently pending pickup, if any.
    pending_hint: Option<RaftIndex>,
}

/// Per-region eager-GC bookkeeping.
#[derive(Debug, Default)]
pub struct RaftLogGcHints {
    states: Mutex<FxHashMap<RegionId, GcState>>,
}

impl RaftLogGcHints {
    /// Create an empty hint table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe a write apply. Records a hint when the log tail since the
    /// last confirmed truncation reaches `eager_gap`. A gap of zero
    /// disables eager GC. Repeated applies before pickup collapse into one
    /// hint at the newest applied index.
    pub fn observe_applied(
        &self,
        region_id: RegionId,
        applied_index: RaftIndex,
        truncated_index: RaftIndex,
        eager_gap: u64,
    ) {
        if eager_gap == 0 {
            return;
        }
        let mut states = self.states.lock();
        let state = states.entry(region_id).or_default();
        if state.confirmed_truncated < truncated_index {
            state.confirmed_truncated = truncated_index;
        }
        if applied_index.saturating_sub(state.confirmed_truncated) >= eager_gap {
            state.pending_hint = Some(applied_index);
        }
    }

    /// Drain all pending hints for the raft layer to act on.
    pub fn drain(&self) -> Vec<RaftLogGcHint> {
        let mut states = self.states.lock();
        let mut hints = Vec::new();
        for (&region_id, state) in states.iter_mut() {
            if let Some(applied_index) = state.pending_hint.take() {
                hints.push(RaftLogGcHint {
                    region_id,
                    applied_index,
                    truncated_index: state.confirmed_truncated,
                });
            }
        }
        if !hints.is_empty() {
            debug!(target: "raftshard::raftlog", count = hints.len(), "Eager raft-log GC hints drained");
        }
        hints
    }

    /// Fold a completed GC task's result into the table.
    pub fn apply_task_res(&self, res: RaftLogGcTaskRes) {
        let mut states = self.states.lock();
        let state = states.entry(res.region_id).or_default();
        if res.new_truncated_index > state.confirmed_truncated {
            state.confirmed_truncated = res.new_truncated_index;
        }
    }

    /// Forget a destroyed region's state.
    pub fn remove_region(&self, region_id: RegionId) {
        self.states.lock().remove(&region_id);
    }
}
