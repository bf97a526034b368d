//! Orphan-key tracking for snapshot ingestion
//!
//! A snapshot arrives split across independent column families, so a
//! Write-CF record may be observed before its Default-CF counterpart.
//! Such write keys are *orphans*: accepted and remembered during
//! pre-handling, then reconciled one by one as normal Raft log replay
//! re-delivers them. Every orphan must be reconciled before the applied
//! index reaches the deadline recorded at pre-handle time; a leftover
//! orphan past the deadline means its value half will never be replicated,
//! which is silent data loss and therefore fatal.
//!
//! States: pre-handling → awaiting replay → reconciled.

use raftshard_core::codec::decode_mvcc_key;
use raftshard_core::{Error, KeyRange, RaftIndex, RegionId, Result};
use std::collections::BTreeSet;
use tracing::debug;

/// Pending orphan write keys for one region, with the snapshot context
/// that introduced them.
#[derive(Debug, Clone, Default)]
pub struct OrphanKeysInfo {
    /// Encoded Write-CF keys whose Default-CF counterpart has not arrived.
    pending: BTreeSet<Vec<u8>>,
    /// True while snapshot conversion is in progress.
    pub pre_handling: bool,
    /// Raft index of the snapshot that may leave orphans behind.
    pub snapshot_index: Option<RaftIndex>,
    /// Applied index by which every orphan must be reconciled.
    pub deadline_index: Option<RaftIndex>,
    /// Region the orphans belong to, for diagnostics.
    pub region_id: RegionId,
}

impl OrphanKeysInfo {
    /// Create a tracker for `region_id` with no snapshot context.
    pub fn new(region_id: RegionId) -> Self {
        Self {
            region_id,
            ..Self::default()
        }
    }

    /// Record a write key observed without its default counterpart.
    /// Valid while pre-handling a snapshot.
    pub fn observe_extra_key(&mut self, key: Vec<u8>) {
        self.pending.insert(key);
    }

    /// A normal Raft write re-delivered `key`. Removes it from the pending
    /// set; returns whether it was pending (i.e. an orphan got reconciled).
    pub fn observe_key_from_normal_write(&mut self, key: &[u8]) -> bool {
        let reconciled = self.pending.remove(key);
        if reconciled {
            debug!(
                target: "raftshard::store",
                region_id = self.region_id,
                remained = self.pending.len(),
                "Orphan write key reconciled by raft log"
            );
        }
        reconciled
    }

    /// Whether `key` is a known pending orphan.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.pending.contains(key)
    }

    /// Number of still-pending orphan keys.
    pub fn remained_key_count(&self) -> u64 {
        self.pending.len() as u64
    }

    /// Check the reconciliation deadline after the applied index advanced.
    ///
    /// Fails fatally when both snapshot and deadline indices are set, the
    /// applied index has reached the deadline, and orphans remain. Below
    /// the deadline this never fails regardless of the pending count.
    pub fn advance_applied_index(&mut self, applied_index: RaftIndex) -> Result<()> {
        if let (Some(snapshot_index), Some(deadline_index)) =
            (self.snapshot_index, self.deadline_index)
        {
            let remained = self.remained_key_count();
            if applied_index >= deadline_index && remained > 0 {
                let sample_key = self
                    .pending
                    .iter()
                    .next()
                    .cloned()
                    .unwrap_or_default();
                return Err(Error::OrphanKeysRemain {
                    region_id: self.region_id,
                    snapshot_index,
                    deadline_index,
                    applied_index,
                    remained,
                    sample_key,
                });
            }
        }
        Ok(())
    }

    /// Union another tracker's pending set into this one. Used when a
    /// region merge folds shards together.
    pub fn merge_from(&mut self, other: &mut OrphanKeysInfo) {
        self.pending.append(&mut other.pending);
    }

    /// Move pending keys whose decoded raw key falls in `range` into `dst`,
    /// so a split child keeps only the orphans it can still reconcile.
    /// Keys that fail to decode stay behind.
    pub fn split_into(&mut self, range: &KeyRange, dst: &mut OrphanKeysInfo) {
        let moved: Vec<Vec<u8>> = self
            .pending
            .iter()
            .filter(|key| {
                decode_mvcc_key(key)
                    .map(|(raw, _)| range.contains(&raw))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for key in moved {
            self.pending.remove(&key);
            dst.pending.insert(key);
        }
    }
}
