//! Raft command surface
//!
//! Committed log entries arrive as either a batch of CF writes or a single
//! admin command, each tagged with `(region_id, index, term)`. Raft
//! delivers at-least-once, so every command here must be safe to replay.

use raftshard_core::{CfName, RaftIndex, RaftTerm, RegionId};

/// Kind of a single CF write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdKind {
    /// Insert or overwrite an entry.
    Put,
    /// Remove an entry.
    Delete,
}

/// One CF write within a committed log entry.
#[derive(Debug, Clone)]
pub struct WriteCmd {
    /// Target column family.
    pub cf: CfName,
    /// Put or Delete.
    pub kind: CmdKind,
    /// Encoded key.
    pub key: Vec<u8>,
    /// Encoded value; empty for deletes.
    pub value: Vec<u8>,
}

impl WriteCmd {
    /// A put of `value` at `key` in `cf`.
    pub fn put(cf: CfName, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            cf,
            kind: CmdKind::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    /// A delete of `key` in `cf`.
    pub fn delete(cf: CfName, key: impl Into<Vec<u8>>) -> Self {
        Self {
            cf,
            kind: CmdKind::Delete,
            key: key.into(),
            value: Vec::new(),
        }
    }
}

/// One child produced by a region split. The child's range must take an
/// end of the parent's remaining range; interior ranges are rejected as
/// inconsistent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitRequest {
    /// Id assigned to the new region.
    pub new_region_id: RegionId,
    /// Peer id of this store in the new region's raft group.
    pub new_peer_id: u64,
    /// Start of the child's raw-key range (inclusive).
    pub start: Vec<u8>,
    /// End of the child's raw-key range (exclusive, empty = unbounded).
    pub end: Vec<u8>,
}

/// Replicated admin command.
#[derive(Debug, Clone)]
pub enum AdminCmd {
    /// Carve one or more child regions out of the target region.
    Split {
        /// Children to create, with their ranges.
        splits: Vec<SplitRequest>,
    },
    /// First phase of a merge; the source region stops serving.
    PrepareMerge {
        /// Region the data will fold into.
        target: RegionId,
    },
    /// Second phase of a merge; fold the source into the target.
    CommitMerge {
        /// Region being absorbed.
        source: RegionId,
    },
    /// Advance the truncated raft log state.
    CompactLog {
        /// New truncated index.
        compact_index: RaftIndex,
        /// Term of the entry at `compact_index`.
        compact_term: RaftTerm,
    },
    /// Membership change. Data is unaffected; bookkeeping only.
    ChangePeer,
}

impl AdminCmd {
    /// Short command name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            AdminCmd::Split { .. } => "Split",
            AdminCmd::PrepareMerge { .. } => "PrepareMerge",
            AdminCmd::CommitMerge { .. } => "CommitMerge",
            AdminCmd::CompactLog { .. } => "CompactLog",
            AdminCmd::ChangePeer => "ChangePeer",
        }
    }
}

/// Outcome of applying a committed entry, reported back to the raft layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyRes {
    /// Applied; no persistence required right now.
    None,
    /// Applied; the raft layer should persist the region's apply state.
    Persist,
    /// The target region is not on this store.
    NotFound,
}
