//! Collaborator seams
//!
//! The store layer drives three external collaborators: a persister that
//! durably records region state, the columnar engine that receives
//! committed rows at flush time, and a read-index client that asks the
//! raft leader for a linearizable read point. All three are traits so
//! tests can substitute in-memory fakes.

use raftshard_core::{RaftIndex, RegionId, Result, Timestamp, WriteKind};
use raftshard_store::Region;
use std::fmt;

/// Why a region is being persisted. Carried into logs so operators can
/// attribute persistence traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistReason {
    /// Manual or diagnostic persistence.
    Debug,
    /// Admin command that changed nothing but still advanced apply state.
    UselessAdminCommand,
    /// Admin command that changed region structure.
    AdminCommand,
    /// Threshold-triggered flush of committed rows.
    Flush,
    /// Flush requested ahead of thresholds by the raft layer.
    ProactiveFlush,
    /// Previous incarnation of a region overwritten by a snapshot.
    ApplySnapshotPrevRegion,
    /// Region state after a snapshot swap.
    ApplySnapshotCurRegion,
    /// SST ingestion outside the snapshot path.
    IngestSst,
    /// Eager raft-log GC advanced the truncated state.
    EagerRaftGc,
}

impl fmt::Display for PersistReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PersistReason::Debug => "Debug",
            PersistReason::UselessAdminCommand => "UselessAdminCommand",
            PersistReason::AdminCommand => "AdminCommand",
            PersistReason::Flush => "Flush",
            PersistReason::ProactiveFlush => "ProactiveFlush",
            PersistReason::ApplySnapshotPrevRegion => "ApplySnapshotPrevRegion",
            PersistReason::ApplySnapshotCurRegion => "ApplySnapshotCurRegion",
            PersistReason::IngestSst => "IngestSst",
            PersistReason::EagerRaftGc => "EagerRaftGc",
        };
        f.write_str(s)
    }
}

/// Durably records region apply state and data.
pub trait RegionPersister: Send + Sync {
    /// Persist `region`. Called under the region's task lock.
    fn persist(&self, region: &Region, reason: PersistReason) -> Result<()>;
}

/// A committed row handed to the columnar engine at flush time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedRow {
    /// Decoded raw key.
    pub raw_key: Vec<u8>,
    /// Put or Delete (Rollback/Lock records are dropped before flush).
    pub kind: WriteKind,
    /// Commit timestamp.
    pub commit_ts: Timestamp,
    /// Row value; `None` for deletes.
    pub value: Option<Vec<u8>>,
}

/// Downstream columnar storage receiving flushed rows.
pub trait ColumnarEngine: Send + Sync {
    /// Append a batch of committed rows for `region_id`.
    fn write_rows(&self, region_id: RegionId, rows: Vec<CommittedRow>) -> Result<()>;
    /// Drop all data held for `region_id`.
    fn remove_region(&self, region_id: RegionId) -> Result<()>;
}

/// One read-index request to the raft leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadIndexRequest {
    /// Region the read targets.
    pub region_id: RegionId,
    /// Read timestamp the caller intends to use.
    pub read_ts: Timestamp,
}

/// Leader's answer to a read-index request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadIndexResponse {
    /// Raft index the reader must wait for, when the region is ready.
    pub read_index: Option<RaftIndex>,
    /// The region was not ready (not leader, merging, or timed out).
    pub region_error: bool,
}

impl ReadIndexResponse {
    /// A ready response carrying `read_index`.
    pub fn ready(read_index: RaftIndex) -> Self {
        Self {
            read_index: Some(read_index),
            region_error: false,
        }
    }

    /// A region-error response; the caller retries through raft routing.
    pub fn region_error() -> Self {
        Self {
            read_index: None,
            region_error: true,
        }
    }
}

/// Blocking transport to the raft leader for read-index queries.
pub trait ReadIndexClient: Send + Sync {
    /// Ask the leader for the read index. Blocks until a response arrives
    /// or the transport gives up.
    fn read_index(&self, req: &ReadIndexRequest) -> Result<ReadIndexResponse>;
}

/// One key/value pair streamed out of a snapshot SST.
#[derive(Debug, Clone)]
pub struct SstEntry {
    /// Encoded key as stored in the SST.
    pub key: Vec<u8>,
    /// Raw value bytes.
    pub value: Vec<u8>,
}

/// Source of snapshot data for one column family.
pub trait SstReader: Send {
    /// Column family this reader covers.
    fn cf(&self) -> raftshard_core::CfName;
    /// Next entry in key order, `None` at end of stream.
    fn next_entry(&mut self) -> Result<Option<SstEntry>>;
}
