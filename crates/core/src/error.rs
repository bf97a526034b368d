//! Error types for raftshard
//!
//! Per-shard apply errors are fatal to that shard's further processing and
//! must be surfaced to the caller; they are never retried automatically,
//! since success or failure determines whether Raft advances the applied
//! index.

use crate::types::{RaftIndex, RegionId, Timestamp};
use std::io;
use thiserror::Error;

/// Result type alias for raftshard operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the region state-machine layer.
#[derive(Debug, Error)]
pub enum Error {
    /// A Write-CF record could not be resolved to its Default-CF value
    /// outside a tolerated orphan window. Non-recoverable data-integrity
    /// violation for the shard.
    #[error(
        "illformed row: raw key {raw_key:?} start_ts {start_ts} has no default value, \
         region_id={region_id} applied_index={applied_index}"
    )]
    IllformedRow {
        /// Shard the record belongs to.
        region_id: RegionId,
        /// Applied index at the time of the failed read.
        applied_index: RaftIndex,
        /// Decoded raw key of the record.
        raw_key: Vec<u8>,
        /// Prewrite timestamp that failed to resolve.
        start_ts: Timestamp,
    },

    /// Pending orphan keys remain past the reconciliation deadline.
    /// A write whose value-half never arrived is unrecoverable data loss.
    #[error(
        "orphan keys from snapshot still exist: one of total {remained} is {sample_key:?}, \
         region_id={region_id} snapshot_index={snapshot_index} deadline_index={deadline_index} \
         applied_index={applied_index}"
    )]
    OrphanKeysRemain {
        /// Shard the orphans belong to.
        region_id: RegionId,
        /// Index of the snapshot that introduced the orphans.
        snapshot_index: RaftIndex,
        /// Index by which all orphans must have been reconciled.
        deadline_index: RaftIndex,
        /// Applied index that crossed the deadline.
        applied_index: RaftIndex,
        /// Number of still-pending orphan keys.
        remained: u64,
        /// One example pending key, for diagnosis.
        sample_key: Vec<u8>,
    },

    /// The region id is not present in the region map.
    #[error("region {0} not found")]
    RegionNotFound(RegionId),

    /// A split/merge request carried malformed ranges or ids. Logic error,
    /// fails fast, never retried.
    #[error("inconsistent admin command: {0}")]
    InconsistentAdminCommand(String),

    /// Insert with `DupPolicy::Reject` hit an existing entry.
    #[error("duplicate entry rejected")]
    DuplicateEntry,

    /// Malformed key or value bytes.
    #[error("codec error: {0}")]
    Codec(String),

    /// The persistence collaborator failed.
    #[error("persist error: {0}")]
    Persist(String),

    /// Flushing committed rows into the columnar engine failed.
    #[error("flush error: {0}")]
    Flush(String),

    /// The columnar storage engine reported an error.
    #[error("engine error: {0}")]
    Engine(String),

    /// Snapshot pre-handling was aborted or could not be scheduled.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// A read-index request did not complete within its timeout.
    #[error("read index timed out")]
    ReadIndexTimeout,

    /// I/O error from a collaborator.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_illformed_row_display() {
        let err = Error::IllformedRow {
            region_id: 7,
            applied_index: 42,
            raw_key: b"rowA".to_vec(),
            start_ts: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("illformed row"));
        assert!(msg.contains("region_id=7"));
        assert!(msg.contains("applied_index=42"));
    }

    #[test]
    fn test_orphan_keys_display() {
        let err = Error::OrphanKeysRemain {
            region_id: 1,
            snapshot_index: 10,
            deadline_index: 20,
            applied_index: 21,
            remained: 3,
            sample_key: b"k".to_vec(),
        };
        let msg = err.to_string();
        assert!(msg.contains("orphan keys"));
        assert!(msg.contains("total 3"));
        assert!(msg.contains("deadline_index=20"));
    }

    #[test]
    fn test_from_io() {
        let io_err = io::Error::new(io::ErrorKind::Other, "disk gone");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_region_not_found_display() {
        assert_eq!(Error::RegionNotFound(9).to_string(), "region 9 not found");
    }
}
