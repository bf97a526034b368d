//! Apply-side engine for the raft state-machine layer
//!
//! Sits between the raft transport and the columnar storage engine: takes
//! committed write batches, admin commands, and snapshots; maintains the
//! per-region MVCC state in `raftshard-store`; flushes committed rows
//! downstream when thresholds fire; and answers linearizable-read
//! (read-index) batches.
//!
//! # Design
//!
//! - [`kvstore::KVStore`] is the single orchestrator; collaborators
//!   (persister, columnar engine, read-index transport) are injected as
//!   trait objects from [`traits`].
//! - Snapshot conversion runs on a bounded worker pool
//!   ([`prehandle::PrehandlePool`]) and is cancellable through
//!   [`prehandle::PreHandlingTrace`].
//! - Every command is safe under raft's at-least-once redelivery: stale
//!   indices are no-ops and CF inserts overwrite.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cmd;
pub mod kvstore;
pub mod prehandle;
pub mod raft_log_gc;
pub mod read_index;
pub mod traits;

pub use cmd::{AdminCmd, ApplyRes, CmdKind, SplitRequest, WriteCmd};
pub use kvstore::{KVStore, KVStoreConfig, PrehandleResult, RegionStub};
pub use prehandle::{PreHandlingTrace, PrehandlePool, PrehandleTask};
pub use raft_log_gc::{RaftLogGcHint, RaftLogGcHints, RaftLogGcTaskRes};
pub use read_index::ReadIndexWorkers;
pub use traits::{
    ColumnarEngine, CommittedRow, PersistReason, ReadIndexClient, ReadIndexRequest,
    ReadIndexResponse, RegionPersister, SstEntry, SstReader,
};
