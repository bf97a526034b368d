//! In-memory region store for the raft state-machine layer
//!
//! This crate holds the per-region MVCC data structures: typed
//! column-family stores, the orphan-key tracker for snapshot pre-handling,
//! the region abstraction with its raft apply state, and the concurrent
//! region table.
//!
//! # Design
//!
//! - Each region owns three ordered CF stores (Default, Write, Lock) whose
//!   codecs and size accounting are fixed per family via [`cf::CfLayout`].
//! - Every Default/Write mutation reports a signed byte delta to an
//!   injected [`raftshard_core::MemoryAccountant`]; ownership transfers
//!   reconcile instead of re-reporting, so the process-wide aggregate
//!   stays exact across split, merge, snapshot swap, and drop.
//! - Locking is two-level: a `RwLock` map for region lookup plus a
//!   per-region task lock serializing apply/flush/persist sequences.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cf;
pub mod orphan;
pub mod region;
pub mod region_data;
pub mod region_manager;

pub use cf::{CfData, CfLayout, DefaultCf, DupPolicy, LockCf, MvccKey, WriteCf};
pub use orphan::OrphanKeysInfo;
pub use region::{Region, RegionMeta};
pub use region_data::{LockQuery, RegionData, RegionDataReadInfo};
pub use region_manager::{RegionManager, RegionPtr};
