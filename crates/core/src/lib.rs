//! Core types and codecs for raftshard
//!
//! This crate defines the foundational pieces shared by the store and the
//! engine:
//! - RegionId / Timestamp / raft index aliases
//! - CfName: the closed set of column families (Default, Write, Lock)
//! - WriteKind / LockKind: MVCC record discriminators
//! - TiKV-style MVCC key and value codecs
//! - Error: error type hierarchy
//! - MemoryAccountant: injected allocation accounting handle

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod mem;
pub mod types;

pub use codec::{
    decode_lock_value, decode_mvcc_key, decode_write_value, encode_lock_value, encode_mvcc_key,
    encode_write_value, LockRecord, WriteRecord,
};
pub use error::{Error, Result};
pub use mem::MemoryAccountant;
pub use types::{
    CfName, KeyRange, LockKind, PeerId, RaftIndex, RaftTerm, RegionId, StoreId, Timestamp,
    WriteKind,
};
