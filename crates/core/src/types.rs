//! Core identifiers and MVCC discriminators
//!
//! Regions, peers and stores are identified by u64 ids handed out by the
//! external Raft runtime; timestamps are logical clock values from the
//! transaction layer. None of these are generated locally.

use std::fmt;

/// Identifier of one key-range shard replicated via Raft.
pub type RegionId = u64;

/// Identifier of one peer (replica) of a region.
pub type PeerId = u64;

/// Identifier of the hosting store (node).
pub type StoreId = u64;

/// Raft log index.
pub type RaftIndex = u64;

/// Raft term.
pub type RaftTerm = u64;

/// Logical clock value: a transaction start or commit timestamp.
pub type Timestamp = u64;

/// A contiguous raw-key range `[start, end)`.
///
/// An empty `end` means unbounded, matching the TiKV convention for the
/// right-most region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    /// Inclusive start of the range.
    pub start: Vec<u8>,
    /// Exclusive end of the range; empty means +infinity.
    pub end: Vec<u8>,
}

impl KeyRange {
    /// Build a range from raw-key bounds.
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Whether `raw_key` falls inside this range.
    pub fn contains(&self, raw_key: &[u8]) -> bool {
        raw_key >= self.start.as_slice() && (self.end.is_empty() || raw_key < self.end.as_slice())
    }

    /// Whether the bounds describe a non-empty, well-ordered range.
    pub fn is_well_formed(&self) -> bool {
        self.end.is_empty() || self.start < self.end
    }

    /// Whether two ranges share at least one key.
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        let self_before_other = !self.end.is_empty() && self.end.as_slice() <= other.start.as_slice();
        let other_before_self = !other.end.is_empty() && other.end.as_slice() <= self.start.as_slice();
        !(self_before_other || other_before_self)
    }
}

/// The closed set of column families within a region.
///
/// Each CF is a separate key-value namespace:
/// - `Default`: full values keyed by (raw key, start ts)
/// - `Write`: commit records keyed by (raw key, commit ts)
/// - `Lock`: in-flight transaction locks keyed by raw key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CfName {
    /// Values for transactional writes that were not inlined.
    Default,
    /// Commit records.
    Write,
    /// Pending transaction locks.
    Lock,
}

impl CfName {
    /// One-byte tag used in the serialized region layout.
    pub fn tag(self) -> u8 {
        match self {
            CfName::Default => 0x01,
            CfName::Write => 0x02,
            CfName::Lock => 0x03,
        }
    }

    /// Inverse of [`CfName::tag`].
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(CfName::Default),
            0x02 => Some(CfName::Write),
            0x03 => Some(CfName::Lock),
            _ => None,
        }
    }
}

impl fmt::Display for CfName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CfName::Default => write!(f, "default"),
            CfName::Write => write!(f, "write"),
            CfName::Lock => write!(f, "lock"),
        }
    }
}

/// Kind of a Write-CF commit record.
///
/// Flag bytes follow the TiKV convention so that serialized records stay
/// recognizable in hex dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// A committed put. The value is inlined as a short value or lives in
    /// the Default CF at (raw key, start ts).
    Put,
    /// A committed delete.
    Delete,
    /// A rolled-back prewrite.
    Rollback,
    /// A committed lock record (no data change).
    Lock,
}

impl WriteKind {
    /// One-byte flag used by the write value codec.
    pub fn flag(self) -> u8 {
        match self {
            WriteKind::Put => b'P',
            WriteKind::Delete => b'D',
            WriteKind::Rollback => b'R',
            WriteKind::Lock => b'L',
        }
    }

    /// Inverse of [`WriteKind::flag`].
    pub fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            b'P' => Some(WriteKind::Put),
            b'D' => Some(WriteKind::Delete),
            b'R' => Some(WriteKind::Rollback),
            b'L' => Some(WriteKind::Lock),
            _ => None,
        }
    }
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteKind::Put => write!(f, "put"),
            WriteKind::Delete => write!(f, "delete"),
            WriteKind::Rollback => write!(f, "rollback"),
            WriteKind::Lock => write!(f, "lock"),
        }
    }
}

/// Kind of a Lock-CF descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Prewrite of a put.
    Put,
    /// Prewrite of a delete.
    Delete,
    /// A lock that changes no data.
    Lock,
    /// A pessimistic lock taken before prewrite.
    PessimisticLock,
}

impl LockKind {
    /// One-byte flag used by the lock value codec.
    pub fn flag(self) -> u8 {
        match self {
            LockKind::Put => b'P',
            LockKind::Delete => b'D',
            LockKind::Lock => b'L',
            LockKind::PessimisticLock => b'S',
        }
    }

    /// Inverse of [`LockKind::flag`].
    pub fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            b'P' => Some(LockKind::Put),
            b'D' => Some(LockKind::Delete),
            b'L' => Some(LockKind::Lock),
            b'S' => Some(LockKind::PessimisticLock),
            _ => None,
        }
    }

    /// Locks of these kinds never block a read.
    pub fn blocks_read(self) -> bool {
        !matches!(self, LockKind::Lock | LockKind::PessimisticLock)
    }
}
