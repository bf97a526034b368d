//! Region: raft apply state plus MVCC data
//!
//! A region is one raft group's slice of the key space. It pairs the
//! replicated metadata (applied index/term, truncated log state, key range)
//! with the in-memory [`RegionData`]. Persisted form:
//!
//! ```text
//! +------------------+ 0
//! | magic "RGSD"     | 4 bytes
//! | format version   | 4 bytes LE
//! | meta             | 48 bytes + variable range keys
//! +------------------+
//! | Default CF       | count + length-prefixed entries
//! | Write CF         |
//! | Lock CF          |
//! +------------------+
//! | Footer CRC32     | 4 bytes LE, over everything above
//! +------------------+
//! ```

use crate::region_data::RegionData;
use byteorder::{ByteOrder, LittleEndian};
use raftshard_core::{
    Error, KeyRange, MemoryAccountant, PeerId, RaftIndex, RaftTerm, RegionId, Result,
};

/// Magic bytes: "RGSD"
pub const REGION_MAGIC: [u8; 4] = *b"RGSD";

/// Region persistence format version
pub const REGION_FORMAT_VERSION: u32 = 1;

/// Replicated metadata of one region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionMeta {
    /// Region identifier, unique within the store.
    pub id: RegionId,
    /// This store's peer within the raft group.
    pub peer_id: PeerId,
    /// Raw-key bounds owned by this region.
    pub range: KeyRange,
    /// Index of the last applied raft log entry.
    pub applied_index: RaftIndex,
    /// Term of the last applied raft log entry.
    pub applied_term: RaftTerm,
    /// Index up to which the raft log has been truncated.
    pub truncated_index: RaftIndex,
    /// Term of the last truncated entry.
    pub truncated_term: RaftTerm,
}

impl RegionMeta {
    /// Metadata for a fresh region covering `range`.
    pub fn new(id: RegionId, peer_id: PeerId, range: KeyRange) -> Self {
        Self {
            id,
            peer_id,
            range,
            applied_index: 0,
            applied_term: 0,
            truncated_index: 0,
            truncated_term: 0,
        }
    }
}

/// One region: metadata plus its MVCC data.
#[derive(Debug)]
pub struct Region {
    meta: RegionMeta,
    data: RegionData,
    /// Applied index at the time of the last compact-log flush, used by
    /// the flush gate to measure the accumulated raft-index gap.
    last_compact_log_applied: RaftIndex,
}

impl Region {
    /// Create an empty region accounted against `accountant`.
    pub fn new(meta: RegionMeta, accountant: MemoryAccountant) -> Self {
        let data = RegionData::new(meta.id, accountant);
        Self {
            meta,
            data,
            last_compact_log_applied: 0,
        }
    }

    /// Region identifier.
    pub fn id(&self) -> RegionId {
        self.meta.id
    }

    /// Replicated metadata.
    pub fn meta(&self) -> &RegionMeta {
        &self.meta
    }

    /// The MVCC data.
    pub fn data(&self) -> &RegionData {
        &self.data
    }

    /// Mutable access to the MVCC data.
    pub fn data_mut(&mut self) -> &mut RegionData {
        &mut self.data
    }

    /// Index of the last applied entry.
    pub fn applied_index(&self) -> RaftIndex {
        self.meta.applied_index
    }

    /// Term of the last applied entry.
    pub fn applied_term(&self) -> RaftTerm {
        self.meta.applied_term
    }

    /// Index of the last truncated entry.
    pub fn truncated_index(&self) -> RaftIndex {
        self.meta.truncated_index
    }

    /// Applied index recorded at the last compact-log flush.
    pub fn last_compact_log_applied(&self) -> RaftIndex {
        self.last_compact_log_applied
    }

    /// Record that a compact-log flush happened at the current applied
    /// index.
    pub fn mark_compact_log_applied(&mut self) {
        self.last_compact_log_applied = self.meta.applied_index;
    }

    /// Advance the applied index and term after applying a log entry.
    ///
    /// Fails with [`Error::OrphanKeysRemain`] when the advance crosses an
    /// orphan reconciliation deadline with keys still pending.
    pub fn advance_applied(&mut self, index: RaftIndex, term: RaftTerm) -> Result<()> {
        self.data.orphan_keys_mut().advance_applied_index(index)?;
        self.meta.applied_index = index;
        self.meta.applied_term = term;
        Ok(())
    }

    /// Advance truncated log state for a compact-log command. Stale
    /// indices (at or below the current truncated index) are ignored.
    pub fn handle_compact_log(&mut self, compact_index: RaftIndex, compact_term: RaftTerm) -> bool {
        if compact_index <= self.meta.truncated_index {
            return false;
        }
        self.meta.truncated_index = compact_index;
        self.meta.truncated_term = compact_term;
        true
    }

    /// Carve out a child region covering `range`, inheriting applied
    /// state. The parent's own range shrinks when the child takes one of
    /// its ends.
    pub fn split_out(
        &mut self,
        new_region_id: RegionId,
        peer_id: PeerId,
        range: KeyRange,
        accountant: MemoryAccountant,
    ) -> Region {
        let mut child_meta = RegionMeta::new(new_region_id, peer_id, range.clone());
        child_meta.applied_index = self.meta.applied_index;
        child_meta.applied_term = self.meta.applied_term;
        let mut child = Region::new(child_meta, accountant);
        child.last_compact_log_applied = self.meta.applied_index;
        self.data.split_into(&range, &mut child.data);
        if range.start == self.meta.range.start && !range.end.is_empty() {
            self.meta.range.start = range.end;
        } else if range.end == self.meta.range.end {
            self.meta.range.end = range.start;
        }
        child
    }

    /// Fold `source`'s data into this region and extend the owned range to
    /// cover both.
    pub fn merge_from(&mut self, source: &mut Region) {
        self.data.merge_from(&mut source.data);
        if source.meta.range.start < self.meta.range.start {
            self.meta.range.start = source.meta.range.start.clone();
        }
        let source_unbounded = source.meta.range.end.is_empty();
        let self_unbounded = self.meta.range.end.is_empty();
        if !self_unbounded && (source_unbounded || source.meta.range.end > self.meta.range.end) {
            self.meta.range.end = source.meta.range.end.clone();
        }
    }

    /// Replace this region's data with a pre-handled snapshot, adopting the
    /// snapshot's applied state.
    pub fn apply_snapshot_data(&mut self, data: RegionData, index: RaftIndex, term: RaftTerm) {
        self.data.assign(data);
        self.meta.applied_index = index;
        self.meta.applied_term = term;
        self.last_compact_log_applied = index;
    }

    /// Serialize the region (meta + data + crc footer).
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&REGION_MAGIC);
        let mut scratch = [0u8; 8];
        LittleEndian::write_u32(&mut scratch[..4], REGION_FORMAT_VERSION);
        buf.extend_from_slice(&scratch[..4]);
        for field in [
            self.meta.id,
            self.meta.peer_id,
            self.meta.applied_index,
            self.meta.applied_term,
            self.meta.truncated_index,
            self.meta.truncated_term,
        ] {
            LittleEndian::write_u64(&mut scratch, field);
            buf.extend_from_slice(&scratch);
        }
        for key in [&self.meta.range.start, &self.meta.range.end] {
            LittleEndian::write_u32(&mut scratch[..4], key.len() as u32);
            buf.extend_from_slice(&scratch[..4]);
            buf.extend_from_slice(key);
        }
        self.data.serialize(&mut buf);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf);
        LittleEndian::write_u32(&mut scratch[..4], hasher.finalize());
        buf.extend_from_slice(&scratch[..4]);
        buf
    }

    /// Reconstruct a region from its serialized form, validating magic,
    /// version, and checksum.
    pub fn deserialize(buf: &[u8], accountant: MemoryAccountant) -> Result<Self> {
        if buf.len() < 8 + 48 + 8 + 4 {
            return Err(Error::Codec("region image too short".to_string()));
        }
        let body = &buf[..buf.len() - 4];
        let stored_crc = LittleEndian::read_u32(&buf[buf.len() - 4..]);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(body);
        if hasher.finalize() != stored_crc {
            return Err(Error::Codec("region checksum mismatch".to_string()));
        }
        if body[..4] != REGION_MAGIC {
            return Err(Error::Codec("bad region magic".to_string()));
        }
        let version = LittleEndian::read_u32(&body[4..8]);
        if version > REGION_FORMAT_VERSION {
            return Err(Error::Codec(format!(
                "unsupported region format version {version}"
            )));
        }
        let mut offset = 8;
        let mut fields = [0u64; 6];
        for field in &mut fields {
            *field = LittleEndian::read_u64(&body[offset..offset + 8]);
            offset += 8;
        }
        let mut keys: [Vec<u8>; 2] = [Vec::new(), Vec::new()];
        for key in &mut keys {
            if body.len() < offset + 4 {
                return Err(Error::Codec("truncated region range key".to_string()));
            }
            let len = LittleEndian::read_u32(&body[offset..offset + 4]) as usize;
            offset += 4;
            if body.len() < offset + len {
                return Err(Error::Codec("truncated region range key".to_string()));
            }
            *key = body[offset..offset + len].to_vec();
            offset += len;
        }
        let [id, peer_id, applied_index, applied_term, truncated_index, truncated_term] = fields;
        let [start, end] = keys;
        let data = RegionData::deserialize(body, &mut offset, id, accountant)?;
        if offset != body.len() {
            return Err(Error::Codec("trailing bytes after region data".to_string()));
        }
        Ok(Self {
            meta: RegionMeta {
                id,
                peer_id,
                range: KeyRange::new(start, end),
                applied_index,
                applied_term,
                truncated_index,
                truncated_term,
            },
            data,
            last_compact_log_applied: applied_index,
        })
    }
}
