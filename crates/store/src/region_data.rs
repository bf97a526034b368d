//! Multi-column-family MVCC container for one region
//!
//! `RegionData` composes the three CF stores, the orphan-key tracker, and a
//! running total byte size. The total always equals the sum of serialized
//! key+value sizes across Default and Write entries currently stored; Lock
//! entries are transient and excluded. Every Default/Write mutation reports
//! exactly one signed delta to the injected [`MemoryAccountant`], and
//! ownership transfers (snapshot swap, split, merge) reconcile instead of
//! re-reporting, so the process-wide aggregate never double-counts.

use crate::cf::{DefaultCf, DupPolicy, LockCf, MvccKey, WriteCf};
use crate::orphan::OrphanKeysInfo;
use raftshard_core::codec::{decode_bytes, decode_lock_value, decode_mvcc_key, decode_write_value};
use raftshard_core::{
    CfName, Error, KeyRange, LockRecord, MemoryAccountant, RaftIndex, RegionId, Result, Timestamp,
    WriteKind,
};
use std::collections::HashSet;

/// A Write-CF record resolved to its readable form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionDataReadInfo {
    /// Decoded raw key.
    pub raw_key: Vec<u8>,
    /// Kind of the commit record.
    pub kind: WriteKind,
    /// Commit timestamp.
    pub commit_ts: Timestamp,
    /// Resolved value, when requested and applicable.
    pub value: Option<Vec<u8>>,
}

/// Query parameters for [`RegionData::get_lock_info`].
#[derive(Debug, Clone, Default)]
pub struct LockQuery {
    /// Read timestamp of the querying transaction.
    pub read_ts: Timestamp,
    /// Lock versions the caller may ignore (already resolved).
    pub bypass_lock_versions: Option<HashSet<Timestamp>>,
}

/// Per-region MVCC data: three CF stores, orphan tracking, size accounting.
#[derive(Debug)]
pub struct RegionData {
    default_cf: DefaultCf,
    write_cf: WriteCf,
    lock_cf: LockCf,
    orphan_keys: OrphanKeysInfo,
    data_size: u64,
    accountant: MemoryAccountant,
}

impl RegionData {
    /// Create empty region data accounted against `accountant`.
    pub fn new(region_id: RegionId, accountant: MemoryAccountant) -> Self {
        Self {
            default_cf: DefaultCf::new(),
            write_cf: WriteCf::new(),
            lock_cf: LockCf::new(),
            orphan_keys: OrphanKeysInfo::new(region_id),
            data_size: 0,
            accountant,
        }
    }

    fn report_delta(&self, delta: i64) {
        if delta >= 0 {
            self.accountant.allocate(delta as u64);
        } else {
            self.accountant.free((-delta) as u64);
        }
    }

    fn apply_size_delta(&mut self, delta: i64) {
        self.data_size = (self.data_size as i64 + delta) as u64;
        self.report_delta(delta);
    }

    /// Insert an encoded key/value pair into `cf`.
    ///
    /// Default/Write deltas are added to the total size and reported to the
    /// accountant. Lock entries never enter the accounted footprint and the
    /// returned delta is zero. A Write-CF insert outside pre-handling also
    /// reconciles a pending orphan for the same key, since normal log
    /// replay is how orphan write keys get their value half.
    pub fn insert(
        &mut self,
        cf: CfName,
        key: &[u8],
        value: &[u8],
        policy: DupPolicy,
    ) -> Result<i64> {
        match cf {
            CfName::Default => {
                let (raw_key, ts) = decode_mvcc_key(key)?;
                let delta =
                    self.default_cf
                        .insert(MvccKey { raw_key, ts }, value.to_vec(), policy)?;
                self.apply_size_delta(delta);
                Ok(delta)
            }
            CfName::Write => {
                let (raw_key, ts) = decode_mvcc_key(key)?;
                let record = decode_write_value(value)?;
                let delta = self.write_cf.insert(MvccKey { raw_key, ts }, record, policy)?;
                self.apply_size_delta(delta);
                if !self.orphan_keys.pre_handling {
                    self.orphan_keys.observe_key_from_normal_write(key);
                }
                Ok(delta)
            }
            CfName::Lock => {
                let raw_key = decode_bytes(key)?;
                let record = decode_lock_value(value)?;
                self.lock_cf.insert(raw_key, record, policy)?;
                Ok(0)
            }
        }
    }

    /// Remove the entry at `key` from `cf`. Best-effort: the entry may
    /// already have been removed by GC.
    pub fn remove(&mut self, cf: CfName, key: &[u8]) -> Result<()> {
        match cf {
            CfName::Default => {
                let (raw_key, ts) = decode_mvcc_key(key)?;
                let released = self.default_cf.remove(&MvccKey { raw_key, ts });
                self.apply_size_delta(-(released as i64));
            }
            CfName::Write => {
                let (raw_key, ts) = decode_mvcc_key(key)?;
                let released = self.write_cf.remove(&MvccKey { raw_key, ts });
                self.apply_size_delta(-(released as i64));
            }
            CfName::Lock => {
                let raw_key = decode_bytes(key)?;
                self.lock_cf.remove(&raw_key);
            }
        }
        Ok(())
    }

    /// Cascading removal of a committed row.
    ///
    /// Explicit two-step transaction: if the write record is a Put without
    /// an inlined value, erase its Default-CF counterpart at
    /// (raw key, start ts) first, then erase the write record itself. The
    /// combined delta is computed and reported once. Returns the bytes
    /// released.
    pub fn remove_by_write_key(&mut self, write_key: &MvccKey) -> u64 {
        let mut released = 0u64;
        if let Some(record) = self.write_cf.get(write_key) {
            if record.kind == WriteKind::Put && record.short_value.is_none() {
                let default_key = MvccKey {
                    raw_key: write_key.raw_key.clone(),
                    ts: record.start_ts,
                };
                released += self.default_cf.remove(&default_key);
            }
        }
        released += self.write_cf.remove(write_key);
        self.apply_size_delta(-(released as i64));
        released
    }

    /// Resolve a Write-CF record to `(raw key, kind, commit ts, value)`.
    ///
    /// `Ok(None)` means "no value yet": the record is a tolerated orphan
    /// whose Default-CF half is expected from a not-yet-processed part of
    /// the same snapshot, or from a prewrite replay that has not reached
    /// this peer. With `hard_error` or without an applicable snapshot
    /// context, an unresolvable Put fails with
    /// [`Error::IllformedRow`].
    pub fn read_by_write_key(
        &mut self,
        write_key: &MvccKey,
        need_value: bool,
        region_id: RegionId,
        applied_index: RaftIndex,
        hard_error: bool,
    ) -> Result<Option<RegionDataReadInfo>> {
        let record = match self.write_cf.get(write_key) {
            Some(record) => record.clone(),
            None => return Ok(None),
        };
        if write_key.raw_key.is_empty() {
            return Err(Error::IllformedRow {
                region_id,
                applied_index,
                raw_key: Vec::new(),
                start_ts: record.start_ts,
            });
        }
        let info = |value: Option<Vec<u8>>| RegionDataReadInfo {
            raw_key: write_key.raw_key.clone(),
            kind: record.kind,
            commit_ts: write_key.ts,
            value,
        };
        if !need_value || record.kind != WriteKind::Put {
            return Ok(Some(info(None)));
        }
        if let Some(short) = &record.short_value {
            return Ok(Some(info(Some(short.clone()))));
        }
        let default_key = MvccKey {
            raw_key: write_key.raw_key.clone(),
            ts: record.start_ts,
        };
        if let Some(value) = self.default_cf.get(&default_key) {
            return Ok(Some(info(Some(value.clone()))));
        }
        if !hard_error {
            if self.orphan_keys.pre_handling {
                debug_assert!(
                    self.orphan_keys.snapshot_index.is_some(),
                    "snapshot index must be set while pre-handling"
                );
                // Accepted orphan: the default half is expected from a
                // later part of the same snapshot, resolved by raft log
                // replay before the deadline.
                let encoded = raftshard_core::codec::encode_mvcc_key(&write_key.raw_key, write_key.ts);
                self.orphan_keys.observe_extra_key(encoded);
                return Ok(None);
            }
            if self.orphan_keys.snapshot_index.is_some() {
                // Known pending orphan, or a PUT replayed before its
                // prewrite. Either way the value may still arrive.
                return Ok(None);
            }
        }
        Err(Error::IllformedRow {
            region_id,
            applied_index,
            raw_key: write_key.raw_key.clone(),
            start_ts: record.start_ts,
        })
    }

    /// Scan the Lock CF for a blocking lock.
    ///
    /// A lock qualifies when its version is at or below the read ts, its
    /// kind can block a read, its min-commit-ts is at or below the read ts,
    /// and its version is not bypassed. The whole shard is scanned with no
    /// filter by row key; the first qualifying lock wins.
    pub fn get_lock_info(&self, query: &LockQuery) -> Option<LockRecord> {
        for (_raw_key, lock) in self.lock_cf.iter() {
            if lock.lock_version > query.read_ts || !lock.kind.blocks_read() {
                continue;
            }
            if lock.min_commit_ts > query.read_ts {
                continue;
            }
            if let Some(bypass) = &query.bypass_lock_versions {
                if bypass.contains(&lock.lock_version) {
                    continue;
                }
            }
            return Some(lock.clone());
        }
        None
    }

    /// Move all entries within `range` (and the matching orphans) into
    /// `dst`, adjusting both total-size counters by the same aggregate.
    pub fn split_into(&mut self, range: &KeyRange, dst: &mut RegionData) {
        let mut moved = 0;
        moved += self.default_cf.split_into(range, &mut dst.default_cf);
        moved += self.write_cf.split_into(range, &mut dst.write_cf);
        moved += self.lock_cf.split_into(range, &mut dst.lock_cf);
        self.orphan_keys.split_into(range, &mut dst.orphan_keys);
        self.data_size -= moved;
        dst.data_size += moved;
        // Ownership moved between regions; the process-wide footprint is
        // unchanged, so nothing is reported here.
    }

    /// Fold all of `src`'s entries and size into self.
    pub fn merge_from(&mut self, src: &mut RegionData) {
        let mut added = 0;
        added += self.default_cf.merge_from(&mut src.default_cf);
        added += self.write_cf.merge_from(&mut src.write_cf);
        added += self.lock_cf.merge_from(&mut src.lock_cf);
        self.orphan_keys.merge_from(&mut src.orphan_keys);
        self.data_size += added;
        src.data_size -= added;
    }

    /// Replace this region's contents with `new` (a pre-handled snapshot),
    /// reporting a single signed reconcile for the swap.
    ///
    /// `new`'s own footprint stays reported until it drops, mirroring the
    /// transfer: prev + new → (reconcile) → new + new → (drop) → new.
    pub fn assign(&mut self, mut new: RegionData) {
        self.accountant.reconcile(self.data_size, new.data_size);
        self.default_cf = std::mem::take(&mut new.default_cf);
        self.write_cf = std::mem::take(&mut new.write_cf);
        self.lock_cf = std::mem::take(&mut new.lock_cf);
        self.orphan_keys = std::mem::take(&mut new.orphan_keys);
        self.data_size = new.data_size;
    }

    /// Serialize in fixed CF order: Default, then Write, then Lock.
    pub fn serialize(&self, buf: &mut Vec<u8>) -> u64 {
        let mut total = 0;
        total += self.default_cf.serialize(buf);
        total += self.write_cf.serialize(buf);
        total += self.lock_cf.serialize(buf);
        total
    }

    /// Reconstruct region data from `buf` at `*offset`, recomputing the
    /// total size and reporting it as newly allocated.
    pub fn deserialize(
        buf: &[u8],
        offset: &mut usize,
        region_id: RegionId,
        accountant: MemoryAccountant,
    ) -> Result<Self> {
        let (default_cf, d_size) = DefaultCf::deserialize(buf, offset)?;
        let (write_cf, w_size) = WriteCf::deserialize(buf, offset)?;
        let (lock_cf, _) = LockCf::deserialize(buf, offset)?;
        let data_size = d_size + w_size;
        accountant.allocate(data_size);
        Ok(Self {
            default_cf,
            write_cf,
            lock_cf,
            orphan_keys: OrphanKeysInfo::new(region_id),
            data_size,
            accountant,
        })
    }

    /// Current accounted byte size (Default + Write entries).
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Number of Write-CF records, i.e. committed rows awaiting flush.
    pub fn committed_row_count(&self) -> usize {
        self.write_cf.len()
    }

    /// Write-CF keys in order, for scan-then-mutate flush loops.
    pub fn write_cf_keys(&self) -> Vec<MvccKey> {
        self.write_cf.keys()
    }

    /// The orphan-key tracker.
    pub fn orphan_keys(&self) -> &OrphanKeysInfo {
        &self.orphan_keys
    }

    /// Mutable access to the orphan-key tracker.
    pub fn orphan_keys_mut(&mut self) -> &mut OrphanKeysInfo {
        &mut self.orphan_keys
    }

    /// The Default CF store.
    pub fn default_cf(&self) -> &DefaultCf {
        &self.default_cf
    }

    /// The Write CF store.
    pub fn write_cf(&self) -> &WriteCf {
        &self.write_cf
    }

    /// The Lock CF store.
    pub fn lock_cf(&self) -> &LockCf {
        &self.lock_cf
    }
}

impl Drop for RegionData {
    fn drop(&mut self) {
        self.accountant.free(self.data_size);
    }
}

impl PartialEq for RegionData {
    fn eq(&self, other: &Self) -> bool {
        self.default_cf == other.default_cf
            && self.write_cf == other.write_cf
            && self.lock_cf == other.lock_cf
            && self.data_size == other.data_size
    }
}
