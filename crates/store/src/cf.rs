//! Typed column-family stores
//!
//! One [`CfData`] instance holds the entries of a single column family for
//! one region. The three families share their container logic through the
//! [`CfLayout`] trait, so each family's key/value codec and size function is
//! fixed at compile time — there is no runtime branching on CF kind inside
//! a store.
//!
//! Every mutation returns a signed byte-size delta computed from the
//! serialized key+value sizes, which the owning region folds into its total
//! and reports to the memory accountant. Lock-CF entries always size to
//! zero: locks are transient and excluded from the accounted footprint.

use byteorder::{ByteOrder, LittleEndian};
use raftshard_core::codec::{
    decode_bytes, decode_lock_value, decode_mvcc_key, decode_write_value, encode_bytes,
    encode_lock_value, encode_mvcc_key, encode_write_value, LockRecord, WriteRecord,
};
use raftshard_core::{Error, KeyRange, Result, Timestamp};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Duplicate-key policy for [`CfData::insert`].
///
/// Raft delivers committed entries at-least-once, so replay of an already
/// applied put must be a no-op in effect; `Overwrite` is the safe default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupPolicy {
    /// Replace an existing entry, returning the size difference.
    Overwrite,
    /// Fail with [`Error::DuplicateEntry`] if the key already exists.
    Reject,
}

/// Key of a versioned (Default or Write) CF entry.
///
/// Orders by raw key ascending, then timestamp descending, matching the
/// byte order of the encoded MVCC key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MvccKey {
    /// Decoded table/row primary key.
    pub raw_key: Vec<u8>,
    /// Start ts (Default CF) or commit ts (Write CF).
    pub ts: Timestamp,
}

impl MvccKey {
    /// Build a key from raw bytes and a timestamp.
    pub fn new(raw_key: impl Into<Vec<u8>>, ts: Timestamp) -> Self {
        Self {
            raw_key: raw_key.into(),
            ts,
        }
    }
}

impl Ord for MvccKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw_key
            .cmp(&other.raw_key)
            .then(other.ts.cmp(&self.ts))
    }
}

impl PartialOrd for MvccKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-family key/value layout: codecs and the accounted entry size.
pub trait CfLayout {
    /// Decoded key type.
    type Key: Ord + Clone;
    /// Decoded value type.
    type Value: Clone + PartialEq;

    /// Serialize a key into its wire form.
    fn encode_key(key: &Self::Key) -> Vec<u8>;
    /// Parse a key from its wire form.
    fn decode_key(bytes: &[u8]) -> Result<Self::Key>;
    /// Serialize a value into its wire form.
    fn encode_value(value: &Self::Value) -> Vec<u8>;
    /// Parse a value from its wire form.
    fn decode_value(bytes: &[u8]) -> Result<Self::Value>;
    /// Raw key used for range routing during split.
    fn raw_key(key: &Self::Key) -> &[u8];
    /// Serialized key+value size counted toward the region footprint.
    fn entry_size(key: &Self::Key, value: &Self::Value) -> u64;
}

/// Serialized length of an MVCC-encoded key for a raw key of `raw_len` bytes.
fn encoded_mvcc_key_len(raw_len: usize) -> u64 {
    ((raw_len / 8 + 1) * 9 + 8) as u64
}

/// Layout of the Default CF: (raw key, start ts) → value bytes.
#[derive(Debug, Clone)]
pub struct DefaultCfLayout;

impl CfLayout for DefaultCfLayout {
    type Key = MvccKey;
    type Value = Vec<u8>;

    fn encode_key(key: &Self::Key) -> Vec<u8> {
        encode_mvcc_key(&key.raw_key, key.ts)
    }

    fn decode_key(bytes: &[u8]) -> Result<Self::Key> {
        let (raw_key, ts) = decode_mvcc_key(bytes)?;
        Ok(MvccKey { raw_key, ts })
    }

    fn encode_value(value: &Self::Value) -> Vec<u8> {
        value.clone()
    }

    fn decode_value(bytes: &[u8]) -> Result<Self::Value> {
        Ok(bytes.to_vec())
    }

    fn raw_key(key: &Self::Key) -> &[u8] {
        &key.raw_key
    }

    fn entry_size(key: &Self::Key, value: &Self::Value) -> u64 {
        encoded_mvcc_key_len(key.raw_key.len()) + value.len() as u64
    }
}

/// Layout of the Write CF: (raw key, commit ts) → commit record.
#[derive(Debug, Clone)]
pub struct WriteCfLayout;

impl CfLayout for WriteCfLayout {
    type Key = MvccKey;
    type Value = WriteRecord;

    fn encode_key(key: &Self::Key) -> Vec<u8> {
        encode_mvcc_key(&key.raw_key, key.ts)
    }

    fn decode_key(bytes: &[u8]) -> Result<Self::Key> {
        let (raw_key, ts) = decode_mvcc_key(bytes)?;
        Ok(MvccKey { raw_key, ts })
    }

    fn encode_value(value: &Self::Value) -> Vec<u8> {
        encode_write_value(value)
    }

    fn decode_value(bytes: &[u8]) -> Result<Self::Value> {
        decode_write_value(bytes)
    }

    fn raw_key(key: &Self::Key) -> &[u8] {
        &key.raw_key
    }

    fn entry_size(key: &Self::Key, value: &Self::Value) -> u64 {
        let value_len = 9 + value.short_value.as_ref().map_or(0, |v| v.len() + 3) as u64;
        encoded_mvcc_key_len(key.raw_key.len()) + value_len
    }
}

/// Layout of the Lock CF: raw key → lock descriptor. Entry size is always
/// zero so locks never enter the region footprint.
#[derive(Debug, Clone)]
pub struct LockCfLayout;

impl CfLayout for LockCfLayout {
    type Key = Vec<u8>;
    type Value = LockRecord;

    fn encode_key(key: &Self::Key) -> Vec<u8> {
        encode_bytes(key)
    }

    fn decode_key(bytes: &[u8]) -> Result<Self::Key> {
        decode_bytes(bytes)
    }

    fn encode_value(value: &Self::Value) -> Vec<u8> {
        encode_lock_value(value)
    }

    fn decode_value(bytes: &[u8]) -> Result<Self::Value> {
        decode_lock_value(bytes)
    }

    fn raw_key(key: &Self::Key) -> &[u8] {
        key
    }

    fn entry_size(_key: &Self::Key, _value: &Self::Value) -> u64 {
        0
    }
}

/// Ordered container for one column family of one region.
#[derive(Debug, Clone)]
pub struct CfData<L: CfLayout> {
    data: BTreeMap<L::Key, L::Value>,
}

/// Default CF store.
pub type DefaultCf = CfData<DefaultCfLayout>;
/// Write CF store.
pub type WriteCf = CfData<WriteCfLayout>;
/// Lock CF store.
pub type LockCf = CfData<LockCfLayout>;

impl<L: CfLayout> Default for CfData<L> {
    fn default() -> Self {
        Self {
            data: BTreeMap::new(),
        }
    }
}

impl<L: CfLayout> PartialEq for CfData<L>
where
    L::Key: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl<L: CfLayout> CfData<L> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, returning the signed size delta.
    ///
    /// With `Overwrite`, replacing an entry yields `new_size - old_size`;
    /// with `Reject`, a duplicate key fails and nothing changes.
    pub fn insert(&mut self, key: L::Key, value: L::Value, policy: DupPolicy) -> Result<i64> {
        let new_size = L::entry_size(&key, &value) as i64;
        match self.data.entry(key) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(new_size)
            }
            std::collections::btree_map::Entry::Occupied(mut slot) => match policy {
                DupPolicy::Overwrite => {
                    let old_size = L::entry_size(slot.key(), slot.get()) as i64;
                    slot.insert(value);
                    Ok(new_size - old_size)
                }
                DupPolicy::Reject => Err(Error::DuplicateEntry),
            },
        }
    }

    /// Remove an entry, returning the bytes released. A missing key is
    /// tolerated (GC may have removed it first) and releases zero.
    pub fn remove(&mut self, key: &L::Key) -> u64 {
        match self.data.remove_entry(key) {
            Some((k, v)) => L::entry_size(&k, &v),
            None => 0,
        }
    }

    /// Look up an entry.
    pub fn get(&self, key: &L::Key) -> Option<&L::Value> {
        self.data.get(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&L::Key, &L::Value)> {
        self.data.iter()
    }

    /// Collected keys in order. Used by callers that mutate while scanning.
    pub fn keys(&self) -> Vec<L::Key> {
        self.data.keys().cloned().collect()
    }

    /// Accounted byte size of all entries.
    pub fn total_size(&self) -> u64 {
        self.data.iter().map(|(k, v)| L::entry_size(k, v)).sum()
    }

    /// Move every entry whose raw key falls in `range` into `dst`.
    /// Returns the accounted bytes moved.
    pub fn split_into(&mut self, range: &KeyRange, dst: &mut Self) -> u64 {
        let moved_keys: Vec<L::Key> = self
            .data
            .keys()
            .filter(|k| range.contains(L::raw_key(k)))
            .cloned()
            .collect();
        let mut moved = 0;
        for key in moved_keys {
            if let Some((k, v)) = self.data.remove_entry(&key) {
                moved += L::entry_size(&k, &v);
                self_insert_unchecked(&mut dst.data, k, v);
            }
        }
        moved
    }

    /// Drain all of `src` into self. Returns the accounted bytes added.
    pub fn merge_from(&mut self, src: &mut Self) -> u64 {
        let drained = std::mem::take(&mut src.data);
        let mut added = 0;
        for (k, v) in drained {
            added += L::entry_size(&k, &v);
            self_insert_unchecked(&mut self.data, k, v);
        }
        added
    }

    /// Append the serialized form of this CF to `buf`: entry count (u64 LE)
    /// then length-prefixed encoded key and value per entry.
    pub fn serialize(&self, buf: &mut Vec<u8>) -> u64 {
        let mut count = [0u8; 8];
        LittleEndian::write_u64(&mut count, self.data.len() as u64);
        buf.extend_from_slice(&count);
        let mut total = 0;
        for (key, value) in &self.data {
            let encoded_key = L::encode_key(key);
            let encoded_value = L::encode_value(value);
            let mut len = [0u8; 4];
            LittleEndian::write_u32(&mut len, encoded_key.len() as u32);
            buf.extend_from_slice(&len);
            buf.extend_from_slice(&encoded_key);
            LittleEndian::write_u32(&mut len, encoded_value.len() as u32);
            buf.extend_from_slice(&len);
            buf.extend_from_slice(&encoded_value);
            total += L::entry_size(key, value);
        }
        total
    }

    /// Parse a CF section from `buf` at `*offset`, advancing the offset.
    /// Returns the store and its accounted byte size.
    pub fn deserialize(buf: &[u8], offset: &mut usize) -> Result<(Self, u64)> {
        let count = read_u64(buf, offset)? as usize;
        let mut data = BTreeMap::new();
        let mut total = 0;
        for _ in 0..count {
            let key_bytes = read_chunk(buf, offset)?;
            let value_bytes = read_chunk(buf, offset)?;
            let key = L::decode_key(key_bytes)?;
            let value = L::decode_value(value_bytes)?;
            total += L::entry_size(&key, &value);
            data.insert(key, value);
        }
        Ok((Self { data }, total))
    }
}

// Split/merge never overlap by construction (ranges partition the key
// space), so a plain insert suffices; last write wins if they ever do.
fn self_insert_unchecked<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, value: V) {
    map.insert(key, value);
}

fn read_u64(buf: &[u8], offset: &mut usize) -> Result<u64> {
    if buf.len() < *offset + 8 {
        return Err(Error::Codec("truncated CF section: count".to_string()));
    }
    let v = LittleEndian::read_u64(&buf[*offset..*offset + 8]);
    *offset += 8;
    Ok(v)
}

fn read_chunk<'a>(buf: &'a [u8], offset: &mut usize) -> Result<&'a [u8]> {
    if buf.len() < *offset + 4 {
        return Err(Error::Codec("truncated CF section: length".to_string()));
    }
    let len = LittleEndian::read_u32(&buf[*offset..*offset + 4]) as usize;
    *offset += 4;
    if buf.len() < *offset + len {
        return Err(Error::Codec("truncated CF section: payload".to_string()));
    }
    let chunk = &buf[*offset..*offset + len];
    *offset += len;
    Ok(chunk)
}
