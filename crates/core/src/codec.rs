//! TiKV-style MVCC key and value codecs
//!
//! # Key layout
//!
//! Raw keys are memcomparable-encoded in 8-byte groups. Each group is padded
//! with zeros to 8 bytes and followed by a marker byte `0xF7 - pad_count`,
//! so byte-wise comparison of encoded keys matches lexicographic comparison
//! of raw keys:
//!
//! ```text
//! raw:     [k0 k1 k2 k3 k4 k5 k6 k7] [k8 k9]
//! encoded: [k0..k7] F7  [k8 k9 0 0 0 0 0 0] F1
//! ```
//!
//! MVCC keys append a descending timestamp: `!ts` as a big-endian u64, so a
//! larger (newer) timestamp sorts first among versions of the same raw key.
//!
//! # Value layouts
//!
//! Write-CF: `kind_flag(1) | start_ts u64 BE | [ 'v' | len u16 BE | bytes ]`.
//! Lock-CF:  `kind_flag(1) | lock_version u64 BE | min_commit_ts u64 BE |
//!            primary_len u32 BE | primary | ttl_ms u64 BE`.

use crate::error::{Error, Result};
use crate::types::{LockKind, Timestamp, WriteKind};
use byteorder::{BigEndian, ByteOrder};

const ENC_GROUP_SIZE: usize = 8;
const ENC_MARKER: u8 = 0xF7;
const SHORT_VALUE_MARKER: u8 = b'v';

/// Memcomparable-encode a raw key (no timestamp suffix).
pub fn encode_bytes(raw: &[u8]) -> Vec<u8> {
    let groups = raw.len() / ENC_GROUP_SIZE + 1;
    let mut out = Vec::with_capacity(groups * (ENC_GROUP_SIZE + 1));
    for chunk in 0..groups {
        let start = chunk * ENC_GROUP_SIZE;
        let end = (start + ENC_GROUP_SIZE).min(raw.len());
        let pad = ENC_GROUP_SIZE - (end - start);
        out.extend_from_slice(&raw[start..end]);
        out.extend(std::iter::repeat(0u8).take(pad));
        out.push(ENC_MARKER - pad as u8);
    }
    out
}

/// Decode a memcomparable-encoded key back into raw bytes.
///
/// Rejects truncated input and malformed padding.
pub fn decode_bytes(encoded: &[u8]) -> Result<Vec<u8>> {
    let mut raw = Vec::with_capacity(encoded.len());
    let mut offset = 0;
    loop {
        let group_end = offset + ENC_GROUP_SIZE + 1;
        if encoded.len() < group_end {
            return Err(Error::Codec(format!(
                "truncated memcomparable key: {} bytes, expected at least {}",
                encoded.len(),
                group_end
            )));
        }
        let marker = encoded[group_end - 1];
        if marker > ENC_MARKER {
            return Err(Error::Codec(format!("invalid pad marker {marker:#04x}")));
        }
        let pad = (ENC_MARKER - marker) as usize;
        if pad > ENC_GROUP_SIZE {
            return Err(Error::Codec(format!("invalid pad marker {marker:#04x}")));
        }
        let data = &encoded[offset..group_end - 1];
        raw.extend_from_slice(&data[..ENC_GROUP_SIZE - pad]);
        if pad > 0 {
            if data[ENC_GROUP_SIZE - pad..].iter().any(|b| *b != 0) {
                return Err(Error::Codec("non-zero padding in key group".to_string()));
            }
            if encoded.len() != group_end {
                return Err(Error::Codec(format!(
                    "{} trailing bytes after final key group",
                    encoded.len() - group_end
                )));
            }
            return Ok(raw);
        }
        offset = group_end;
    }
}

/// Encode an MVCC key: memcomparable raw key plus descending timestamp.
pub fn encode_mvcc_key(raw: &[u8], ts: Timestamp) -> Vec<u8> {
    let mut out = encode_bytes(raw);
    let mut suffix = [0u8; 8];
    BigEndian::write_u64(&mut suffix, !ts);
    out.extend_from_slice(&suffix);
    out
}

/// Decode an MVCC key into (raw key, timestamp).
pub fn decode_mvcc_key(encoded: &[u8]) -> Result<(Vec<u8>, Timestamp)> {
    if encoded.len() < 8 + ENC_GROUP_SIZE + 1 {
        return Err(Error::Codec(format!(
            "MVCC key too short: {} bytes",
            encoded.len()
        )));
    }
    let (key_part, ts_part) = encoded.split_at(encoded.len() - 8);
    let raw = decode_bytes(key_part)?;
    let ts = !BigEndian::read_u64(ts_part);
    Ok((raw, ts))
}

/// A decoded Write-CF record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    /// Kind of the commit record.
    pub kind: WriteKind,
    /// Start timestamp of the transaction that produced this record.
    pub start_ts: Timestamp,
    /// Inlined value for short puts. `None` means the value (if any) lives
    /// in the Default CF at (raw key, start_ts).
    pub short_value: Option<Vec<u8>>,
}

/// Serialize a Write-CF record.
pub fn encode_write_value(record: &WriteRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + record.short_value.as_ref().map_or(0, |v| v.len() + 3));
    out.push(record.kind.flag());
    let mut ts = [0u8; 8];
    BigEndian::write_u64(&mut ts, record.start_ts);
    out.extend_from_slice(&ts);
    if let Some(short) = &record.short_value {
        out.push(SHORT_VALUE_MARKER);
        let mut len = [0u8; 2];
        BigEndian::write_u16(&mut len, short.len() as u16);
        out.extend_from_slice(&len);
        out.extend_from_slice(short);
    }
    out
}

/// Deserialize a Write-CF record.
pub fn decode_write_value(value: &[u8]) -> Result<WriteRecord> {
    if value.len() < 9 {
        return Err(Error::Codec(format!(
            "write value too short: {} bytes",
            value.len()
        )));
    }
    let kind = WriteKind::from_flag(value[0])
        .ok_or_else(|| Error::Codec(format!("unknown write kind flag {:#04x}", value[0])))?;
    let start_ts = BigEndian::read_u64(&value[1..9]);
    let rest = &value[9..];
    let short_value = if rest.is_empty() {
        None
    } else {
        if rest[0] != SHORT_VALUE_MARKER || rest.len() < 3 {
            return Err(Error::Codec("malformed short value section".to_string()));
        }
        let len = BigEndian::read_u16(&rest[1..3]) as usize;
        if rest.len() != 3 + len {
            return Err(Error::Codec(format!(
                "short value length mismatch: declared {}, got {}",
                len,
                rest.len() - 3
            )));
        }
        Some(rest[3..].to_vec())
    };
    Ok(WriteRecord {
        kind,
        start_ts,
        short_value,
    })
}

/// A decoded Lock-CF descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    /// Kind of the lock.
    pub kind: LockKind,
    /// Start timestamp of the locking transaction.
    pub lock_version: Timestamp,
    /// Reads at or below this point may need to wait on the lock.
    pub min_commit_ts: Timestamp,
    /// Primary key of the locking transaction.
    pub primary: Vec<u8>,
    /// Lock time-to-live in milliseconds.
    pub ttl_ms: u64,
}

/// Serialize a Lock-CF descriptor.
pub fn encode_lock_value(record: &LockRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(29 + record.primary.len());
    out.push(record.kind.flag());
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, record.lock_version);
    out.extend_from_slice(&buf);
    BigEndian::write_u64(&mut buf, record.min_commit_ts);
    out.extend_from_slice(&buf);
    let mut len = [0u8; 4];
    BigEndian::write_u32(&mut len, record.primary.len() as u32);
    out.extend_from_slice(&len);
    out.extend_from_slice(&record.primary);
    BigEndian::write_u64(&mut buf, record.ttl_ms);
    out.extend_from_slice(&buf);
    out
}

/// Deserialize a Lock-CF descriptor.
pub fn decode_lock_value(value: &[u8]) -> Result<LockRecord> {
    if value.len() < 29 {
        return Err(Error::Codec(format!(
            "lock value too short: {} bytes",
            value.len()
        )));
    }
    let kind = LockKind::from_flag(value[0])
        .ok_or_else(|| Error::Codec(format!("unknown lock kind flag {:#04x}", value[0])))?;
    let lock_version = BigEndian::read_u64(&value[1..9]);
    let min_commit_ts = BigEndian::read_u64(&value[9..17]);
    let primary_len = BigEndian::read_u32(&value[17..21]) as usize;
    if value.len() != 29 + primary_len {
        return Err(Error::Codec(format!(
            "lock value length mismatch: declared primary {}, total {}",
            primary_len,
            value.len()
        )));
    }
    let primary = value[21..21 + primary_len].to_vec();
    let ttl_ms = BigEndian::read_u64(&value[21 + primary_len..]);
    Ok(LockRecord {
        kind,
        lock_version,
        min_commit_ts,
        primary,
        ttl_ms,
    })
}
