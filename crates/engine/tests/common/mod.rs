//! In-memory collaborator fakes shared by the integration tests.
// Each test target compiles its own copy; not every target uses every fake.
#![allow(dead_code)]

use parking_lot::Mutex;
use raftshard_core::codec::{encode_mvcc_key, encode_write_value, WriteRecord};
use raftshard_core::{CfName, Error, RegionId, Result, Timestamp, WriteKind};
use raftshard_engine::{
    ColumnarEngine, CommittedRow, KVStore, KVStoreConfig, PersistReason, ReadIndexClient,
    ReadIndexRequest, ReadIndexResponse, RegionPersister, SstEntry, SstReader, WriteCmd,
};
use raftshard_store::Region;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub struct MockPersister {
    pub calls: Mutex<Vec<(RegionId, PersistReason)>>,
}

impl RegionPersister for MockPersister {
    fn persist(&self, region: &Region, reason: PersistReason) -> Result<()> {
        self.calls.lock().push((region.id(), reason));
        Ok(())
    }
}

impl MockPersister {
    pub fn reasons_for(&self, region_id: RegionId) -> Vec<PersistReason> {
        self.calls
            .lock()
            .iter()
            .filter(|(id, _)| *id == region_id)
            .map(|(_, reason)| *reason)
            .collect()
    }
}

#[derive(Default)]
pub struct MockColumnar {
    pub rows: Mutex<FxHashMap<RegionId, Vec<CommittedRow>>>,
    pub removed: Mutex<Vec<RegionId>>,
    pub fail_writes: AtomicBool,
}

impl ColumnarEngine for MockColumnar {
    fn write_rows(&self, region_id: RegionId, rows: Vec<CommittedRow>) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(Error::Engine("injected write failure".to_string()));
        }
        self.rows.lock().entry(region_id).or_default().extend(rows);
        Ok(())
    }

    fn remove_region(&self, region_id: RegionId) -> Result<()> {
        self.removed.lock().push(region_id);
        self.rows.lock().remove(&region_id);
        Ok(())
    }
}

impl MockColumnar {
    pub fn rows_for(&self, region_id: RegionId) -> Vec<CommittedRow> {
        self.rows.lock().get(&region_id).cloned().unwrap_or_default()
    }
}

pub struct MockReadIndexClient;

impl ReadIndexClient for MockReadIndexClient {
    fn read_index(&self, req: &ReadIndexRequest) -> Result<ReadIndexResponse> {
        Ok(ReadIndexResponse::ready(req.region_id * 10))
    }
}

pub struct Fixture {
    pub store: KVStore,
    pub persister: Arc<MockPersister>,
    pub columnar: Arc<MockColumnar>,
}

pub fn fixture_with_config(config: KVStoreConfig) -> Fixture {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let persister = Arc::new(MockPersister::default());
    let columnar = Arc::new(MockColumnar::default());
    let store = KVStore::new(
        config,
        persister.clone(),
        columnar.clone(),
        Arc::new(MockReadIndexClient),
    );
    Fixture {
        store,
        persister,
        columnar,
    }
}

pub fn fixture() -> Fixture {
    fixture_with_config(KVStoreConfig::default())
}

/// The write batch of one committed transaction: default value plus its
/// commit record.
pub fn commit_cmds(
    raw: &[u8],
    commit_ts: Timestamp,
    start_ts: Timestamp,
    value: &[u8],
) -> Vec<WriteCmd> {
    vec![
        WriteCmd::put(CfName::Default, encode_mvcc_key(raw, start_ts), value),
        WriteCmd::put(
            CfName::Write,
            encode_mvcc_key(raw, commit_ts),
            encode_write_value(&WriteRecord {
                kind: WriteKind::Put,
                start_ts,
                short_value: None,
            }),
        ),
    ]
}

pub struct MockSstReader {
    cf: CfName,
    entries: VecDeque<SstEntry>,
}

impl MockSstReader {
    pub fn new(cf: CfName, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        Self {
            cf,
            entries: entries
                .into_iter()
                .map(|(key, value)| SstEntry { key, value })
                .collect(),
        }
    }
}

impl SstReader for MockSstReader {
    fn cf(&self) -> CfName {
        self.cf
    }

    fn next_entry(&mut self) -> Result<Option<SstEntry>> {
        Ok(self.entries.pop_front())
    }
}
