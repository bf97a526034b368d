//! End-to-end apply/flush/admin scenarios against in-memory collaborators.

mod common;

use common::{commit_cmds, fixture, fixture_with_config};
use raftshard_core::{Error, KeyRange, WriteKind};
use raftshard_engine::{
    AdminCmd, ApplyRes, KVStoreConfig, PersistReason, RaftLogGcTaskRes, ReadIndexRequest,
    SplitRequest,
};
use raftshard_store::RegionMeta;
use std::time::Duration;

fn whole_range() -> KeyRange {
    KeyRange::new(Vec::new(), Vec::new())
}

#[test]
fn test_write_then_flush_reaches_columnar_engine() {
    let fx = fixture();
    fx.store
        .insert_region(RegionMeta::new(1, 11, whole_range()))
        .unwrap();
    let res = fx
        .store
        .handle_write_raft_cmd(commit_cmds(b"rowA", 10, 5, b"value1"), 1, 6, 1)
        .unwrap();
    assert_eq!(res, ApplyRes::None);

    assert!(fx.store.try_flush_region_data(1, true, true).unwrap());
    let rows = fx.columnar.rows_for(1);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].raw_key, b"rowA");
    assert_eq!(rows[0].kind, WriteKind::Put);
    assert_eq!(rows[0].commit_ts, 10);
    assert_eq!(rows[0].value.as_deref(), Some(&b"value1"[..]));

    // flushed rows left the region entirely
    let region = fx.store.get_region(1).unwrap();
    assert_eq!(region.lock().data().data_size(), 0);
    assert_eq!(fx.store.accountant().in_use(), 0);
    assert!(fx.persister.reasons_for(1).contains(&PersistReason::Flush));
}

#[test]
fn test_redelivered_write_is_noop() {
    let fx = fixture();
    fx.store
        .insert_region(RegionMeta::new(1, 11, whole_range()))
        .unwrap();
    fx.store
        .handle_write_raft_cmd(commit_cmds(b"rowA", 10, 5, b"value1"), 1, 6, 1)
        .unwrap();
    let size_after_first = fx.store.accountant().in_use();

    // raft redelivers the same entry
    let res = fx
        .store
        .handle_write_raft_cmd(commit_cmds(b"rowA", 10, 5, b"value1"), 1, 6, 1)
        .unwrap();
    assert_eq!(res, ApplyRes::None);
    assert_eq!(fx.store.accountant().in_use(), size_after_first);
    let region = fx.store.get_region(1).unwrap();
    assert_eq!(region.lock().applied_index(), 6);
}

#[test]
fn test_write_for_unknown_region() {
    let fx = fixture();
    let res = fx
        .store
        .handle_write_raft_cmd(commit_cmds(b"rowA", 10, 5, b"v"), 99, 1, 1)
        .unwrap();
    assert_eq!(res, ApplyRes::NotFound);
}

#[test]
fn test_flush_threshold_on_rows() {
    let fx = fixture_with_config(KVStoreConfig {
        compact_log_min_rows: 2,
        compact_log_min_bytes: u64::MAX,
        compact_log_gap: 0,
        ..KVStoreConfig::default()
    });
    fx.store
        .insert_region(RegionMeta::new(1, 11, whole_range()))
        .unwrap();
    let res = fx
        .store
        .handle_write_raft_cmd(commit_cmds(b"a", 10, 5, b"v"), 1, 6, 1)
        .unwrap();
    assert_eq!(res, ApplyRes::None);
    // below threshold, a non-forced flush declines
    assert!(!fx.store.try_flush_region_data(1, false, true).unwrap());

    let res = fx
        .store
        .handle_write_raft_cmd(commit_cmds(b"b", 12, 11, b"v"), 1, 7, 1)
        .unwrap();
    assert_eq!(res, ApplyRes::Persist);
    assert!(fx.store.try_flush_region_data(1, false, true).unwrap());
    assert_eq!(fx.columnar.rows_for(1).len(), 2);
}

#[test]
fn test_flush_threshold_on_index_gap() {
    let fx = fixture_with_config(KVStoreConfig {
        compact_log_min_rows: u64::MAX,
        compact_log_min_bytes: u64::MAX,
        compact_log_gap: 3,
        ..KVStoreConfig::default()
    });
    fx.store
        .insert_region(RegionMeta::new(1, 11, whole_range()))
        .unwrap();
    for (i, raw) in [b"a", b"b", b"c"].iter().enumerate() {
        let index = i as u64 + 1;
        let ts = 10 + 2 * index;
        fx.store
            .handle_write_raft_cmd(commit_cmds(*raw, ts, ts - 1, b"v"), 1, index, 1)
            .unwrap();
    }
    // applied 3, last flush at 0 → gap reached
    assert!(fx.store.try_flush_region_data(1, false, true).unwrap());
    // gap reset by the flush
    assert!(!fx.store.try_flush_region_data(1, false, true).unwrap());
}

#[test]
fn test_failed_columnar_write_keeps_rows() {
    let fx = fixture();
    fx.store
        .insert_region(RegionMeta::new(1, 11, whole_range()))
        .unwrap();
    fx.store
        .handle_write_raft_cmd(commit_cmds(b"rowA", 10, 5, b"v"), 1, 6, 1)
        .unwrap();
    fx.columnar
        .fail_writes
        .store(true, std::sync::atomic::Ordering::Relaxed);

    // non-strict mode tolerates the failure and keeps the rows
    assert!(!fx.store.try_flush_region_data(1, true, false).unwrap());
    let region = fx.store.get_region(1).unwrap();
    assert_eq!(region.lock().data().committed_row_count(), 1);

    // strict mode surfaces it
    assert!(matches!(
        fx.store.try_flush_region_data(1, true, true),
        Err(Error::Flush(_))
    ));

    fx.columnar
        .fail_writes
        .store(false, std::sync::atomic::Ordering::Relaxed);
    assert!(fx.store.try_flush_region_data(1, true, true).unwrap());
    assert_eq!(fx.columnar.rows_for(1).len(), 1);
}

#[test]
fn test_compact_log_advances_truncated_state() {
    let fx = fixture();
    fx.store
        .insert_region(RegionMeta::new(1, 11, whole_range()))
        .unwrap();
    fx.store
        .handle_write_raft_cmd(commit_cmds(b"a", 10, 5, b"v"), 1, 6, 1)
        .unwrap();
    let res = fx
        .store
        .handle_admin_raft_cmd(
            AdminCmd::CompactLog {
                compact_index: 5,
                compact_term: 1,
            },
            1,
            7,
            1,
        )
        .unwrap();
    assert_eq!(res, ApplyRes::Persist);
    let region = fx.store.get_region(1).unwrap();
    assert_eq!(region.lock().truncated_index(), 5);

    // a replayed compact-log below the truncated index is useless but
    // still persists apply state
    let res = fx
        .store
        .handle_admin_raft_cmd(
            AdminCmd::CompactLog {
                compact_index: 3,
                compact_term: 1,
            },
            1,
            8,
            1,
        )
        .unwrap();
    assert_eq!(res, ApplyRes::Persist);
    assert!(fx
        .persister
        .reasons_for(1)
        .contains(&PersistReason::UselessAdminCommand));
    assert_eq!(fx.store.get_region(1).unwrap().lock().truncated_index(), 5);
}

#[test]
fn test_split_moves_data_and_registers_child() {
    let fx = fixture();
    fx.store
        .insert_region(RegionMeta::new(1, 11, whole_range()))
        .unwrap();
    fx.store
        .handle_write_raft_cmd(commit_cmds(b"apple", 10, 5, b"v1"), 1, 6, 1)
        .unwrap();
    fx.store
        .handle_write_raft_cmd(commit_cmds(b"melon", 12, 11, b"v2"), 1, 7, 1)
        .unwrap();
    let total = fx.store.accountant().in_use();

    let res = fx
        .store
        .handle_admin_raft_cmd(
            AdminCmd::Split {
                splits: vec![SplitRequest {
                    new_region_id: 2,
                    new_peer_id: 22,
                    start: b"m".to_vec(),
                    end: Vec::new(),
                }],
            },
            1,
            8,
            1,
        )
        .unwrap();
    assert_eq!(res, ApplyRes::Persist);

    let parent = fx.store.get_region(1).unwrap();
    let child = fx.store.get_region(2).unwrap();
    assert_eq!(parent.lock().data().committed_row_count(), 1);
    assert_eq!(child.lock().data().committed_row_count(), 1);
    assert_eq!(child.lock().applied_index(), 8);
    assert_eq!(
        child.lock().meta().range,
        KeyRange::new(b"m".to_vec(), Vec::new())
    );
    assert_eq!(
        parent.lock().meta().range,
        KeyRange::new(Vec::new(), b"m".to_vec())
    );
    // ownership moved, nothing allocated or freed
    assert_eq!(fx.store.accountant().in_use(), total);
    assert!(fx
        .persister
        .reasons_for(2)
        .contains(&PersistReason::AdminCommand));
}

#[test]
fn test_split_rejects_duplicate_child_id() {
    let fx = fixture();
    fx.store
        .insert_region(RegionMeta::new(1, 11, whole_range()))
        .unwrap();
    let err = fx
        .store
        .handle_admin_raft_cmd(
            AdminCmd::Split {
                splits: vec![SplitRequest {
                    new_region_id: 1,
                    new_peer_id: 22,
                    start: b"m".to_vec(),
                    end: Vec::new(),
                }],
            },
            1,
            6,
            1,
        )
        .unwrap_err();
    assert!(matches!(err, Error::InconsistentAdminCommand(_)));
}

#[test]
fn test_split_rejects_interior_range() {
    let fx = fixture();
    fx.store
        .insert_region(RegionMeta::new(1, 11, whole_range()))
        .unwrap();
    let err = fx
        .store
        .handle_admin_raft_cmd(
            AdminCmd::Split {
                splits: vec![SplitRequest {
                    new_region_id: 2,
                    new_peer_id: 22,
                    start: b"c".to_vec(),
                    end: b"m".to_vec(),
                }],
            },
            1,
            6,
            1,
        )
        .unwrap_err();
    assert!(matches!(err, Error::InconsistentAdminCommand(_)));
    // rejected before the applied index moved, and no child registered
    assert_eq!(fx.store.get_region(1).unwrap().lock().applied_index(), 0);
    assert!(fx.store.get_region(2).is_none());
}

#[test]
fn test_split_rejects_illformed_range() {
    let fx = fixture();
    fx.store
        .insert_region(RegionMeta::new(1, 11, whole_range()))
        .unwrap();
    let err = fx
        .store
        .handle_admin_raft_cmd(
            AdminCmd::Split {
                splits: vec![SplitRequest {
                    new_region_id: 2,
                    new_peer_id: 22,
                    start: b"z".to_vec(),
                    end: b"a".to_vec(),
                }],
            },
            1,
            6,
            1,
        )
        .unwrap_err();
    assert!(matches!(err, Error::InconsistentAdminCommand(_)));
}

#[test]
fn test_commit_merge_folds_source_into_target() {
    let fx = fixture();
    fx.store
        .insert_region(RegionMeta::new(1, 11, KeyRange::new(Vec::new(), b"m".to_vec())))
        .unwrap();
    fx.store
        .insert_region(RegionMeta::new(2, 22, KeyRange::new(b"m".to_vec(), Vec::new())))
        .unwrap();
    fx.store
        .handle_write_raft_cmd(commit_cmds(b"apple", 10, 5, b"v1"), 1, 6, 1)
        .unwrap();
    fx.store
        .handle_write_raft_cmd(commit_cmds(b"melon", 12, 11, b"v2"), 2, 4, 1)
        .unwrap();
    let total = fx.store.accountant().in_use();

    let res = fx
        .store
        .handle_admin_raft_cmd(AdminCmd::CommitMerge { source: 2 }, 1, 7, 1)
        .unwrap();
    assert_eq!(res, ApplyRes::Persist);
    assert!(fx.store.get_region(2).is_none());
    let target = fx.store.get_region(1).unwrap();
    assert_eq!(target.lock().data().committed_row_count(), 2);
    assert_eq!(target.lock().meta().range, whole_range());
    assert_eq!(fx.store.accountant().in_use(), total);
}

#[test]
fn test_commit_merge_missing_source_fails() {
    let fx = fixture();
    fx.store
        .insert_region(RegionMeta::new(1, 11, whole_range()))
        .unwrap();
    let err = fx
        .store
        .handle_admin_raft_cmd(AdminCmd::CommitMerge { source: 9 }, 1, 6, 1)
        .unwrap_err();
    assert!(matches!(err, Error::RegionNotFound(9)));
}

#[test]
fn test_destroy_frees_memory_and_columnar_data() {
    let fx = fixture();
    fx.store
        .insert_region(RegionMeta::new(1, 11, whole_range()))
        .unwrap();
    fx.store
        .handle_write_raft_cmd(commit_cmds(b"rowA", 10, 5, b"value1"), 1, 6, 1)
        .unwrap();
    assert!(fx.store.accountant().in_use() > 0);

    fx.store.handle_destroy(1).unwrap();
    assert!(fx.store.get_region(1).is_none());
    assert_eq!(fx.store.accountant().in_use(), 0);
    assert_eq!(*fx.columnar.removed.lock(), vec![1]);
}

#[test]
fn test_destroy_absent_region_is_noop() {
    let fx = fixture();
    fx.store.handle_destroy(42).unwrap();
    assert!(fx.columnar.removed.lock().is_empty());
}

#[test]
fn test_stale_admin_cmd_ignored() {
    let fx = fixture();
    fx.store
        .insert_region(RegionMeta::new(1, 11, whole_range()))
        .unwrap();
    fx.store
        .handle_write_raft_cmd(commit_cmds(b"a", 10, 5, b"v"), 1, 6, 1)
        .unwrap();
    let res = fx
        .store
        .handle_admin_raft_cmd(
            AdminCmd::CompactLog {
                compact_index: 4,
                compact_term: 1,
            },
            1,
            6,
            1,
        )
        .unwrap();
    assert_eq!(res, ApplyRes::None);
    assert_eq!(fx.store.get_region(1).unwrap().lock().truncated_index(), 0);
}

#[test]
fn test_batch_read_index_round_trip() {
    let fx = fixture();
    let out = fx.store.batch_read_index(
        vec![
            ReadIndexRequest {
                region_id: 3,
                read_ts: 100,
            },
            ReadIndexRequest {
                region_id: 7,
                read_ts: 100,
            },
        ],
        Duration::from_secs(5),
    );
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].0.read_index, Some(30));
    assert_eq!(out[1].0.read_index, Some(70));
}

#[test]
fn test_eager_raft_log_gc_hints() {
    let fx = fixture_with_config(KVStoreConfig {
        eager_gc_log_gap: 3,
        compact_log_gap: 0,
        ..KVStoreConfig::default()
    });
    fx.store
        .insert_region(RegionMeta::new(1, 11, whole_range()))
        .unwrap();
    for index in 1..=2u64 {
        let ts = 10 + 2 * index;
        fx.store
            .handle_write_raft_cmd(commit_cmds(b"a", ts, ts - 1, b"v"), 1, index, 1)
            .unwrap();
    }
    assert!(fx.store.get_raft_log_gc_hints().is_empty());

    fx.store
        .handle_write_raft_cmd(commit_cmds(b"a", 20, 19, b"v"), 1, 3, 1)
        .unwrap();
    let hints = fx.store.get_raft_log_gc_hints();
    assert_eq!(hints.len(), 1);
    assert_eq!(hints[0].region_id, 1);
    assert_eq!(hints[0].applied_index, 3);

    fx.store.apply_raft_log_gc_task_res(RaftLogGcTaskRes {
        region_id: 1,
        new_truncated_index: 3,
    });
    fx.store
        .handle_write_raft_cmd(commit_cmds(b"a", 30, 29, b"v"), 1, 4, 1)
        .unwrap();
    assert!(fx.store.get_raft_log_gc_hints().is_empty());
}

#[test]
fn test_hot_reload_compact_log_config() {
    let fx = fixture();
    fx.store
        .insert_region(RegionMeta::new(1, 11, whole_range()))
        .unwrap();
    fx.store
        .handle_write_raft_cmd(commit_cmds(b"a", 10, 5, b"v"), 1, 6, 1)
        .unwrap();
    assert!(!fx.store.try_flush_region_data(1, false, true).unwrap());
    fx.store.set_region_compact_log_config(1, u64::MAX, 0, 0);
    assert!(fx.store.try_flush_region_data(1, false, true).unwrap());
}

