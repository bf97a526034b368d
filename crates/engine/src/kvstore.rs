//! KVStore: the apply-side orchestrator
//!
//! One `KVStore` per process. The raft layer calls in with committed
//! write batches, admin commands, and snapshots; the store applies them to
//! the in-memory regions, decides when accumulated rows flush into the
//! columnar engine, and tells the raft layer when region state must be
//! persisted.
//!
//! # Locking
//!
//! Every operation on one region runs under that region's task lock, then
//! takes the region's own mutex. The region map lock is only held to look
//! a handle up or to change the table (split, merge, destroy, snapshot
//! registration). Collaborator calls that can block (columnar writes,
//! persistence) happen while holding the task lock but never the map lock.

use crate::cmd::{AdminCmd, ApplyRes, CmdKind, SplitRequest, WriteCmd};
use crate::prehandle::{PreHandlingTrace, PrehandlePool};
use crate::raft_log_gc::{RaftLogGcHint, RaftLogGcHints, RaftLogGcTaskRes};
use crate::read_index::ReadIndexWorkers;
use crate::traits::{
    ColumnarEngine, CommittedRow, PersistReason, ReadIndexClient, ReadIndexRequest,
    ReadIndexResponse, RegionPersister, SstReader,
};
use parking_lot::MutexGuard;
use raftshard_core::{
    CfName, Error, KeyRange, MemoryAccountant, PeerId, RaftIndex, RaftTerm, RegionId, Result,
    WriteKind,
};
use raftshard_store::cf::DupPolicy;
use raftshard_store::{Region, RegionData, RegionManager, RegionMeta, RegionPtr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tuning knobs, all hot-reloadable via
/// [`KVStore::set_region_compact_log_config`].
#[derive(Debug, Clone)]
pub struct KVStoreConfig {
    /// Committed rows in a region before a flush is suggested.
    pub compact_log_min_rows: u64,
    /// Accumulated bytes in a region before a flush is suggested.
    pub compact_log_min_bytes: u64,
    /// Applied-index gap since the last flush before one is suggested.
    pub compact_log_gap: u64,
    /// Log-tail length that triggers an eager raft-log GC hint; 0 disables.
    pub eager_gc_log_gap: u64,
    /// Snapshot conversion worker threads.
    pub snapshot_worker_threads: usize,
    /// Bound on queued snapshot conversions.
    pub snapshot_queue_depth: usize,
    /// Raft runner count; the read-index pool is a multiple of it.
    pub read_index_runner_cnt: usize,
}

impl Default for KVStoreConfig {
    fn default() -> Self {
        Self {
            compact_log_min_rows: 40 * 1024,
            compact_log_min_bytes: 32 * 1024 * 1024,
            compact_log_gap: 200,
            eager_gc_log_gap: 512,
            snapshot_worker_threads: 4,
            snapshot_queue_depth: 16,
            read_index_runner_cnt: 1,
        }
    }
}

/// Metadata of a region arriving by snapshot.
#[derive(Debug, Clone)]
pub struct RegionStub {
    /// Region id.
    pub region_id: RegionId,
    /// This store's peer in the region's raft group.
    pub peer_id: PeerId,
    /// Raw-key range the region covers.
    pub range: KeyRange,
}

/// Output of a completed snapshot conversion, ready to swap in.
#[derive(Debug)]
pub struct PrehandleResult {
    /// Metadata of the incoming region.
    pub stub: RegionStub,
    /// Converted region data; orphan context recorded inside.
    pub data: RegionData,
    /// Raft index of the snapshot.
    pub index: RaftIndex,
    /// Raft term of the snapshot.
    pub term: RaftTerm,
}

/// The apply-side state-machine layer.
pub struct KVStore {
    regions: RegionManager,
    persister: Arc<dyn RegionPersister>,
    columnar: Arc<dyn ColumnarEngine>,
    read_index_workers: ReadIndexWorkers,
    prehandle_pool: PrehandlePool,
    prehandle_trace: Arc<PreHandlingTrace>,
    gc_hints: RaftLogGcHints,
    accountant: MemoryAccountant,
    compact_log_min_rows: AtomicU64,
    compact_log_min_bytes: AtomicU64,
    compact_log_gap: AtomicU64,
    eager_gc_log_gap: AtomicU64,
}

impl KVStore {
    /// Build a store wired to its collaborators.
    pub fn new(
        config: KVStoreConfig,
        persister: Arc<dyn RegionPersister>,
        columnar: Arc<dyn ColumnarEngine>,
        read_index_client: Arc<dyn ReadIndexClient>,
    ) -> Self {
        Self {
            regions: RegionManager::new(),
            persister,
            columnar,
            read_index_workers: ReadIndexWorkers::new(
                read_index_client,
                config.read_index_runner_cnt,
            ),
            prehandle_pool: PrehandlePool::new(
                config.snapshot_worker_threads,
                config.snapshot_queue_depth,
            ),
            prehandle_trace: Arc::new(PreHandlingTrace::new()),
            gc_hints: RaftLogGcHints::new(),
            accountant: MemoryAccountant::new(),
            compact_log_min_rows: AtomicU64::new(config.compact_log_min_rows),
            compact_log_min_bytes: AtomicU64::new(config.compact_log_min_bytes),
            compact_log_gap: AtomicU64::new(config.compact_log_gap),
            eager_gc_log_gap: AtomicU64::new(config.eager_gc_log_gap),
        }
    }

    /// The memory accountant all regions report to.
    pub fn accountant(&self) -> &MemoryAccountant {
        &self.accountant
    }

    /// The region table.
    pub fn region_manager(&self) -> &RegionManager {
        &self.regions
    }

    /// Look up a region handle.
    pub fn get_region(&self, region_id: RegionId) -> Option<RegionPtr> {
        self.regions.get(region_id)
    }

    /// Register a region created outside the snapshot path (bootstrap,
    /// tests).
    pub fn insert_region(&self, meta: RegionMeta) -> Result<RegionPtr> {
        self.regions
            .insert(Region::new(meta, self.accountant.clone()))
    }

    /// Hot-reload the flush and eager-GC thresholds.
    pub fn set_region_compact_log_config(
        &self,
        min_rows: u64,
        min_bytes: u64,
        gap: u64,
        eager_gc_gap: u64,
    ) {
        self.compact_log_min_rows.store(min_rows, Ordering::Relaxed);
        self.compact_log_min_bytes
            .store(min_bytes, Ordering::Relaxed);
        self.compact_log_gap.store(gap, Ordering::Relaxed);
        self.eager_gc_log_gap.store(eager_gc_gap, Ordering::Relaxed);
        info!(
            target: "raftshard::engine",
            min_rows, min_bytes, gap, eager_gc_gap,
            "Compact-log config updated"
        );
    }

    /// Apply a committed batch of CF writes.
    ///
    /// A missing region or a stale index (at or below the applied index,
    /// which raft redelivery produces routinely) applies nothing. Returns
    /// `Persist` when the region's accumulated data suggests a flush.
    pub fn handle_write_raft_cmd(
        &self,
        cmds: Vec<WriteCmd>,
        region_id: RegionId,
        index: RaftIndex,
        term: RaftTerm,
    ) -> Result<ApplyRes> {
        let Some(region_ptr) = self.regions.get(region_id) else {
            debug!(
                target: "raftshard::engine",
                region_id, index,
                "Write command for unknown region"
            );
            return Ok(ApplyRes::NotFound);
        };
        let task_lock = self.regions.task_lock(region_id);
        let _task_guard = task_lock.lock();
        let mut region = region_ptr.lock();
        if index <= region.applied_index() {
            debug!(
                target: "raftshard::engine",
                region_id, index, applied = region.applied_index(),
                "Stale write command ignored"
            );
            return Ok(ApplyRes::None);
        }
        for cmd in &cmds {
            match cmd.kind {
                CmdKind::Put => {
                    region
                        .data_mut()
                        .insert(cmd.cf, &cmd.key, &cmd.value, DupPolicy::Overwrite)?;
                }
                CmdKind::Delete => {
                    region.data_mut().remove(cmd.cf, &cmd.key)?;
                }
            }
        }
        region.advance_applied(index, term)?;
        self.gc_hints.observe_applied(
            region_id,
            index,
            region.truncated_index(),
            self.eager_gc_log_gap.load(Ordering::Relaxed),
        );
        if self.can_flush_region_data_impl(&region, false) {
            Ok(ApplyRes::Persist)
        } else {
            Ok(ApplyRes::None)
        }
    }

    /// Apply a committed admin command.
    pub fn handle_admin_raft_cmd(
        &self,
        cmd: AdminCmd,
        region_id: RegionId,
        index: RaftIndex,
        term: RaftTerm,
    ) -> Result<ApplyRes> {
        let Some(region_ptr) = self.regions.get(region_id) else {
            debug!(
                target: "raftshard::engine",
                region_id, index, cmd = cmd.name(),
                "Admin command for unknown region"
            );
            return Ok(ApplyRes::NotFound);
        };
        let task_lock = self.regions.task_lock(region_id);
        let _task_guard = task_lock.lock();
        let mut region = region_ptr.lock();
        if index <= region.applied_index() {
            debug!(
                target: "raftshard::engine",
                region_id, index, applied = region.applied_index(), cmd = cmd.name(),
                "Stale admin command ignored"
            );
            return Ok(ApplyRes::None);
        }
        match cmd {
            AdminCmd::Split { splits } => {
                self.handle_split(&mut region, splits, index, term)?;
                self.persist_region(&region, PersistReason::AdminCommand, "split parent")?;
                Ok(ApplyRes::Persist)
            }
            AdminCmd::CommitMerge { source } => {
                self.handle_commit_merge(&mut region, source, index, term)?;
                self.persist_region(&region, PersistReason::AdminCommand, "merge target")?;
                Ok(ApplyRes::Persist)
            }
            AdminCmd::CompactLog {
                compact_index,
                compact_term,
            } => {
                let progressed = region.handle_compact_log(compact_index, compact_term);
                region.advance_applied(index, term)?;
                if progressed {
                    self.persist_region(&region, PersistReason::AdminCommand, "compact log")?;
                    Ok(ApplyRes::Persist)
                } else {
                    self.handle_useless_admin_raft_cmd(&region, "CompactLog")?;
                    Ok(ApplyRes::Persist)
                }
            }
            AdminCmd::PrepareMerge { target } => {
                debug!(
                    target: "raftshard::engine",
                    region_id, target,
                    "Prepare merge recorded"
                );
                region.advance_applied(index, term)?;
                self.handle_useless_admin_raft_cmd(&region, "PrepareMerge")?;
                Ok(ApplyRes::Persist)
            }
            AdminCmd::ChangePeer => {
                region.advance_applied(index, term)?;
                self.handle_useless_admin_raft_cmd(&region, "ChangePeer")?;
                Ok(ApplyRes::Persist)
            }
        }
    }

    /// An admin command that changed no region structure still advanced
    /// the applied index, which must reach the persister.
    fn handle_useless_admin_raft_cmd(&self, region: &Region, what: &str) -> Result<()> {
        self.persist_region(region, PersistReason::UselessAdminCommand, what)
    }

    fn handle_split(
        &self,
        parent: &mut MutexGuard<'_, Region>,
        splits: Vec<SplitRequest>,
        index: RaftIndex,
        term: RaftTerm,
    ) -> Result<()> {
        if splits.is_empty() {
            return Err(Error::InconsistentAdminCommand(
                "split with no requests".to_string(),
            ));
        }
        // Each child must take an end of whatever range the parent still
        // holds after the preceding splits; an interior range would leave
        // the parent's recorded range overlapping the child's.
        let mut remaining = parent.meta().range.clone();
        for split in &splits {
            let range = KeyRange::new(split.start.clone(), split.end.clone());
            if !range.is_well_formed() {
                return Err(Error::InconsistentAdminCommand(format!(
                    "split child {} has ill-formed range {:?}..{:?}",
                    split.new_region_id, split.start, split.end
                )));
            }
            if self.regions.contains(split.new_region_id) {
                return Err(Error::InconsistentAdminCommand(format!(
                    "split child id {} already exists",
                    split.new_region_id
                )));
            }
            if range.start == remaining.start && !range.end.is_empty() {
                remaining.start = range.end.clone();
            } else if range.end == remaining.end {
                remaining.end = range.start.clone();
            } else {
                return Err(Error::InconsistentAdminCommand(format!(
                    "split child {} range {:?}..{:?} is interior to the parent range",
                    split.new_region_id, split.start, split.end
                )));
            }
        }
        parent.advance_applied(index, term)?;
        for split in splits {
            let range = KeyRange::new(split.start, split.end);
            let child = parent.split_out(
                split.new_region_id,
                split.new_peer_id,
                range,
                self.accountant.clone(),
            );
            info!(
                target: "raftshard::engine",
                parent = parent.id(),
                child = child.id(),
                child_size = child.data().data_size(),
                "Region split"
            );
            let child_ptr = self.regions.insert(child)?;
            self.persist_region(&child_ptr.lock(), PersistReason::AdminCommand, "split child")?;
        }
        Ok(())
    }

    fn handle_commit_merge(
        &self,
        target: &mut MutexGuard<'_, Region>,
        source_id: RegionId,
        index: RaftIndex,
        term: RaftTerm,
    ) -> Result<()> {
        let source_ptr = self.regions.get_or_err(source_id)?;
        let source_task_lock = self.regions.task_lock(source_id);
        let _source_guard = source_task_lock.lock();
        {
            let mut source = source_ptr.lock();
            target.merge_from(&mut source);
            info!(
                target: "raftshard::engine",
                target = target.id(),
                source = source_id,
                merged_size = target.data().data_size(),
                "Region merge committed"
            );
        }
        self.regions.remove(source_id);
        self.gc_hints.remove_region(source_id);
        target.advance_applied(index, term)?;
        Ok(())
    }

    /// Whether `region` has accumulated enough to warrant a flush.
    fn can_flush_region_data_impl(&self, region: &Region, force: bool) -> bool {
        if force {
            return true;
        }
        let rows = region.data().committed_row_count() as u64;
        if rows >= self.compact_log_min_rows.load(Ordering::Relaxed) {
            return true;
        }
        if region.data().data_size() >= self.compact_log_min_bytes.load(Ordering::Relaxed) {
            return true;
        }
        let gap_threshold = self.compact_log_gap.load(Ordering::Relaxed);
        gap_threshold > 0
            && region.applied_index().saturating_sub(region.last_compact_log_applied())
                >= gap_threshold
    }

    /// Flush a region's committed rows into the columnar engine if the
    /// thresholds say so (or unconditionally with `force`). Returns
    /// whether a flush happened.
    ///
    /// With `try_until_succeed`, a failed columnar write is returned as an
    /// error for the caller to retry; otherwise the failure is logged and
    /// the rows stay in the region for the next attempt.
    pub fn try_flush_region_data(
        &self,
        region_id: RegionId,
        force: bool,
        try_until_succeed: bool,
    ) -> Result<bool> {
        let Some(region_ptr) = self.regions.get(region_id) else {
            debug!(
                target: "raftshard::engine",
                region_id,
                "Flush requested for unknown region"
            );
            return Ok(false);
        };
        let task_lock = self.regions.task_lock(region_id);
        let _task_guard = task_lock.lock();
        let mut region = region_ptr.lock();
        if !self.can_flush_region_data_impl(&region, force) {
            return Ok(false);
        }
        match self.force_flush_region_data_impl(&mut region) {
            Ok(()) => Ok(true),
            Err(e) if !try_until_succeed && matches!(e, Error::Flush(_) | Error::Engine(_)) => {
                warn!(
                    target: "raftshard::engine",
                    region_id, error = %e,
                    "Flush failed, rows retained for retry"
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve all committed rows, hand them to the columnar engine, and
    /// erase them from the region. Rollback and Lock records are dropped
    /// without reaching the engine. Orphan write keys whose value half is
    /// still in flight stay behind for the next flush.
    fn force_flush_region_data_impl(&self, region: &mut MutexGuard<'_, Region>) -> Result<()> {
        let region_id = region.id();
        let applied_index = region.applied_index();
        let write_keys = region.data().write_cf_keys();
        let mut rows = Vec::new();
        let mut flushed_keys = Vec::new();
        for key in write_keys {
            let read = region
                .data_mut()
                .read_by_write_key(&key, true, region_id, applied_index, false)?;
            match read {
                Some(info) => {
                    match info.kind {
                        WriteKind::Put | WriteKind::Delete => rows.push(CommittedRow {
                            raw_key: info.raw_key,
                            kind: info.kind,
                            commit_ts: info.commit_ts,
                            value: info.value,
                        }),
                        // transaction bookkeeping, nothing for the engine
                        WriteKind::Rollback | WriteKind::Lock => {}
                    }
                    flushed_keys.push(key);
                }
                None => {
                    // orphan, value half still expected
                    debug!(
                        target: "raftshard::engine",
                        region_id,
                        "Write key skipped at flush, awaiting default value"
                    );
                }
            }
        }
        let row_count = rows.len();
        if !rows.is_empty() {
            self.columnar
                .write_rows(region_id, rows)
                .map_err(|e| Error::Flush(e.to_string()))?;
        }
        let mut released = 0;
        for key in &flushed_keys {
            released += region.data_mut().remove_by_write_key(key);
        }
        region.mark_compact_log_applied();
        self.persist_region(region, PersistReason::Flush, "flush")?;
        info!(
            target: "raftshard::engine",
            region_id, rows = row_count, released,
            "Region flushed to columnar engine"
        );
        Ok(())
    }

    fn persist_region(&self, region: &Region, reason: PersistReason, what: &str) -> Result<()> {
        debug!(
            target: "raftshard::engine",
            region_id = region.id(),
            applied = region.applied_index(),
            reason = %reason,
            what,
            "Persisting region"
        );
        self.persister.persist(region, reason)
    }

    /// Convert a snapshot's SSTs into region data on the conversion pool.
    ///
    /// Blocks until the conversion finishes or aborts. `deadline_index`
    /// sets the raft index by which all orphan write keys observed during
    /// conversion must have been reconciled by log replay.
    pub fn pre_handle_snapshot(
        &self,
        stub: RegionStub,
        ssts: Vec<Box<dyn SstReader>>,
        index: RaftIndex,
        term: RaftTerm,
        deadline_index: RaftIndex,
    ) -> Result<PrehandleResult> {
        let region_id = stub.region_id;
        let task = self.prehandle_trace.register_task(region_id);
        let accountant = self.accountant.clone();
        let (result_tx, result_rx) = mpsc::channel();
        let submit = self.prehandle_pool.submit(move || {
            let result = convert_snapshot(
                region_id,
                ssts,
                index,
                deadline_index,
                accountant,
                &task,
            );
            let _ = result_tx.send(result);
        });
        if submit.is_err() {
            self.prehandle_trace.deregister_task(region_id);
            return Err(Error::Snapshot(format!(
                "prehandle pool saturated, region {region_id} must retry"
            )));
        }
        let result = result_rx
            .recv()
            .map_err(|_| Error::Snapshot("prehandle worker dropped".to_string()));
        self.prehandle_trace.deregister_task(region_id);
        let data = result??;
        Ok(PrehandleResult {
            stub,
            data,
            index,
            term,
        })
    }

    /// Request cancellation of an in-flight conversion. Best-effort.
    pub fn abort_pre_handle_snapshot(&self, region_id: RegionId) -> bool {
        self.prehandle_trace.abort_task(region_id)
    }

    /// Conversions currently in flight.
    pub fn ongoing_prehandle_task_count(&self) -> usize {
        self.prehandle_trace.ongoing_count()
    }

    /// Upper bound on snapshots converting in parallel.
    pub fn max_parallel_prehandle_size(&self) -> usize {
        self.prehandle_pool.parallelism()
    }

    /// Swap pre-handled snapshot data into the live region, creating it if
    /// new. Returns `false` when log replay advanced the region past the
    /// snapshot's index while it was converting: swapping then would roll
    /// `applied_index` back and re-open the redelivery window. Regions
    /// whose range the incoming snapshot overlaps are persisted first so
    /// their recorded state reflects the takeover.
    pub fn apply_pre_handled_snapshot(&self, result: PrehandleResult) -> Result<bool> {
        let region_id = result.stub.region_id;
        let task_lock = self.regions.task_lock(region_id);
        let _task_guard = task_lock.lock();
        if let Some(region_ptr) = self.regions.get(region_id) {
            let applied = region_ptr.lock().applied_index();
            if result.index <= applied {
                info!(
                    target: "raftshard::engine",
                    region_id, snapshot_index = result.index, applied,
                    "Superseded snapshot discarded"
                );
                return Ok(false);
            }
        }
        let overlapped = self.overlapped_regions(region_id, &result.stub.range);
        for ptr in overlapped {
            let other = ptr.lock();
            self.persist_region(&other, PersistReason::ApplySnapshotPrevRegion, "overlap")?;
        }
        match self.regions.get(region_id) {
            Some(region_ptr) => {
                let mut region = region_ptr.lock();
                region.apply_snapshot_data(result.data, result.index, result.term);
                info!(
                    target: "raftshard::engine",
                    region_id, index = result.index,
                    size = region.data().data_size(),
                    "Snapshot applied over existing region"
                );
                self.persist_region(&region, PersistReason::ApplySnapshotCurRegion, "snapshot")?;
            }
            None => {
                let meta = RegionMeta::new(region_id, result.stub.peer_id, result.stub.range);
                let mut region = Region::new(meta, self.accountant.clone());
                region.apply_snapshot_data(result.data, result.index, result.term);
                info!(
                    target: "raftshard::engine",
                    region_id, index = result.index,
                    size = region.data().data_size(),
                    "Snapshot created new region"
                );
                let region_ptr = self.regions.insert(region)?;
                self.persist_region(
                    &region_ptr.lock(),
                    PersistReason::ApplySnapshotCurRegion,
                    "snapshot",
                )?;
            }
        }
        Ok(true)
    }

    fn overlapped_regions(&self, except: RegionId, range: &KeyRange) -> Vec<RegionPtr> {
        // Collect handles under the map lock, inspect ranges after
        // releasing it; locking a region while holding the map lock can
        // deadlock against a split registering children.
        let mut candidates = Vec::new();
        self.regions.traverse(|id, ptr| {
            if id != except {
                candidates.push(ptr.clone());
            }
        });
        candidates
            .into_iter()
            .filter(|ptr| range.overlaps(&ptr.lock().meta().range))
            .collect()
    }

    /// Remove a region from the store. With `remove_data`, the columnar
    /// engine drops its rows too.
    pub fn remove_region(&self, region_id: RegionId, remove_data: bool) -> Result<()> {
        let task_lock = self.regions.task_lock(region_id);
        let _task_guard = task_lock.lock();
        self.abort_pre_handle_snapshot(region_id);
        let removed = self.regions.remove(region_id);
        self.gc_hints.remove_region(region_id);
        if removed.is_some() && remove_data {
            self.columnar.remove_region(region_id)?;
        }
        Ok(())
    }

    /// Destroy a region on peer removal. A destroy for a region this
    /// store never had (or already destroyed) is a logged no-op: raft can
    /// redeliver the tombstone.
    pub fn handle_destroy(&self, region_id: RegionId) -> Result<()> {
        if !self.regions.contains(region_id) {
            info!(
                target: "raftshard::engine",
                region_id,
                "Destroy for absent region ignored"
            );
            // abort a conversion that would recreate it
            self.abort_pre_handle_snapshot(region_id);
            return Ok(());
        }
        info!(target: "raftshard::engine", region_id, "Region destroyed");
        self.remove_region(region_id, true)
    }

    /// Resolve a batch of read-index requests within `timeout`; expired
    /// entries come back as region errors.
    pub fn batch_read_index(
        &self,
        reqs: Vec<ReadIndexRequest>,
        timeout: Duration,
    ) -> Vec<(ReadIndexResponse, RegionId)> {
        self.read_index_workers.batch_read_index(reqs, timeout)
    }

    /// Drain pending eager raft-log GC hints.
    pub fn get_raft_log_gc_hints(&self) -> Vec<RaftLogGcHint> {
        self.gc_hints.drain()
    }

    /// Record the outcome of a raft-log GC task.
    pub fn apply_raft_log_gc_task_res(&self, res: RaftLogGcTaskRes) {
        self.gc_hints.apply_task_res(res);
    }
}

/// The conversion itself: drain the SST streams into a fresh `RegionData`,
/// then resolve every write record once so orphan keys get registered
/// against the snapshot context.
fn convert_snapshot(
    region_id: RegionId,
    ssts: Vec<Box<dyn SstReader>>,
    index: RaftIndex,
    deadline_index: RaftIndex,
    accountant: MemoryAccountant,
    task: &crate::prehandle::PrehandleTask,
) -> Result<RegionData> {
    let mut data = RegionData::new(region_id, accountant);
    {
        let orphan = data.orphan_keys_mut();
        orphan.pre_handling = true;
        orphan.snapshot_index = Some(index);
        orphan.deadline_index = Some(deadline_index);
    }
    // Default before Write keeps spurious orphans down; Lock last.
    let mut ssts = ssts;
    ssts.sort_by_key(|sst| match sst.cf() {
        CfName::Default => 0,
        CfName::Write => 1,
        CfName::Lock => 2,
    });
    for mut sst in ssts {
        let cf = sst.cf();
        while let Some(entry) = sst.next_entry()? {
            if task.is_aborted() {
                return Err(Error::Snapshot(format!(
                    "prehandle aborted for region {region_id}"
                )));
            }
            data.insert(cf, &entry.key, &entry.value, DupPolicy::Overwrite)?;
        }
    }
    let write_keys = data.write_cf_keys();
    for key in write_keys {
        if task.is_aborted() {
            return Err(Error::Snapshot(format!(
                "prehandle aborted for region {region_id}"
            )));
        }
        // hard_error = false: a missing default here is an orphan to
        // track, not corruption
        data.read_by_write_key(&key, true, region_id, index, false)?;
    }
    let orphans = data.orphan_keys().remained_key_count();
    if orphans > 0 {
        info!(
            target: "raftshard::snapshot",
            region_id, orphans, deadline_index,
            "Snapshot conversion finished with orphan write keys"
        );
    }
    data.orphan_keys_mut().pre_handling = false;
    Ok(data)
}
