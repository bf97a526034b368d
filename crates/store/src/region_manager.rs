//! Region table and per-region task locks
//!
//! The table maps region ids to shared region handles. Lookups and
//! traversal take the map lock shared; structural changes (split, merge,
//! destroy, snapshot-created regions) take it exclusive. Mutating one
//! region's contents never holds the map lock: callers clone the `Arc` out
//! and lock the region itself.
//!
//! A second lock per region, the task lock, serializes the long-running
//! operations on one region (apply, flush, persist, snapshot swap) without
//! blocking work on other regions and without holding the region's data
//! lock across collaborator calls.

use crate::region::Region;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use raftshard_core::{Error, RegionId, Result};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::debug;

/// Shared handle to one region.
pub type RegionPtr = Arc<Mutex<Region>>;

/// Concurrent table of all regions on this store.
#[derive(Debug, Default)]
pub struct RegionManager {
    regions: RwLock<FxHashMap<RegionId, RegionPtr>>,
    task_locks: DashMap<RegionId, Arc<Mutex<()>>>,
}

impl RegionManager {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a region handle.
    pub fn get(&self, region_id: RegionId) -> Option<RegionPtr> {
        self.regions.read().get(&region_id).cloned()
    }

    /// Look up a region handle, failing if absent.
    pub fn get_or_err(&self, region_id: RegionId) -> Result<RegionPtr> {
        self.get(region_id).ok_or(Error::RegionNotFound(region_id))
    }

    /// Whether the table holds `region_id`.
    pub fn contains(&self, region_id: RegionId) -> bool {
        self.regions.read().contains_key(&region_id)
    }

    /// Number of regions.
    pub fn len(&self) -> usize {
        self.regions.read().len()
    }

    /// Whether no regions are registered.
    pub fn is_empty(&self) -> bool {
        self.regions.read().is_empty()
    }

    /// Register a region, failing on an id collision.
    pub fn insert(&self, region: Region) -> Result<RegionPtr> {
        let mut regions = self.regions.write();
        if regions.contains_key(&region.id()) {
            return Err(Error::InconsistentAdminCommand(format!(
                "region {} already registered",
                region.id()
            )));
        }
        let id = region.id();
        let ptr = Arc::new(Mutex::new(region));
        regions.insert(id, ptr.clone());
        debug!(target: "raftshard::store", region_id = id, "Region registered");
        Ok(ptr)
    }

    /// Register a region, replacing any existing entry with the same id.
    pub fn insert_or_replace(&self, region: Region) -> RegionPtr {
        let id = region.id();
        let ptr = Arc::new(Mutex::new(region));
        self.regions.write().insert(id, ptr.clone());
        ptr
    }

    /// Remove a region from the table, returning its handle. The task-lock
    /// entry is kept: an in-flight flush or destroy still holds it, and a
    /// re-created region with the same id must serialize against them.
    pub fn remove(&self, region_id: RegionId) -> Option<RegionPtr> {
        let removed = self.regions.write().remove(&region_id);
        if removed.is_some() {
            debug!(target: "raftshard::store", region_id, "Region removed from table");
        }
        removed
    }

    /// Run `f` over every region handle under the shared map lock.
    pub fn traverse<F: FnMut(RegionId, &RegionPtr)>(&self, mut f: F) {
        for (id, ptr) in self.regions.read().iter() {
            f(*id, ptr);
        }
    }

    /// All registered region ids.
    pub fn region_ids(&self) -> Vec<RegionId> {
        self.regions.read().keys().copied().collect()
    }

    /// The task lock for `region_id`, created on first use.
    ///
    /// Hold it for the duration of an apply/flush/persist sequence; it
    /// outlives removal of the region itself, so a destroy racing a flush
    /// still serializes.
    pub fn task_lock(&self, region_id: RegionId) -> Arc<Mutex<()>> {
        self.task_locks
            .entry(region_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionMeta;
    use raftshard_core::{KeyRange, MemoryAccountant};

    fn new_region(id: RegionId) -> Region {
        Region::new(
            RegionMeta::new(id, id, KeyRange::new(Vec::new(), Vec::new())),
            MemoryAccountant::new(),
        )
    }

    #[test]
    fn test_insert_get_remove() {
        let mgr = RegionManager::new();
        mgr.insert(new_region(1)).unwrap();
        assert!(mgr.contains(1));
        assert_eq!(mgr.get(1).unwrap().lock().id(), 1);
        assert!(mgr.remove(1).is_some());
        assert!(mgr.get(1).is_none());
        assert!(mgr.remove(1).is_none());
    }

    #[test]
    fn test_insert_rejects_duplicate_id() {
        let mgr = RegionManager::new();
        mgr.insert(new_region(1)).unwrap();
        assert!(matches!(
            mgr.insert(new_region(1)),
            Err(Error::InconsistentAdminCommand(_))
        ));
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn test_get_or_err() {
        let mgr = RegionManager::new();
        assert!(matches!(mgr.get_or_err(9), Err(Error::RegionNotFound(9))));
    }

    #[test]
    fn test_traverse_sees_all() {
        let mgr = RegionManager::new();
        for id in 1..=4 {
            mgr.insert(new_region(id)).unwrap();
        }
        let mut seen = Vec::new();
        mgr.traverse(|id, _| seen.push(id));
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_task_lock_is_stable_per_region() {
        let mgr = RegionManager::new();
        mgr.insert(new_region(1)).unwrap();
        let a = mgr.task_lock(1);
        let b = mgr.task_lock(1);
        assert!(Arc::ptr_eq(&a, &b));
        let other = mgr.task_lock(2);
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn test_task_lock_serializes_across_threads() {
        let mgr = Arc::new(RegionManager::new());
        mgr.insert(new_region(1)).unwrap();
        let counter = Arc::new(Mutex::new(0u32));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let mgr = mgr.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let lock = mgr.task_lock(1);
                    let _guard = lock.lock();
                    let mut c = counter.lock();
                    *c += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock(), 400);
    }
}
