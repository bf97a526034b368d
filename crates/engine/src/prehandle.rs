//! Snapshot pre-handling: task tracking and the conversion pool
//!
//! Converting a snapshot's SSTs into region data is CPU-heavy and happens
//! off the raft apply thread on a small fixed pool. Each in-flight
//! conversion is registered in the [`PreHandlingTrace`] so a later peer
//! removal or a replacing snapshot can abort it; the conversion loop polls
//! its task's abort flag between batches.

use parking_lot::{Condvar, Mutex};
use raftshard_core::RegionId;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error};

/// Abort handle for one in-flight snapshot conversion.
#[derive(Debug, Default)]
pub struct PrehandleTask {
    abort: AtomicBool,
}

impl PrehandleTask {
    /// Request cancellation. The conversion loop observes this between
    /// batches and bails out.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }
}

/// Registry of in-flight snapshot conversions, keyed by region.
#[derive(Debug, Default)]
pub struct PreHandlingTrace {
    tasks: Mutex<FxHashMap<RegionId, Arc<PrehandleTask>>>,
    ongoing: AtomicUsize,
}

impl PreHandlingTrace {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a conversion for `region_id`, returning its abort handle.
    /// A second registration for the same region returns the existing
    /// handle so both callers observe the same abort flag.
    pub fn register_task(&self, region_id: RegionId) -> Arc<PrehandleTask> {
        let mut tasks = self.tasks.lock();
        if let Some(existing) = tasks.get(&region_id) {
            return existing.clone();
        }
        let task = Arc::new(PrehandleTask::default());
        tasks.insert(region_id, task.clone());
        self.ongoing.fetch_add(1, Ordering::Release);
        task
    }

    /// Drop the registration for `region_id` once its conversion finished
    /// or aborted.
    pub fn deregister_task(&self, region_id: RegionId) {
        if self.tasks.lock().remove(&region_id).is_some() {
            self.ongoing.fetch_sub(1, Ordering::Release);
        }
    }

    /// Request cancellation of the conversion for `region_id`, if any.
    /// Returns whether a task was found.
    pub fn abort_task(&self, region_id: RegionId) -> bool {
        match self.tasks.lock().get(&region_id) {
            Some(task) => {
                task.abort();
                debug!(target: "raftshard::snapshot", region_id, "Prehandle abort requested");
                true
            }
            None => false,
        }
    }

    /// Number of conversions currently registered.
    pub fn ongoing_count(&self) -> usize {
        self.ongoing.load(Ordering::Acquire)
    }
}

/// Error returned when the conversion queue is full or shut down.
#[derive(Debug)]
pub struct PrehandleBackpressure;

impl fmt::Display for PrehandleBackpressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snapshot prehandle pool is saturated")
    }
}

impl std::error::Error for PrehandleBackpressure {}

struct PoolInner {
    queue: Mutex<VecDeque<Box<dyn FnOnce() + Send>>>,
    work_ready: Condvar,
    shutdown: AtomicBool,
    queue_depth: AtomicUsize,
    max_queue_depth: usize,
}

/// Fixed pool of snapshot-conversion worker threads.
///
/// Conversions run in submission order. The queue is bounded: when the
/// raft layer outruns conversion capacity it gets a backpressure error and
/// retries the snapshot later.
pub struct PrehandlePool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
}

impl PrehandlePool {
    /// Create a pool with `num_threads` workers named `snap-prehandle-N`.
    pub fn new(num_threads: usize, max_queue_depth: usize) -> Self {
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
            queue_depth: AtomicUsize::new(0),
            max_queue_depth,
        });
        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("snap-prehandle-{i}"))
                .spawn(move || worker_loop(&inner))
                .expect("failed to spawn prehandle worker thread");
            workers.push(handle);
        }
        Self {
            inner,
            workers: Mutex::new(workers),
            num_threads,
        }
    }

    /// Queue a conversion. Fails when the queue is at capacity or the pool
    /// has shut down.
    pub fn submit(&self, work: impl FnOnce() + Send + 'static) -> Result<(), PrehandleBackpressure> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(PrehandleBackpressure);
        }
        if self.inner.queue_depth.load(Ordering::Acquire) >= self.inner.max_queue_depth {
            return Err(PrehandleBackpressure);
        }
        {
            let mut queue = self.inner.queue.lock();
            queue.push_back(Box::new(work));
            self.inner.queue_depth.fetch_add(1, Ordering::Release);
        }
        self.inner.work_ready.notify_one();
        Ok(())
    }

    /// Number of worker threads; bounds how many snapshots convert in
    /// parallel.
    pub fn parallelism(&self) -> usize {
        self.num_threads
    }

    /// Signal workers to exit after draining the queue and join them.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            // Hold the queue lock while notifying so a worker between its
            // shutdown check and wait() cannot miss the wakeup.
            let _queue = self.inner.queue.lock();
            self.inner.work_ready.notify_all();
        }
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for PrehandlePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        let work = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(work) = queue.pop_front() {
                    inner.queue_depth.fetch_sub(1, Ordering::Release);
                    break work;
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };
        // A panicking conversion must not take the worker down with it.
        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(work)) {
            error!(
                target: "raftshard::snapshot",
                "prehandle task panicked: {:?}",
                e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn test_register_deduplicates() {
        let trace = PreHandlingTrace::new();
        let a = trace.register_task(1);
        let b = trace.register_task(1);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(trace.ongoing_count(), 1);
        trace.deregister_task(1);
        assert_eq!(trace.ongoing_count(), 0);
        // deregistering again is harmless
        trace.deregister_task(1);
        assert_eq!(trace.ongoing_count(), 0);
    }

    #[test]
    fn test_abort_reaches_registered_handle() {
        let trace = PreHandlingTrace::new();
        let task = trace.register_task(7);
        assert!(!task.is_aborted());
        assert!(trace.abort_task(7));
        assert!(task.is_aborted());
        assert!(!trace.abort_task(99));
    }

    #[test]
    fn test_pool_runs_submitted_work() {
        let pool = PrehandlePool::new(2, 64);
        let counter = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(5));
        for _ in 0..4 {
            let counter = counter.clone();
            let barrier = barrier.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
                barrier.wait();
            })
            .unwrap();
        }
        barrier.wait();
        assert_eq!(counter.load(Ordering::Relaxed), 4);
        pool.shutdown();
    }

    #[test]
    fn test_pool_backpressure() {
        let pool = PrehandlePool::new(1, 1);
        let gate = Arc::new(Barrier::new(2));
        let g = gate.clone();
        pool.submit(move || {
            g.wait();
        })
        .unwrap();
        // wait for the worker to take the gate task off the queue
        std::thread::sleep(Duration::from_millis(50));
        pool.submit(|| {}).unwrap();
        assert!(pool.submit(|| {}).is_err());
        gate.wait();
        pool.shutdown();
    }

    #[test]
    fn test_pool_rejects_after_shutdown() {
        let pool = PrehandlePool::new(1, 16);
        pool.shutdown();
        assert!(pool.submit(|| {}).is_err());
    }

    #[test]
    fn test_pool_survives_panicking_task() {
        let pool = PrehandlePool::new(1, 16);
        pool.submit(|| panic!("intentional test panic")).unwrap();
        let done = Arc::new(Barrier::new(2));
        let d = done.clone();
        pool.submit(move || {
            d.wait();
        })
        .unwrap();
        done.wait();
        pool.shutdown();
    }
}
