//! Read-index worker pool
//!
//! `batch_read_index` fans a batch of leader queries out over a fixed set
//! of worker threads and gathers the answers under one deadline. The
//! transport call blocks, so parallelism is the only way a batch finishes
//! inside the deadline; the pool is sized `coefficient * runner_cnt` to
//! over-provision relative to the raft runner count.
//!
//! A request whose answer misses the deadline is reported as a region
//! error and the caller stops waiting for it. The worker still finishes
//! the transport call; its late reply lands in a channel nobody reads,
//! which is fine.

use crate::traits::{ReadIndexClient, ReadIndexRequest, ReadIndexResponse};
use parking_lot::Mutex;
use raftshard_core::RegionId;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Pool size multiplier applied to the raft runner count.
pub const READ_INDEX_WORKER_COEFFICIENT: usize = 4;

struct Job {
    req: ReadIndexRequest,
    reply: Sender<(usize, ReadIndexResponse)>,
    slot: usize,
}

/// Fixed pool of threads issuing blocking read-index calls.
pub struct ReadIndexWorkers {
    job_tx: SyncSender<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ReadIndexWorkers {
    /// Spawn `READ_INDEX_WORKER_COEFFICIENT * runner_cnt` workers backed
    /// by `client`.
    pub fn new(client: Arc<dyn ReadIndexClient>, runner_cnt: usize) -> Self {
        let worker_cnt = READ_INDEX_WORKER_COEFFICIENT * runner_cnt.max(1);
        let (job_tx, job_rx) = mpsc::sync_channel::<Job>(worker_cnt * 16);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let mut workers = Vec::with_capacity(worker_cnt);
        for i in 0..worker_cnt {
            let client = client.clone();
            let job_rx = Arc::clone(&job_rx);
            let handle = std::thread::Builder::new()
                .name(format!("read-index-{i}"))
                .spawn(move || worker_loop(client, &job_rx))
                .expect("failed to spawn read-index worker thread");
            workers.push(handle);
        }
        Self {
            job_tx,
            workers: Mutex::new(workers),
        }
    }

    /// Resolve a batch of read-index requests within `timeout`.
    ///
    /// The output keeps the input order. Requests unanswered at the
    /// deadline yield [`ReadIndexResponse::region_error`].
    pub fn batch_read_index(
        &self,
        reqs: Vec<ReadIndexRequest>,
        timeout: Duration,
    ) -> Vec<(ReadIndexResponse, RegionId)> {
        let deadline = Instant::now() + timeout;
        let (reply_tx, reply_rx): (Sender<(usize, ReadIndexResponse)>, Receiver<_>) =
            mpsc::channel();
        let mut out: Vec<(ReadIndexResponse, RegionId)> = reqs
            .iter()
            .map(|req| (ReadIndexResponse::region_error(), req.region_id))
            .collect();
        let mut outstanding = 0usize;
        for (slot, req) in reqs.into_iter().enumerate() {
            let job = Job {
                req,
                reply: reply_tx.clone(),
                slot,
            };
            match self.job_tx.try_send(job) {
                Ok(()) => outstanding += 1,
                Err(e) => {
                    // Queue full or workers gone; the slot keeps its
                    // region-error placeholder.
                    warn!(target: "raftshard::read_index", error = %e, "Read-index dispatch failed");
                }
            }
        }
        drop(reply_tx);
        while outstanding > 0 {
            let now = Instant::now();
            if now >= deadline {
                debug!(
                    target: "raftshard::read_index",
                    outstanding,
                    "Read-index batch deadline reached"
                );
                break;
            }
            match reply_rx.recv_timeout(deadline - now) {
                Ok((slot, resp)) => {
                    out[slot].0 = resp;
                    outstanding -= 1;
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        out
    }

    /// Drop the job channel and join the workers.
    pub fn shutdown(self) {
        drop(self.job_tx);
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(client: Arc<dyn ReadIndexClient>, job_rx: &Mutex<Receiver<Job>>) {
    loop {
        let job = {
            let rx = job_rx.lock();
            match rx.recv() {
                Ok(job) => job,
                Err(_) => return,
            }
        };
        let resp = match client.read_index(&job.req) {
            Ok(resp) => resp,
            Err(e) => {
                warn!(
                    target: "raftshard::read_index",
                    region_id = job.req.region_id,
                    error = %e,
                    "Read-index transport call failed"
                );
                ReadIndexResponse::region_error()
            }
        };
        // Receiver may be gone if the batch already timed out.
        let _ = job.reply.send((job.slot, resp));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raftshard_core::Result;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct InstantClient;

    impl ReadIndexClient for InstantClient {
        fn read_index(&self, req: &ReadIndexRequest) -> Result<ReadIndexResponse> {
            Ok(ReadIndexResponse::ready(req.region_id * 100))
        }
    }

    struct SlowClient {
        delay: Duration,
        calls: AtomicU64,
    }

    impl ReadIndexClient for SlowClient {
        fn read_index(&self, req: &ReadIndexRequest) -> Result<ReadIndexResponse> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            std::thread::sleep(self.delay);
            Ok(ReadIndexResponse::ready(req.region_id))
        }
    }

    fn reqs(ids: &[RegionId]) -> Vec<ReadIndexRequest> {
        ids.iter()
            .map(|&region_id| ReadIndexRequest {
                region_id,
                read_ts: 10,
            })
            .collect()
    }

    #[test]
    fn test_batch_preserves_order() {
        let workers = ReadIndexWorkers::new(Arc::new(InstantClient), 2);
        let out = workers.batch_read_index(reqs(&[3, 1, 2]), Duration::from_secs(5));
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], (ReadIndexResponse::ready(300), 3));
        assert_eq!(out[1], (ReadIndexResponse::ready(100), 1));
        assert_eq!(out[2], (ReadIndexResponse::ready(200), 2));
        workers.shutdown();
    }

    #[test]
    fn test_empty_batch() {
        let workers = ReadIndexWorkers::new(Arc::new(InstantClient), 1);
        let out = workers.batch_read_index(Vec::new(), Duration::from_millis(10));
        assert!(out.is_empty());
        workers.shutdown();
    }

    #[test]
    fn test_timeout_yields_region_error() {
        let client = Arc::new(SlowClient {
            delay: Duration::from_secs(2),
            calls: AtomicU64::new(0),
        });
        let workers = ReadIndexWorkers::new(client.clone(), 1);
        let start = Instant::now();
        let out = workers.batch_read_index(reqs(&[5]), Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(out.len(), 1);
        assert!(out[0].0.region_error);
        assert_eq!(out[0].1, 5);
        // worker did pick the request up; its reply is simply discarded
        assert_eq!(client.calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_parallel_batch_beats_serial_time() {
        // 8 requests at 50ms each resolve well under 400ms on 4 workers.
        let client = Arc::new(SlowClient {
            delay: Duration::from_millis(50),
            calls: AtomicU64::new(0),
        });
        let workers = ReadIndexWorkers::new(client, 1);
        let ids: Vec<RegionId> = (1..=8).collect();
        let out = workers.batch_read_index(reqs(&ids), Duration::from_secs(5));
        assert!(out.iter().all(|(resp, _)| !resp.region_error));
        workers.shutdown();
    }
}
