//! Dedicated worker pool for codec jobs.
//!
//! Compression is CPU-bound, so it runs on its own OS threads rather
//! than the async runtime: (cores − 1) workers clamped to [1, 8], a
//! bounded priority queue drained highest-priority-first (FIFO within a
//! class), and a typed resource-exhausted error when the queue is full.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;
use tracing::debug;

use crate::cache::engine::{self, CompressionAlgorithm};
use crate::error::{CoreError, CoreResult};
use crate::ipc::Priority;

/// Queued jobs before submissions fail.
const QUEUE_CAPACITY: usize = 256;

enum JobWork {
    Compress {
        input: Vec<u8>,
        algorithm: CompressionAlgorithm,
        level: u32,
    },
    Decompress {
        input: Vec<u8>,
    },
}

struct Job {
    priority: Priority,
    /// Submission order; lower is older, breaking ties FIFO.
    seq: u64,
    work: JobWork,
    result: oneshot::Sender<CoreResult<Vec<u8>>>,
    cancelled: Arc<AtomicBool>,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Job {}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then older submissions.
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Handle to a submitted job: await the result, or cancel it.
pub struct JobHandle {
    receiver: oneshot::Receiver<CoreResult<Vec<u8>>>,
    cancelled: Arc<AtomicBool>,
}

impl JobHandle {
    /// Suspend until the worker finishes (or the job is cancelled).
    pub async fn await_result(self) -> CoreResult<Vec<u8>> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(CoreError::Cancelled),
        }
    }

    /// Cancel the job. A job already running completes; one still queued
    /// resolves with a cancelled error.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

struct PoolShared {
    queue: Mutex<BinaryHeap<Job>>,
    available: Condvar,
    shutdown: AtomicBool,
}

/// The worker pool.
pub struct CompressionPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_seq: AtomicU64,
}

impl CompressionPool {
    pub fn new() -> Arc<Self> {
        Self::with_workers((num_cpus::get().saturating_sub(1)).clamp(1, 8))
    }

    pub fn with_workers(count: usize) -> Arc<Self> {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let shared = shared.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("compress-worker-{index}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("spawning compression worker"),
            );
        }
        debug!("compression pool started with {count} workers");
        Arc::new(Self {
            shared,
            workers: Mutex::new(workers),
            next_seq: AtomicU64::new(0),
        })
    }

    /// Queue a compression job.
    pub fn submit_compress(
        &self,
        input: Vec<u8>,
        algorithm: CompressionAlgorithm,
        level: u32,
        priority: Priority,
    ) -> CoreResult<JobHandle> {
        self.submit(
            JobWork::Compress {
                input,
                algorithm,
                level,
            },
            priority,
        )
    }

    /// Queue a decompression job.
    pub fn submit_decompress(&self, input: Vec<u8>, priority: Priority) -> CoreResult<JobHandle> {
        self.submit(JobWork::Decompress { input }, priority)
    }

    fn submit(&self, work: JobWork, priority: Priority) -> CoreResult<JobHandle> {
        let (tx, rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= QUEUE_CAPACITY {
                return Err(CoreError::ResourceExhausted(format!(
                    "compression queue at capacity ({QUEUE_CAPACITY})"
                )));
            }
            queue.push(Job {
                priority,
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                work,
                result: tx,
                cancelled: cancelled.clone(),
            });
        }
        self.shared.available.notify_one();
        Ok(JobHandle {
            receiver: rx,
            cancelled,
        })
    }

    /// Jobs currently queued (not running).
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

impl Drop for CompressionPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.available.notify_all();
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Some(job) = queue.pop() {
                    break job;
                }
                shared.available.wait(&mut queue);
            }
        };

        if job.cancelled.load(Ordering::Acquire) {
            let _ = job.result.send(Err(CoreError::Cancelled));
            continue;
        }
        let output = match job.work {
            JobWork::Compress {
                input,
                algorithm,
                level,
            } => engine::compress(&input, algorithm, level),
            JobWork::Decompress { input } => engine::decompress(&input),
        };
        // The submitter may have stopped waiting; that is not an error.
        let _ = job.result.send(output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jobs_round_trip_through_the_pool() {
        let pool = CompressionPool::with_workers(2);
        let input = b"pool round trip payload".repeat(64);

        let compressed = pool
            .submit_compress(input.clone(), CompressionAlgorithm::Zstd, 3, Priority::Normal)
            .unwrap()
            .await_result()
            .await
            .unwrap();
        let restored = pool
            .submit_decompress(compressed, Priority::Normal)
            .unwrap()
            .await_result()
            .await
            .unwrap();
        assert_eq!(restored, input);
    }

    #[tokio::test]
    async fn cancelled_jobs_resolve_with_cancelled_error() {
        let pool = CompressionPool::with_workers(1);
        // Park the single worker behind a large job so the next one is
        // still queued when we cancel it.
        let big = vec![0u8; 4 * 1024 * 1024];
        let _busy = pool
            .submit_compress(big, CompressionAlgorithm::Brotli, 11, Priority::Critical)
            .unwrap();

        let handle = pool
            .submit_compress(vec![1, 2, 3], CompressionAlgorithm::Lz4, 0, Priority::Low)
            .unwrap();
        handle.cancel();
        let result = handle.await_result().await;
        assert!(matches!(result, Err(CoreError::Cancelled)));
    }

    #[tokio::test]
    async fn priority_classes_drain_highest_first() {
        let pool = CompressionPool::with_workers(1);
        // Occupy the worker.
        let big = vec![0u8; 4 * 1024 * 1024];
        let busy = pool
            .submit_compress(big, CompressionAlgorithm::Brotli, 11, Priority::Critical)
            .unwrap();

        let low = pool
            .submit_compress(vec![1u8; 64], CompressionAlgorithm::Lz4, 0, Priority::Low)
            .unwrap();
        let high = pool
            .submit_compress(vec![2u8; 64], CompressionAlgorithm::Lz4, 0, Priority::High)
            .unwrap();

        // With one worker, the high job must be popped before the low
        // one; completion order proves queue order.
        let _ = busy.await_result().await.unwrap();
        let high_out = high.await_result().await.unwrap();
        let low_out = low.await_result().await.unwrap();
        assert_eq!(engine::decompress(&high_out).unwrap(), vec![2u8; 64]);
        assert_eq!(engine::decompress(&low_out).unwrap(), vec![1u8; 64]);
    }
}
