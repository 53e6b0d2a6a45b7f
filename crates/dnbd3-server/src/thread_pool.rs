//! Bounded idle-worker pool reused for short-lived blocking tasks (disk
//! scans, hashing). Kept under its original name despite an async backing
//! (see `DESIGN.md`): each "worker" is a parked tokio task rather than an
//! OS thread, since the rest of this crate already runs on a cooperative
//! runtime and spinning up real OS threads here would just mean crossing
//! back and forth between two scheduling domains for no benefit.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Worker {
    tx: mpsc::Sender<Job>,
}

/// A pool of workers parked on a channel, reused across `run()` calls.
/// `run()` hands a job to an idle worker if one exists, otherwise spawns a
/// new one; after finishing a job, a worker re-parks itself if the pool has
/// fewer than `max_idle` idle workers, else exits.
pub struct ThreadPool {
    max_idle: usize,
    idle: Arc<parking_lot::Mutex<Vec<Worker>>>,
    idle_count: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl ThreadPool {
    pub fn new(max_idle: usize) -> Self {
        ThreadPool {
            max_idle,
            idle: Arc::new(parking_lot::Mutex::new(Vec::new())),
            idle_count: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Runs `job` on a pooled worker (spawning one if none is idle).
    /// Returns `false` without running `job` if the pool has been shut
    /// down.
    pub fn run(&self, job: impl FnOnce() + Send + 'static) -> bool {
        if self.shutdown.load(Ordering::SeqCst) {
            return false;
        }

        let job: Job = Box::new(job);
        let worker = self.idle.lock().pop();
        match worker {
            Some(worker) => {
                self.idle_count.fetch_sub(1, Ordering::SeqCst);
                // The worker might have exited concurrently with us
                // popping it (a racing shutdown); fall back to spawning a
                // fresh one if the handoff fails.
                if worker.tx.try_send(job).is_ok() {
                    return true;
                }
                self.spawn_worker(job);
                true
            }
            None => {
                self.spawn_worker(job);
                true
            }
        }
    }

    fn spawn_worker(&self, first_job: Job) {
        let (tx, mut rx) = mpsc::channel::<Job>(1);
        let idle = Arc::clone(&self.idle);
        let idle_count = Arc::clone(&self.idle_count);
        let shutdown = Arc::clone(&self.shutdown);
        let max_idle = self.max_idle;

        tokio::spawn(async move {
            let mut job = first_job;
            loop {
                if let Err(e) = tokio::task::spawn_blocking(job).await {
                    log::warn!("thread pool worker panicked: {e}");
                }

                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if idle_count.load(Ordering::SeqCst) >= max_idle {
                    return;
                }
                idle_count.fetch_add(1, Ordering::SeqCst);
                idle.lock().push(Worker { tx: tx.clone() });

                match rx.recv().await {
                    Some(next) => job = next,
                    None => return,
                }
            }
        });
    }

    /// Shuts the pool down: refuses further `run()` calls. Idle workers
    /// exit the next time they'd otherwise re-park (no explicit wakeup is
    /// needed since they only block on their own channel, which simply
    /// never receives more work).
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Runs a blocking closure and awaits its result — the common case of
    /// "dispatch one unit of blocking work and wait for it", layered over
    /// `run()`.
    pub async fn run_and_wait<T: Send + 'static>(&self, job: impl FnOnce() -> T + Send + 'static) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        let accepted = self.run(move || {
            let _ = tx.send(job());
        });
        if !accepted {
            return None;
        }
        rx.await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn run_and_wait_returns_the_closures_value() {
        let pool = ThreadPool::new(2);
        let result = pool.run_and_wait(|| 1 + 1).await;
        assert_eq!(result, Some(2));
    }

    #[tokio::test]
    async fn worker_is_reused_after_completing_a_job() {
        let pool = ThreadPool::new(1);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            pool.run_and_wait(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn shutdown_refuses_further_runs() {
        let pool = ThreadPool::new(1);
        pool.shutdown();
        assert!(!pool.run(|| {}));
    }
}
