//! Background job plumbing for thumbnail generation.
//!
//! The mipmap cache's prefetch mode does not touch pixels itself; it hands
//! a [`PrefetchJob`] to a [`JobScheduler`] and returns. The application
//! runs worker threads that drain the queue and perform blocking reads,
//! which in turn run the materializers. `revive` lets a repeated request
//! jump an already queued job to the front instead of queueing a
//! duplicate.
//!
//! Completion events fan out over a crossbeam channel so views can learn
//! that a thumbnail landed without polling the cache.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;

// Minimal counters, inspectable in tests or logged periodically.
pub static JOBS_ENQUEUED: AtomicU64 = AtomicU64::new(0);
pub static JOBS_REVIVED: AtomicU64 = AtomicU64::new(0);
pub static JOBS_COMPLETED: AtomicU64 = AtomicU64::new(0);

/// A request to materialize one (image, tier) thumbnail in the background.
/// The tier is carried as its raw 3-bit index so this crate stays below
/// the mipmap layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrefetchJob {
    pub image_id: i32,
    pub tier: u8,
}

/// The scheduler seam the mipmap cache talks to.
pub trait JobScheduler: Send + Sync {
    /// Queue `job` unless an identical one is already pending.
    fn enqueue(&self, job: PrefetchJob);

    /// Move an already pending `job` to the front of the queue. Returns
    /// false when the job is not pending (the caller then enqueues).
    fn revive(&self, job: &PrefetchJob) -> bool;
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<PrefetchJob>,
    closed: bool,
}

/// FIFO scheduler with revive-to-front and completion notifications.
pub struct QueueScheduler {
    state: Mutex<QueueState>,
    cond: Condvar,
    done_tx: Sender<PrefetchJob>,
    done_rx: Receiver<PrefetchJob>,
}

impl Default for QueueScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueScheduler {
    pub fn new() -> Self {
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        QueueScheduler {
            state: Mutex::new(QueueState::default()),
            cond: Condvar::new(),
            done_tx,
            done_rx,
        }
    }

    /// A receiver of completed jobs. Receivers share one stream: every
    /// completion is consumed by exactly one of them.
    pub fn completions(&self) -> Receiver<PrefetchJob> {
        self.done_rx.clone()
    }

    /// Blocking pop; `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<PrefetchJob> {
        let mut state = self.state.lock();
        loop {
            if let Some(job) = state.queue.pop_front() {
                return Some(job);
            }
            if state.closed {
                return None;
            }
            self.cond.wait(&mut state);
        }
    }

    pub fn try_pop(&self) -> Option<PrefetchJob> {
        self.state.lock().queue.pop_front()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Wake all workers to drain and exit.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.cond.notify_all();
    }

    /// Report a finished job to completion listeners.
    pub fn mark_done(&self, job: PrefetchJob) {
        JOBS_COMPLETED.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        // A send can only fail if every receiver is gone, which just means
        // nobody is watching.
        let _ = self.done_tx.send(job);
    }
}

impl JobScheduler for QueueScheduler {
    fn enqueue(&self, job: PrefetchJob) {
        let mut state = self.state.lock();
        if state.closed {
            tracing::debug!(target: "jobs", image = job.image_id, tier = job.tier, "queue closed, job dropped");
            return;
        }
        if state.queue.contains(&job) {
            return;
        }
        JOBS_ENQUEUED.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        state.queue.push_back(job);
        self.cond.notify_one();
    }

    fn revive(&self, job: &PrefetchJob) -> bool {
        let mut state = self.state.lock();
        match state.queue.iter().position(|j| j == job) {
            Some(pos) => {
                JOBS_REVIVED.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let job = state.queue.remove(pos).unwrap_or(*job);
                state.queue.push_front(job);
                true
            }
            None => false,
        }
    }
}

/// Drain loop for a worker thread: pop, run, report, until closed.
pub fn run_worker(scheduler: &QueueScheduler, mut run: impl FnMut(PrefetchJob)) {
    while let Some(job) = scheduler.pop() {
        run(job);
        scheduler.mark_done(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn job(id: i32, tier: u8) -> PrefetchJob {
        PrefetchJob {
            image_id: id,
            tier,
        }
    }

    #[test]
    fn enqueue_is_fifo_and_deduplicates() {
        let q = QueueScheduler::new();
        q.enqueue(job(1, 3));
        q.enqueue(job(2, 3));
        q.enqueue(job(1, 3)); // duplicate, dropped
        assert_eq!(q.pending(), 2);
        assert_eq!(q.try_pop(), Some(job(1, 3)));
        assert_eq!(q.try_pop(), Some(job(2, 3)));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn revive_moves_a_pending_job_to_the_front() {
        let q = QueueScheduler::new();
        q.enqueue(job(1, 3));
        q.enqueue(job(2, 3));
        q.enqueue(job(3, 3));
        assert!(q.revive(&job(3, 3)));
        assert_eq!(q.try_pop(), Some(job(3, 3)));
    }

    #[test]
    fn revive_of_an_absent_job_reports_false() {
        let q = QueueScheduler::new();
        assert!(!q.revive(&job(9, 2)));
        // The caller's follow-up enqueue goes through.
        q.enqueue(job(9, 2));
        assert_eq!(q.pending(), 1);
    }

    #[test]
    fn workers_drain_and_report_completions() {
        let q = Arc::new(QueueScheduler::new());
        let done = q.completions();
        for id in 1..=4 {
            q.enqueue(job(id, 1));
        }
        let worker = {
            let q = Arc::clone(&q);
            thread::spawn(move || run_worker(&q, |_| {}))
        };
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(done.recv().unwrap().image_id);
        }
        q.close();
        worker.join().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3, 4]);
    }

    #[test]
    fn close_unblocks_an_idle_worker() {
        let q = Arc::new(QueueScheduler::new());
        let worker = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop())
        };
        thread::sleep(std::time::Duration::from_millis(30));
        q.close();
        assert_eq!(worker.join().unwrap(), None);
    }
}
