//! Priority task queue shared by the worker pool.
//!
//! Entries are keyed by `(priority, arrival_sequence)` so the lowest
//! priority value is served first and equal priorities keep FIFO order.
//! Like a classic joinable queue, every dequeued job must be acknowledged
//! with [`TaskQueue::task_done`] (or a [`TaskGuard`]) before [`TaskQueue::join`]
//! returns.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::finalize::FileCleanup;
use crate::error::WorkerError;
use crate::job::JobId;

/// A job waiting for a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub id: JobId,
    pub input_path: PathBuf,
    pub priority: i32,
    /// Files a cancellation of this job may delete.
    pub cleanup: FileCleanup,
}

/// Outcome of a bounded wait on the queue.
#[derive(Debug)]
pub enum Dequeued {
    Job(QueuedJob),
    Empty,
    Closed,
}

#[derive(Default)]
struct QueueState {
    entries: BTreeMap<(i32, u64), QueuedJob>,
    next_seq: u64,
    unfinished: usize,
    closed: bool,
}

#[derive(Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    all_done: Condvar,
    len: AtomicUsize,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Every critical section leaves the state consistent, so a panic
        // elsewhere while holding the lock does not corrupt it.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, job: QueuedJob) -> Result<(), WorkerError> {
        let mut state = self.lock();
        if state.closed {
            return Err(WorkerError::QueueClosed);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert((job.priority, seq), job);
        state.unfinished += 1;
        self.len.store(state.entries.len(), Ordering::Relaxed);
        drop(state);

        self.available.notify_one();
        Ok(())
    }

    /// Blocks until a job is available. Returns `None` once the queue is closed.
    pub fn dequeue(&self) -> Option<QueuedJob> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(job) = self.pop_front(&mut state) {
                return Some(job);
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`dequeue`](Self::dequeue) but gives up after `timeout`.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Dequeued {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.closed {
                return Dequeued::Closed;
            }
            if let Some(job) = self.pop_front(&mut state) {
                return Dequeued::Job(job);
            }
            let now = Instant::now();
            if now >= deadline {
                return Dequeued::Empty;
            }
            state = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn pop_front(&self, state: &mut QueueState) -> Option<QueuedJob> {
        let job = state.entries.pop_first().map(|(_, job)| job);
        self.len.store(state.entries.len(), Ordering::Relaxed);
        job
    }

    /// Acknowledges one dequeued job.
    pub fn task_done(&self) {
        let mut state = self.lock();
        state.unfinished = state.unfinished.saturating_sub(1);
        if state.unfinished == 0 {
            self.all_done.notify_all();
        }
    }

    /// Removes a job that has not been dequeued yet. The removal counts as
    /// the job's acknowledgement.
    pub fn remove(&self, id: &JobId) -> Option<QueuedJob> {
        let mut state = self.lock();
        let key = state
            .entries
            .iter()
            .find(|(_, job)| &job.id == id)
            .map(|(key, _)| *key)?;
        let job = state.entries.remove(&key);
        state.unfinished = state.unfinished.saturating_sub(1);
        self.len.store(state.entries.len(), Ordering::Relaxed);
        if state.unfinished == 0 {
            self.all_done.notify_all();
        }
        job
    }

    /// Removes every job still waiting, in dispatch order. The removals count
    /// as acknowledgements.
    pub fn drain(&self) -> Vec<QueuedJob> {
        let mut state = self.lock();
        let jobs: Vec<QueuedJob> = std::mem::take(&mut state.entries).into_values().collect();
        state.unfinished = state.unfinished.saturating_sub(jobs.len());
        self.len.store(0, Ordering::Relaxed);
        if state.unfinished == 0 {
            self.all_done.notify_all();
        }
        jobs
    }

    /// Blocks until every enqueued job has been acknowledged.
    pub fn join(&self) {
        let mut state = self.lock();
        while state.unfinished > 0 {
            state = self
                .all_done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// [`join`](Self::join) with a limit. Returns false on timeout.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.unfinished > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .all_done
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Approximate number of waiting jobs. Not synchronized with concurrent
    /// enqueue/dequeue; use for observability only.
    pub fn size(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Rejects further enqueues and wakes all blocked consumers.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Calls [`TaskQueue::task_done`] when dropped, whichever way the job ends.
pub struct TaskGuard<'a> {
    queue: &'a TaskQueue,
}

impl<'a> TaskGuard<'a> {
    pub fn new(queue: &'a TaskQueue) -> Self {
        Self { queue }
    }
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        self.queue.task_done();
    }
}
