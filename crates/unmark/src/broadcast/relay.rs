//! Progress relay from execution threads to the job store.
//!
//! Transforms run on worker threads and report progress through a
//! [`ProgressReporter`]. Reporting only enqueues a message; a single
//! consumer thread applies the updates to the store in arrival order and
//! republishes them on the broadcaster. Updates for a job that already
//! reached a terminal state are rejected by the store and dropped.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, warn};

use super::JobProgressBroadcaster;
use crate::error::WorkerError;
use crate::job::{JobId, JobUpdate};
use crate::store::JobStore;

enum RelayMessage {
    Progress { job_id: JobId, percent: u8 },
    Flush(Sender<()>),
    Shutdown,
}

/// Owns the consumer thread that applies progress updates.
pub struct ProgressRelay {
    sender: Sender<RelayMessage>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl ProgressRelay {
    pub fn spawn(
        store: Arc<dyn JobStore>,
        broadcaster: JobProgressBroadcaster,
    ) -> Result<Self, WorkerError> {
        let (sender, receiver) = unbounded();
        let handle = thread::Builder::new()
            .name("progress-relay".to_string())
            .spawn(move || run_consumer(receiver, store, broadcaster))
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;

        Ok(Self {
            sender,
            consumer: Mutex::new(Some(handle)),
        })
    }

    /// Returns a reporter bound to one job.
    pub fn reporter(&self, job_id: JobId) -> ProgressReporter {
        ProgressReporter {
            job_id,
            sender: self.sender.clone(),
            last: Arc::new(AtomicU8::new(0)),
        }
    }

    /// Blocks until every update enqueued before this call has been applied.
    pub fn flush(&self) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        if self.sender.send(RelayMessage::Flush(tx)).is_ok() {
            let _ = rx.recv();
        }
    }

    /// Applies outstanding updates and stops the consumer thread. Idempotent.
    pub fn shutdown(&self) {
        let handle = match self.consumer.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = self.sender.send(RelayMessage::Shutdown);
            if handle.join().is_err() {
                error!("Progress relay thread panicked");
            }
        }
    }
}

impl Drop for ProgressRelay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_consumer(
    receiver: Receiver<RelayMessage>,
    store: Arc<dyn JobStore>,
    broadcaster: JobProgressBroadcaster,
) {
    debug!("Progress relay started");

    while let Ok(message) = receiver.recv() {
        match message {
            RelayMessage::Progress { job_id, percent } => {
                match store.update(&job_id, &JobUpdate::progress(percent)) {
                    Ok(job) => broadcaster.publish(&job, "Processing"),
                    Err(e) if e.is_rejection() => {
                        debug!(job_id = %job_id, percent, "Dropped progress update: {}", e);
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, percent, "Failed to persist progress: {}", e);
                    }
                }
            }
            RelayMessage::Flush(ack) => {
                let _ = ack.send(());
            }
            RelayMessage::Shutdown => break,
        }
    }

    debug!("Progress relay stopped");
}

/// Cloneable handle a transform uses to report progress for one job.
///
/// Values lower than or equal to the last one reported are dropped here,
/// so the store only ever sees increasing percentages from this reporter.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: JobId,
    sender: Sender<RelayMessage>,
    last: Arc<AtomicU8>,
}

impl ProgressReporter {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Enqueues a percent update. Never blocks on the store.
    pub fn report(&self, percent: u8) {
        let percent = percent.min(100);
        let previous = self.last.fetch_max(percent, Ordering::AcqRel);
        if percent <= previous {
            return;
        }
        // The relay is gone after shutdown; late updates are meaningless then.
        let _ = self.sender.send(RelayMessage::Progress {
            job_id: self.job_id.clone(),
            percent,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::job::{JobStatus, NewJob};
    use crate::store::MemoryJobStore;

    fn processing_store() -> (Arc<MemoryJobStore>, JobId) {
        let store = Arc::new(MemoryJobStore::new());
        let job = store.create(NewJob::default()).unwrap();
        store
            .update(&job.id, &JobUpdate::queued(Path::new("/in/a.mp4")))
            .unwrap();
        (store, job.id)
    }

    #[test]
    fn test_updates_applied_in_order() {
        let (store, id) = processing_store();
        let broadcaster = JobProgressBroadcaster::new(64);
        let mut rx = broadcaster.subscribe();
        let relay = ProgressRelay::spawn(store.clone(), broadcaster).unwrap();

        let reporter = relay.reporter(id.clone());
        for p in [10, 20, 20, 15, 60] {
            reporter.report(p);
        }
        relay.flush();

        assert_eq!(store.get(&id).unwrap().unwrap().percent, 60);
        let seen: Vec<u8> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.percent)
            .collect();
        assert_eq!(seen, vec![10, 20, 60]);
        relay.shutdown();
    }

    #[test]
    fn test_progress_after_terminal_is_dropped() {
        let (store, id) = processing_store();
        let relay = ProgressRelay::spawn(store.clone(), JobProgressBroadcaster::default()).unwrap();

        store
            .update(&id, &JobUpdate::cancelled(chrono::Utc::now()))
            .unwrap();
        relay.reporter(id.clone()).report(80);
        relay.flush();

        let job = store.get(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.percent, 0);
    }

    #[test]
    fn test_shutdown_is_idempotent_and_reporting_after_is_silent() {
        let (store, id) = processing_store();
        let relay = ProgressRelay::spawn(store, JobProgressBroadcaster::default()).unwrap();
        let reporter = relay.reporter(id);
        relay.shutdown();
        relay.shutdown();
        reporter.report(50);
        relay.flush();
    }
}
