//! Background write coordination.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};

use crate::resource::Resource;
use crate::CacheManager;

/// A queued background write.
#[derive(Debug)]
pub(crate) enum WriteJob {
    /// Store a resource under every listed key.
    Store {
        /// Resource to persist.
        resource: Resource,
        /// Primary key, plus the secondary Vary key when one applies.
        keys: Vec<String>,
    },
    /// Replace the headers of an existing entry.
    Freshen {
        /// Carrier of the merged headers.
        resource: Resource,
        /// Key of the entry to update.
        key: String,
    },
    /// Remove entries.
    Invalidate {
        /// Keys to delete.
        keys: Vec<String>,
    },
}

#[derive(Debug, Default)]
struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

// Releases one pending slot when a job finishes, on every exit path.
struct PendingGuard(Arc<Pending>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Bounded pool of background cache writers.
///
/// Stores, freshens and invalidations are queued here so client latency is
/// never charged for storage I/O. The queue bounds memory during burst
/// traffic; [`drain`](WritePool::drain) blocks until the queue is empty and
/// every worker is idle, so no write is lost at shutdown. Failures are
/// logged and never surfaced to clients.
#[derive(Debug, Clone)]
pub struct WritePool {
    jobs: mpsc::Sender<WriteJob>,
    pending: Arc<Pending>,
}

impl WritePool {
    pub(crate) fn new<M: CacheManager>(manager: Arc<M>, workers: usize, depth: usize) -> Self {
        let (jobs, receiver) = mpsc::channel(depth.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let pending = Arc::new(Pending::default());
        for _ in 0..workers.max(1) {
            tokio::spawn(run_worker(manager.clone(), receiver.clone(), pending.clone()));
        }
        Self { jobs, pending }
    }

    /// Queues a job. The pending count covers both queued and in-flight
    /// jobs, from before the send until the worker finishes.
    pub(crate) async fn submit(&self, job: WriteJob) {
        self.pending.count.fetch_add(1, Ordering::AcqRel);
        if let Err(err) = self.jobs.send(job).await {
            drop(PendingGuard(self.pending.clone()));
            log::warn!("cache write dropped, worker pool is gone: {err}");
        }
    }

    /// Waits until every queued write has completed.
    pub async fn drain(&self) {
        loop {
            let idle = self.pending.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.pending.count.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }
}

async fn run_worker<M: CacheManager>(
    manager: Arc<M>,
    jobs: Arc<Mutex<mpsc::Receiver<WriteJob>>>,
    pending: Arc<Pending>,
) {
    loop {
        let job = { jobs.lock().await.recv().await };
        let Some(job) = job else {
            break;
        };
        let _done = PendingGuard(pending.clone());
        match job {
            WriteJob::Store { resource, keys } => {
                if let Err(err) = manager.store(resource, &keys).await {
                    log::warn!("background store failed: {err}");
                }
            }
            WriteJob::Freshen { resource, key } => {
                if let Err(err) = manager.freshen(resource, &key).await {
                    log::warn!("background freshen failed for {key}: {err}");
                }
            }
            WriteJob::Invalidate { keys } => {
                for key in keys {
                    if let Err(err) = manager.delete(&key).await {
                        log::warn!("background invalidation failed for {key}: {err}");
                    }
                }
            }
        }
    }
}
