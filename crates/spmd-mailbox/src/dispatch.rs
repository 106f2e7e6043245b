//! Bounded worker pool
//!
//! Monitors hand request handlers and completion callbacks to a fixed set of
//! worker threads so a slow backend call never stalls the poll loop. The
//! queue is bounded: a full queue rejects work instead of growing.

use crossbeam_channel::{Sender, TrySendError, bounded};
use parking_lot::{Condvar, Mutex};
use spmd_common::{Error, Result};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

/// Fixed-size thread pool over a bounded channel
pub struct DispatchPool {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<Pending>,
}

impl DispatchPool {
    /// Start `workers` threads sharing a queue of `queue_depth` jobs
    pub fn new(name: &str, workers: usize, queue_depth: usize) -> Result<Self> {
        let (sender, receiver) = bounded::<Job>(queue_depth.max(1));
        let pending = Arc::new(Pending::default());

        let mut handles = Vec::with_capacity(workers.max(1));
        for index in 0..workers.max(1) {
            let receiver = receiver.clone();
            let pending = Arc::clone(&pending);
            let thread_name = format!("{name}-{index}");
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    for job in &receiver {
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!("{} job panicked", thread_name);
                        }
                        pending.done();
                    }
                    debug!("{} exiting", thread_name);
                })?;
            handles.push(handle);
        }

        Ok(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            pending,
        })
    }

    /// Queue `job`, failing immediately if the queue is full or shut down
    pub fn try_submit(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(Error::MailboxNotRunning);
        };
        self.pending.add();
        match sender.try_send(Box::new(job)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.pending.done();
                Err(Error::internal(format!("{} queue is full", self.name)))
            }
            Err(TrySendError::Disconnected(_)) => {
                self.pending.done();
                Err(Error::MailboxNotRunning)
            }
        }
    }

    /// Block until every queued job has finished
    pub fn wait_idle(&self) {
        let mut count = self.pending.count.lock();
        while *count > 0 {
            self.pending.idle.wait(&mut count);
        }
    }

    /// Stop accepting work, drain the queue and join the workers
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("{} worker panicked", self.name);
            }
        }
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_runs_jobs() {
        let pool = DispatchPool::new("test", 3, 16).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.try_submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.wait_idle();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_full_queue_rejects() {
        let pool = DispatchPool::new("test", 1, 1).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        pool.try_submit(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        })
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Worker busy, one slot in the queue
        pool.try_submit(|| {}).unwrap();
        assert!(matches!(pool.try_submit(|| {}), Err(Error::Internal(_))));

        release_tx.send(()).unwrap();
        pool.wait_idle();
    }

    #[test]
    fn test_panicking_job_keeps_worker() {
        let pool = DispatchPool::new("test", 1, 4).unwrap();
        pool.try_submit(|| panic!("boom")).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.try_submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        pool.wait_idle();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_submit_after_shutdown() {
        let pool = DispatchPool::new("test", 2, 4).unwrap();
        pool.shutdown();
        assert!(matches!(pool.try_submit(|| {}), Err(Error::MailboxNotRunning)));
    }
}
