//! Ingestion scheduler.
//!
//! A bounded work queue drained by a fixed worker pool. Submission blocks
//! when the queue is full, which is the backpressure contract: a producer
//! can never outrun persistence by more than the queue capacity. `close`
//! lets the workers drain the queue, then joins them.

use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded};
use log::debug;

use crate::error::{Result, VulcanoError};
use crate::telemetry::{GAUGE_INSERT_QUEUE, Telemetry};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Completion handle for a pool-scheduled task.
#[derive(Debug)]
pub struct Completion<T> {
    receiver: Receiver<T>,
}

impl<T> Completion<T> {
    /// Block until the task finishes.
    pub fn wait(self) -> Result<T> {
        self.receiver
            .recv()
            .map_err(|_| VulcanoError::internal("task worker dropped before completing"))
    }

    /// Non-blocking poll.
    pub fn try_wait(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

/// Channel pair backing a [`Completion`].
pub fn completion<T>() -> (Sender<T>, Completion<T>) {
    let (sender, receiver) = bounded(1);
    (sender, Completion { receiver })
}

/// Aggregate result of one ingestion run.
#[derive(Debug, Clone, Default)]
pub struct IngestionResult {
    pub ingested: u64,
    pub total: u64,
    pub errors: Vec<String>,
}

/// Bounded queue plus worker pool.
pub struct IngestScheduler {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    telemetry: Telemetry,
}

impl IngestScheduler {
    /// Start `workers` threads over a queue of `capacity` jobs.
    pub fn new(workers: usize, capacity: usize, telemetry: Telemetry) -> Result<Self> {
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = bounded(capacity);
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let receiver = receiver.clone();
            let telemetry = telemetry.clone();
            let handle = std::thread::Builder::new()
                .name(format!("vulcano-ingest-{worker}"))
                .spawn(move || {
                    for job in receiver.iter() {
                        job();
                        telemetry.gauge(GAUGE_INSERT_QUEUE, receiver.len() as f64);
                    }
                    debug!("ingest worker {worker} drained");
                })?;
            handles.push(handle);
        }
        Ok(Self {
            sender: Some(sender),
            workers: handles,
            telemetry,
        })
    }

    /// Enqueue a job, blocking while the queue is full.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or(VulcanoError::Closed)?;
        sender
            .send(Box::new(job))
            .map_err(|_| VulcanoError::Closed)?;
        self.telemetry
            .gauge(GAUGE_INSERT_QUEUE, sender.len() as f64);
        Ok(())
    }

    /// Jobs currently waiting in the queue.
    pub fn queue_depth(&self) -> usize {
        self.sender.as_ref().map(|s| s.len()).unwrap_or(0)
    }

    /// Drain the queue and join the workers.
    pub fn close(&mut self) {
        // Dropping the sender closes the channel; workers finish whatever
        // is queued, then exit their receive loop.
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for IngestScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for IngestScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestScheduler")
            .field("queue_depth", &self.queue_depth())
            .field("workers", &self.workers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_all_jobs_run() {
        let mut scheduler = IngestScheduler::new(2, 8, Telemetry::noop()).unwrap();
        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            scheduler
                .submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        scheduler.close();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_backpressure_blocks_and_recovers() {
        let mut scheduler = IngestScheduler::new(1, 2, Telemetry::noop()).unwrap();
        let counter = Arc::new(AtomicU64::new(0));
        // More jobs than capacity: submission must block, not fail.
        for _ in 0..50 {
            let counter = counter.clone();
            scheduler
                .submit(move || {
                    std::thread::sleep(std::time::Duration::from_micros(100));
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        scheduler.close();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_submit_after_close_fails() {
        let mut scheduler = IngestScheduler::new(1, 2, Telemetry::noop()).unwrap();
        scheduler.close();
        let result = scheduler.submit(|| {});
        assert!(matches!(result, Err(VulcanoError::Closed)));
    }

    #[test]
    fn test_completion_handle() {
        let mut scheduler = IngestScheduler::new(1, 2, Telemetry::noop()).unwrap();
        let (sender, handle) = completion();
        scheduler
            .submit(move || {
                let _ = sender.send(42u32);
            })
            .unwrap();
        assert_eq!(handle.wait().unwrap(), 42);
        scheduler.close();
    }
}
