use crate::error::EventError;
use crossbeam_channel::{Sender, unbounded};
use log::{debug, error};
use parking_lot::Mutex;
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Running {
    sender: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

/// Fixed-size thread pool executing event work
///
/// Started for a recording and shut down with it; jobs already submitted
/// still run before [`shutdown`](Self::shutdown) returns.
pub struct WorkerPool {
    name: String,
    running: Mutex<Option<Running>>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running: Mutex::new(None),
        }
    }

    /// Spawn `size` workers; no-op when already running
    pub fn start(&self, size: usize) -> Result<(), EventError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }
        let (sender, receiver) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(size.max(1));
        for id in 0..size.max(1) {
            let receiver = receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", self.name, id))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    error!("{}: failed to spawn worker: {}", self.name, e);
                    break;
                }
            }
        }
        if workers.is_empty() {
            return Err(EventError::PoolClosed);
        }
        debug!("{}: started {} workers", self.name, workers.len());
        *running = Some(Running { sender, workers });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<(), EventError> {
        let running = self.running.lock();
        let running = running.as_ref().ok_or(EventError::PoolClosed)?;
        running
            .sender
            .send(Box::new(job))
            .map_err(|_| EventError::PoolClosed)
    }

    /// Close the job channel and join every worker
    pub fn shutdown(&self) {
        let Some(Running { sender, workers }) = self.running.lock().take() else {
            return;
        };
        drop(sender);
        for worker in workers {
            if worker.join().is_err() {
                error!("{}: worker panicked", self.name);
            }
        }
        debug!("{}: stopped", self.name);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_jobs_run_before_shutdown_returns() {
        let pool = WorkerPool::new("pool");
        pool.start(3).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let done = Arc::clone(&done);
            pool.submit(move || {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 20);
        assert!(!pool.is_running());
    }

    #[test]
    fn test_submit_after_shutdown_rejected() {
        let pool = WorkerPool::new("pool");
        assert!(matches!(pool.submit(|| {}), Err(EventError::PoolClosed)));
        pool.start(1).unwrap();
        pool.shutdown();
        assert!(matches!(pool.submit(|| {}), Err(EventError::PoolClosed)));
    }
}
