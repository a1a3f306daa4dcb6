//! Worker thread lifecycle
//!
//! Workers run on native OS threads released together through a barrier, so
//! paced senders start their tick clocks at the same instant. Shutdown is
//! cooperative: the supervisor raises a per-worker flag, the worker finishes
//! its current tick and acknowledges on the way out.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// How long to wait for workers to acknowledge a shutdown request before
/// detaching them
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Shared shutdown handshake between the supervisor and one worker
#[derive(Debug, Default)]
pub struct WorkerControl {
    shutdown: AtomicBool,
    shutdown_ack: AtomicBool,
}

impl WorkerControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Called by the worker as it leaves its loop, whether asked to stop or
    /// stopping on its own
    pub fn acknowledge_shutdown(&self) {
        self.shutdown_ack.store(true, Ordering::Release);
    }

    pub fn shutdown_acknowledged(&self) -> bool {
        self.shutdown_ack.load(Ordering::Acquire)
    }
}

struct WorkerHandle {
    name: String,
    control: Arc<WorkerControl>,
    handle: thread::JoinHandle<Result<()>>,
}

/// Spawns worker threads and joins them after a cooperative shutdown
pub struct ThreadSupervisor {
    workers: Vec<WorkerHandle>,
}

impl ThreadSupervisor {
    /// Spawn `count` named worker threads. Each runs `body(index, control)`
    /// after every thread has reached the start barrier, and acknowledges its
    /// control on the way out.
    pub fn spawn<F>(count: usize, body: F) -> Result<Self>
    where
        F: Fn(usize, Arc<WorkerControl>) -> Result<()> + Send + Clone + 'static,
    {
        let barrier = Arc::new(Barrier::new(count));
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let body = body.clone();
            let barrier = Arc::clone(&barrier);
            let control = Arc::new(WorkerControl::new());
            let thread_control = Arc::clone(&control);
            let name = format!("worker-{index}");
            let handle = thread::Builder::new().name(name.clone()).spawn(move || {
                barrier.wait();
                let result = body(index, Arc::clone(&thread_control));
                thread_control.acknowledge_shutdown();
                result
            })?;
            workers.push(WorkerHandle { name, control, handle });
        }
        Ok(Self { workers })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn controls(&self) -> Vec<Arc<WorkerControl>> {
        self.workers.iter().map(|w| Arc::clone(&w.control)).collect()
    }

    /// True once every worker has acknowledged, whether it was asked to stop
    /// or stopped on its own
    pub fn all_stopped(&self) -> bool {
        self.workers.iter().all(|w| w.control.shutdown_acknowledged())
    }

    /// Request shutdown everywhere, wait out the grace period, then join.
    /// Workers that never acknowledge are detached rather than joined, so a
    /// stuck worker cannot hang the supervisor. Returns the first worker
    /// error, if any.
    pub fn shutdown(self) -> Result<()> {
        for worker in &self.workers {
            worker.control.request_shutdown();
        }
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while Instant::now() < deadline && !self.all_stopped() {
            thread::sleep(Duration::from_millis(100));
        }

        let mut first_error = None;
        for worker in self.workers {
            if !worker.control.shutdown_acknowledged() {
                warn!(worker = %worker.name, "no shutdown acknowledgement, detaching");
                continue;
            }
            match worker.handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(worker = %worker.name, error = %e, "worker failed");
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    error!(worker = %worker.name, "worker panicked");
                    first_error
                        .get_or_insert_with(|| Error::Other(format!("{} panicked", worker.name)));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workers_stop_on_request() {
        let supervisor = ThreadSupervisor::spawn(3, |_, control| {
            while !control.shutdown_requested() {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(supervisor.worker_count(), 3);
        assert!(!supervisor.all_stopped());
        supervisor.shutdown().unwrap();
    }

    #[test]
    fn test_worker_error_surfaces_after_join() {
        let supervisor = ThreadSupervisor::spawn(2, |index, _| {
            if index == 1 {
                Err(Error::Other("boom".into()))
            } else {
                Ok(())
            }
        })
        .unwrap();

        let err = supervisor.shutdown().unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_early_finishers_acknowledge() {
        let supervisor = ThreadSupervisor::spawn(2, |_, _| Ok(())).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !supervisor.all_stopped() {
            assert!(Instant::now() < deadline, "workers never acknowledged");
            thread::sleep(Duration::from_millis(5));
        }
        supervisor.shutdown().unwrap();
    }

    #[test]
    fn test_controls_are_per_worker() {
        let supervisor = ThreadSupervisor::spawn(2, |index, control| {
            while !control.shutdown_requested() {
                thread::sleep(Duration::from_millis(5));
            }
            // Only worker 0 exits cleanly in this scenario
            if index == 0 {
                Ok(())
            } else {
                Err(Error::Other("asked to fail".into()))
            }
        })
        .unwrap();

        let controls = supervisor.controls();
        assert_eq!(controls.len(), 2);
        controls[0].request_shutdown();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !controls[0].shutdown_acknowledged() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!controls[1].shutdown_acknowledged());
        assert!(supervisor.shutdown().is_err());
    }
}
