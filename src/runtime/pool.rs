//! Bounded worker-thread pool.
//!
//! Jobs go through a `sync_channel` whose capacity is the queue depth, so a
//! saturated pool rejects submissions instead of growing without bound.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Unit of work run on a pool thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Why a job was not accepted. The job is handed back for retry.
pub enum SubmitError {
    Full(Job),
    Closed(Job),
}

impl std::fmt::Debug for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::Full(_) => write!(f, "SubmitError::Full"),
            SubmitError::Closed(_) => write!(f, "SubmitError::Closed"),
        }
    }
}

/// Fixed set of named threads draining a bounded queue.
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<SyncSender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Jobs queued or running.
    in_flight: Arc<AtomicUsize>,
    capacity: usize,
}

impl WorkerPool {
    /// Spawn `workers` threads named `{name}-{id}`.
    pub fn new(name: &str, workers: usize, queue_depth: usize) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::sync_channel::<Job>(queue_depth);
        let receiver = Arc::new(Mutex::new(receiver));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let receiver = Arc::clone(&receiver);
            let in_flight = Arc::clone(&in_flight);
            let handle = thread::Builder::new()
                .name(format!("{name}-{worker_id}"))
                .spawn(move || worker_loop(worker_id, receiver, in_flight))?;
            handles.push(handle);
        }

        Ok(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
            in_flight,
            capacity: workers + queue_depth,
        })
    }

    /// Queue a job without blocking.
    pub fn try_submit(&self, job: Job) -> Result<(), SubmitError> {
        let guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = guard.as_ref() else {
            return Err(SubmitError::Closed(job));
        };
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                Err(SubmitError::Full(job))
            }
            Err(TrySendError::Disconnected(job)) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                Err(SubmitError::Closed(job))
            }
        }
    }

    /// Convenience wrapper over [`try_submit`](Self::try_submit).
    pub fn execute<F>(&self, f: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.try_submit(Box::new(f))
    }

    /// Jobs queued or running right now.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// True once most worker and queue slots are taken.
    pub fn under_pressure(&self) -> bool {
        self.in_flight() * 10 >= self.capacity * 9
    }

    /// Stop accepting jobs and wait up to `timeout` for workers to finish.
    ///
    /// Workers still busy after the deadline are detached.
    pub fn shutdown(&self, timeout: Duration) {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();

        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        let deadline = Instant::now() + timeout;
        let mut pending = handles;
        while !pending.is_empty() && Instant::now() < deadline {
            let (done, busy): (Vec<_>, Vec<_>) = pending.into_iter().partition(|h| h.is_finished());
            for handle in done {
                let _ = handle.join();
            }
            pending = busy;
            if !pending.is_empty() {
                thread::sleep(Duration::from_millis(10));
            }
        }
        if !pending.is_empty() {
            warn!(
                pool = %self.name,
                busy = pending.len(),
                "Workers still busy at shutdown deadline, detaching"
            );
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

fn worker_loop(worker_id: usize, receiver: Arc<Mutex<Receiver<Job>>>, in_flight: Arc<AtomicUsize>) {
    debug!(worker = worker_id, "Worker started");
    loop {
        let job = {
            let receiver = receiver.lock().unwrap_or_else(|e| e.into_inner());
            receiver.recv()
        };
        let Ok(job) = job else {
            break;
        };
        if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
            error!(
                worker = worker_id,
                panic = %panic_message(panic.as_ref()),
                "Worker job panicked"
            );
        }
        in_flight.fetch_sub(1, Ordering::AcqRel);
    }
    debug!(worker = worker_id, "Worker stopped");
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
