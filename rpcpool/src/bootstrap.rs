// Copyright 2020 Joyent, Inc.

//! Bounded worker pool that runs connect attempts off the caller's thread.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use slog::{debug, trace, warn, Logger};

// Default number of bootstrap worker threads
pub const DEFAULT_BOOTSTRAP_WORKERS: usize = 16;
// Default capacity of the bootstrap task queue
pub const DEFAULT_BOOTSTRAP_QUEUE_CAPACITY: usize = 1024;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The reason a task could not be queued.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Rejection {
    /// The task queue is at capacity.
    Saturated,
    /// The pool has been shut down.
    ShutDown,
}

impl fmt::Display for Rejection {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Rejection::Saturated => String::from("queue saturated").fmt(fmt),
            Rejection::ShutDown => String::from("pool shut down").fmt(fmt),
        }
    }
}

/// A fixed set of worker threads draining a bounded task queue. Submitting to
/// a full queue fails immediately rather than blocking the submitter.
pub struct AsyncBootstrap {
    task_tx: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    log: Logger,
}

impl fmt::Debug for AsyncBootstrap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AsyncBootstrap")
            .field("stop", &self.stop)
            .finish()
    }
}

impl AsyncBootstrap {
    pub fn new(
        worker_count: usize,
        queue_capacity: usize,
        log: Logger,
    ) -> Result<Self, std::io::Error> {
        let (task_tx, task_rx) = bounded::<Task>(queue_capacity);
        let stop = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count.max(1) {
            let task_rx = task_rx.clone();
            let stop = stop.clone();
            let worker_log = log.clone();
            let worker = thread::Builder::new()
                .name(format!("bootstrap-{}", id))
                .spawn(move || worker_loop(id, task_rx, stop, worker_log))?;
            workers.push(worker);
        }

        debug!(
            log,
            "started {} bootstrap workers, queue capacity {}",
            workers.len(),
            queue_capacity
        );

        Ok(AsyncBootstrap {
            task_tx: Mutex::new(Some(task_tx)),
            workers: Mutex::new(workers),
            stop,
            log,
        })
    }

    fn task_tx_lock(&self) -> MutexGuard<Option<Sender<Task>>> {
        self.task_tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `task` for execution on a worker thread.
    pub fn submit(&self, task: Task) -> Result<(), Rejection> {
        match self.task_tx_lock().as_ref() {
            Some(task_tx) => task_tx.try_send(task).map_err(|e| match e {
                TrySendError::Full(_) => Rejection::Saturated,
                TrySendError::Disconnected(_) => Rejection::ShutDown,
            }),
            None => Err(Rejection::ShutDown),
        }
    }

    /// Stop accepting tasks, discard queued tasks that have not started, and
    /// wait for running tasks to finish. Calling this more than once is
    /// harmless.
    pub fn shutdown(&self) {
        self.stop.store(true, AtomicOrdering::SeqCst);
        // Dropping the only sender lets the workers drain and exit
        drop(self.task_tx_lock().take());

        let workers: Vec<thread::JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                // A task is tearing down its own pool
                continue;
            }
            if worker.join().is_err() {
                warn!(self.log, "bootstrap worker exited with a panic");
            }
        }
        trace!(self.log, "bootstrap workers joined");
    }
}

fn worker_loop(
    id: usize,
    task_rx: Receiver<Task>,
    stop: Arc<AtomicBool>,
    log: Logger,
) {
    for task in task_rx.iter() {
        if stop.load(AtomicOrdering::SeqCst) {
            trace!(log, "bootstrap-{} discarding queued task", id);
            continue;
        }
        task();
    }
    trace!(log, "bootstrap-{} exiting", id);
}
