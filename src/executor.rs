//! Fixed-size worker pools with bounded queues.
//!
//! Every background stage of the engine (flush coordination, per-directory
//! flush IO, post-flush bookkeeping, memtable reclaim, compaction) runs on
//! one of these. Submission never blocks: a full queue rejects the task and
//! the caller sees the error. The post-flush pool is a single worker, which
//! is what gives flush completion its strict submission ordering.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct Executor {
    name: &'static str,
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl Executor {
    /// Pool of `workers` threads draining a queue of depth `queue_depth`.
    pub fn new(name: &'static str, workers: usize, queue_depth: usize) -> Self {
        assert!(workers > 0, "executor needs at least one worker");
        let (tx, rx) = bounded::<Job>(queue_depth);
        let handles = (0..workers)
            .map(|i| {
                let rx: Receiver<Job> = rx.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || {
                        for job in rx.iter() {
                            job();
                        }
                    })
                    .expect("spawn executor worker")
            })
            .collect();
        Self {
            name,
            tx: Some(tx),
            workers: handles,
        }
    }

    /// Single-threaded executor: tasks complete strictly in submission order.
    pub fn single(name: &'static str, queue_depth: usize) -> Self {
        Self::new(name, 1, queue_depth)
    }

    /// Submits a task, returning a handle to its eventual result. A full
    /// queue rejects immediately.
    pub fn submit<T, F>(&self, f: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (done_tx, done_rx) = bounded(1);
        let job: Job = Box::new(move || {
            let _ = done_tx.send(f());
        });
        let tx = self
            .tx
            .as_ref()
            .expect("submit after shutdown");
        match tx.try_send(job) {
            Ok(()) => Ok(TaskHandle { rx: done_rx }),
            Err(TrySendError::Full(_)) => Err(Error::InvalidRequest(format!(
                "{} executor queue full",
                self.name
            ))),
            Err(TrySendError::Disconnected(_)) => Err(Error::InvalidRequest(format!(
                "{} executor shut down",
                self.name
            ))),
        }
    }

    /// Drains the queue and joins all workers.
    pub fn shutdown(mut self) {
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Receipt for a submitted task.
pub struct TaskHandle<T> {
    rx: Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task finishes, rethrowing its error.
    pub fn wait(self) -> Result<T> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(Error::FsRead("task worker vanished".to_string())))
    }

    /// Non-blocking probe; `None` while still running.
    pub fn try_wait(&self) -> Option<Result<T>> {
        self.rx.try_recv().ok()
    }
}

/// The engine's standing pools, one field per stage. Built once and shared
/// through the engine context.
pub struct Executors {
    /// Coordinates flush runnables (barrier wait + fan-out).
    pub flush: Arc<Executor>,
    /// One pool per data directory, for flush IO.
    pub per_disk: Vec<Arc<Executor>>,
    /// Single worker; post-flush tasks complete in submission order.
    pub post_flush: Arc<Executor>,
    /// Memtable reclaim behind read barriers.
    pub reclaim: Arc<Executor>,
    /// Compaction merges.
    pub compaction: Arc<Executor>,
}

impl Executors {
    pub fn new(data_dirs: usize, flush_writers: usize, compactors: usize, depth: usize) -> Self {
        Self {
            flush: Arc::new(Executor::new("flush", 2, depth)),
            per_disk: (0..data_dirs)
                .map(|_| Arc::new(Executor::new("flush-io", flush_writers, depth)))
                .collect(),
            post_flush: Arc::new(Executor::single("post-flush", depth)),
            reclaim: Arc::new(Executor::single("reclaim", depth)),
            compaction: Arc::new(Executor::new("compaction", compactors, depth)),
        }
    }
}
