//! Task Queue
//!
//! A fixed pool of worker threads fed through a crossbeam channel. Message
//! handlers run on the receive thread; anything slow is submitted here.

use crossbeam::channel::{self, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool for deferred work
pub struct TaskQueue {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
    pending: Arc<AtomicUsize>,
}

impl TaskQueue {
    /// Spawn `worker_count` workers (at least one)
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (sender, receiver) = channel::unbounded::<Task>();
        let pending = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let receiver = receiver.clone();
            let pending = Arc::clone(&pending);

            workers.push(std::thread::spawn(move || {
                while let Ok(task) = receiver.recv() {
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        tracing::error!("Queued task panicked");
                    }
                    pending.fetch_sub(1, Ordering::AcqRel);
                }
            }));
        }

        TaskQueue {
            sender: Some(sender),
            workers,
            pending,
        }
    }

    /// Queue `task`; false once the queue is shut down
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = match &self.sender {
            Some(s) => s,
            None => return false,
        };

        self.pending.fetch_add(1, Ordering::AcqRel);
        if sender.send(Box::new(task)).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Tasks queued or running
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Finish queued tasks and join the workers
    pub fn shutdown(&mut self) {
        self.sender.take();
        let current = std::thread::current().id();
        for worker in self.workers.drain(..) {
            // A task may drop the last handle to its own queue
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::error!("Task worker panicked");
            }
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
