//! Bounded background executors for resource creation, closing and aborts

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;

pub(crate) type Task = Box<dyn FnOnce() + Send>;

/// What to do with a task when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Saturation {
    /// Drop the oldest queued task and enqueue the new one
    DiscardOldest,
    /// Run the task on the submitting thread
    CallerRuns,
}

/// A fixed set of worker threads fed from a bounded queue.
pub(crate) struct BoundedExecutor {
    name: String,
    sender: Mutex<Option<Sender<Task>>>,
    // Kept to drop the oldest task under `DiscardOldest`.
    receiver: Receiver<Task>,
    saturation: Saturation,
    // Disconnects once every worker has exited.
    terminated: Receiver<()>,
}

impl BoundedExecutor {
    pub fn start(
        name: &str,
        workers: usize,
        capacity: usize,
        saturation: Saturation,
    ) -> std::io::Result<Self> {
        let (sender, receiver) = channel::bounded::<Task>(capacity.max(1));
        let (done_tx, terminated) = channel::bounded::<()>(0);

        for index in 0..workers.max(1) {
            let tasks = receiver.clone();
            let done = done_tx.clone();
            thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || {
                    for task in tasks.iter() {
                        if catch_unwind(AssertUnwindSafe(task)).is_err() {
                            tracing::error!(executor = %thread::current().name().unwrap_or_default(),
                                "background task panicked");
                        }
                    }
                    drop(done);
                })?;
        }

        Ok(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            receiver,
            saturation,
            terminated,
        })
    }

    /// Submit a task. Once the executor has been shut down the task is
    /// handed back unrun.
    pub fn execute<F>(&self, task: F) -> Result<(), Task>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut task: Task = Box::new(task);
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(task);
        };

        loop {
            match sender.try_send(task) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Disconnected(rejected)) => return Err(rejected),
                Err(TrySendError::Full(rejected)) => match self.saturation {
                    Saturation::DiscardOldest => {
                        if self.receiver.try_recv().is_ok() {
                            tracing::debug!(executor = %self.name, "queue full, discarded oldest task");
                        }
                        task = rejected;
                    }
                    Saturation::CallerRuns => {
                        drop(guard);
                        rejected();
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Number of tasks queued but not yet picked up by a worker.
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }

    /// Stop accepting tasks. Queued tasks still run.
    pub fn shutdown(&self) {
        self.sender.lock().take();
    }

    /// Stop accepting tasks and drop everything still queued.
    pub fn shutdown_now(&self) {
        self.shutdown();
        while self.receiver.try_recv().is_ok() {}
    }

    /// Wait up to `timeout` for the workers to finish. Returns `true` if
    /// they all exited.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.terminated.recv_timeout(remaining) {
                Ok(()) => continue,
                Err(RecvTimeoutError::Disconnected) => return true,
                Err(RecvTimeoutError::Timeout) => return false,
            }
        }
    }
}

impl Drop for BoundedExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
