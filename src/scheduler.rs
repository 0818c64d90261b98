//! Single-thread timer scheduler for housekeeping and per-entry tasks

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Queue size above which cancelled jobs are purged eagerly.
const PURGE_THRESHOLD: usize = 64;

type Job = Arc<dyn Fn() + Send + Sync>;

struct TaskState {
    cancelled: AtomicBool,
}

/// Handle to a scheduled job. Dropping it does not cancel the job.
pub(crate) struct ScheduledTask {
    state: Arc<TaskState>,
    shared: Weak<Shared>,
}

impl ScheduledTask {
    fn detached() -> Self {
        Self {
            state: Arc::new(TaskState { cancelled: AtomicBool::new(true) }),
            shared: Weak::new(),
        }
    }

    /// Cancel the job. Returns `false` if it was already cancelled.
    ///
    /// A run already in progress is not interrupted; periodic jobs are not
    /// rescheduled after it.
    pub fn cancel(&self) -> bool {
        if self.state.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.note_cancelled();
        }
        true
    }

    #[cfg(test)]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }
}

struct Entry {
    deadline: Instant,
    seq: u64,
    period: Option<Duration>,
    state: Arc<TaskState>,
    job: Job,
}

impl Entry {
    fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

// Reversed so the max-heap yields the earliest deadline first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Queue {
    entries: BinaryHeap<Entry>,
    next_seq: u64,
    cancelled: usize,
    shutdown: bool,
}

impl Queue {
    fn push(&mut self, mut entry: Entry) {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(entry);
    }
}

struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
}

impl Shared {
    fn note_cancelled(&self) {
        let mut queue = self.queue.lock();
        queue.cancelled += 1;
        if queue.entries.len() > PURGE_THRESHOLD && queue.cancelled * 2 > queue.entries.len() {
            queue.entries.retain(|entry| !entry.is_cancelled());
            queue.cancelled = 0;
        }
    }
}

/// Runs delayed and periodic jobs on one dedicated thread.
pub(crate) struct Scheduler {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn start(name: String) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wakeup: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || run(&worker))?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Run `job` once after `delay`.
    pub fn schedule_once<F>(&self, delay: Duration, job: F) -> ScheduledTask
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.schedule(delay, None, Arc::new(job))
    }

    /// Run `job` after `initial_delay`, then `period` after each run finishes.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        initial_delay: Duration,
        period: Duration,
        job: F,
    ) -> ScheduledTask
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.schedule(initial_delay, Some(period), Arc::new(job))
    }

    fn schedule(&self, delay: Duration, period: Option<Duration>, job: Job) -> ScheduledTask {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return ScheduledTask::detached();
        }

        let state = Arc::new(TaskState { cancelled: AtomicBool::new(false) });
        queue.push(Entry {
            deadline: Instant::now() + delay,
            seq: 0,
            period,
            state: Arc::clone(&state),
            job,
        });
        self.shared.wakeup.notify_one();

        ScheduledTask {
            state,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Number of jobs waiting to run, including cancelled ones not yet purged.
    #[cfg(test)]
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().entries.len()
    }

    /// Drop all pending jobs and stop the worker thread.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
            queue.entries.clear();
            self.shared.wakeup.notify_all();
        }

        if let Some(handle) = self.thread.lock().take() {
            // The last pool reference may be released by a job on this very thread.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: &Shared) {
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            return;
        }

        let now = Instant::now();
        let deadline = match queue.entries.peek() {
            None => {
                shared.wakeup.wait(&mut queue);
                continue;
            }
            Some(entry) => entry.deadline,
        };
        if deadline > now {
            shared.wakeup.wait_until(&mut queue, deadline);
            continue;
        }

        let Some(mut entry) = queue.entries.pop() else {
            continue;
        };
        if entry.is_cancelled() {
            queue.cancelled = queue.cancelled.saturating_sub(1);
            continue;
        }

        let job = Arc::clone(&entry.job);
        MutexGuard::unlocked(&mut queue, || {
            if catch_unwind(AssertUnwindSafe(|| (*job)())).is_err() {
                tracing::error!("scheduled task panicked");
            }
        });

        if let Some(period) = entry.period
            && !entry.is_cancelled()
            && !queue.shutdown
        {
            entry.deadline = Instant::now() + period;
            queue.push(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_jobs_in_deadline_order() {
        let scheduler = Scheduler::start("test-scheduler".to_string()).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (delay, tag) in [(60, 3), (20, 1), (40, 2)] {
            let order = Arc::clone(&order);
            scheduler.schedule_once(Duration::from_millis(delay), move || order.lock().push(tag));
        }

        thread::sleep(Duration::from_millis(200));
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn cancelled_job_never_runs() {
        let scheduler = Scheduler::start("test-scheduler".to_string()).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let task = scheduler.schedule_once(Duration::from_millis(30), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(task.cancel());
        assert!(!task.cancel());

        thread::sleep(Duration::from_millis(100));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn periodic_job_repeats_until_cancelled() {
        let scheduler = Scheduler::start("test-scheduler".to_string()).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let task = scheduler.schedule_with_fixed_delay(
            Duration::from_millis(5),
            Duration::from_millis(10),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        thread::sleep(Duration::from_millis(120));
        task.cancel();
        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 3, "periodic job ran {seen} times");

        thread::sleep(Duration::from_millis(60));
        assert!(runs.load(Ordering::SeqCst) <= seen + 1);
    }

    #[test]
    fn cancelled_jobs_are_purged() {
        let scheduler = Scheduler::start("test-scheduler".to_string()).unwrap();
        let tasks: Vec<_> = (0..200)
            .map(|_| scheduler.schedule_once(Duration::from_secs(60), || {}))
            .collect();
        for task in &tasks {
            task.cancel();
        }
        assert!(scheduler.queued() < 200);
    }

    #[test]
    fn scheduling_after_shutdown_is_inert() {
        let scheduler = Scheduler::start("test-scheduler".to_string()).unwrap();
        scheduler.shutdown();
        let task = scheduler.schedule_once(Duration::ZERO, || panic!("must not run"));
        assert!(task.is_cancelled());
    }
}
