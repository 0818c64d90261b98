//! Gate that lets maintenance pause new acquisitions

use std::time::Instant;

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct GateState {
    suspended: bool,
    in_flight: usize,
}

/// Every acquisition passes this gate. While suspended, callers block until
/// `resume` or their own deadline.
///
/// A pool that does not allow suspension uses the inert variant, which
/// never blocks.
pub(crate) struct SuspendResumeLock {
    enabled: bool,
    state: Mutex<GateState>,
    changed: Condvar,
}

pub(crate) struct GatePermit<'a> {
    lock: Option<&'a SuspendResumeLock>,
}

impl SuspendResumeLock {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            state: Mutex::new(GateState::default()),
            changed: Condvar::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Pass the gate, waiting until `deadline` while suspended. Returns
    /// `None` on timeout.
    pub fn acquire(&self, deadline: Instant) -> Option<GatePermit<'_>> {
        if !self.enabled {
            return Some(GatePermit { lock: None });
        }

        let mut state = self.state.lock();
        while state.suspended {
            if self.changed.wait_until(&mut state, deadline).timed_out() && state.suspended {
                return None;
            }
        }
        state.in_flight += 1;
        Some(GatePermit { lock: Some(self) })
    }

    /// Close the gate and wait for acquisitions already past it to finish.
    pub fn suspend(&self) {
        let mut state = self.state.lock();
        state.suspended = true;
        while state.in_flight > 0 {
            self.changed.wait(&mut state);
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.suspended = false;
        self.changed.notify_all();
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspended
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.changed.notify_all();
        }
    }
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock {
            lock.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn inert_gate_never_blocks() {
        let gate = SuspendResumeLock::new(false);
        gate.suspend();
        assert!(gate.acquire(Instant::now()).is_some());
    }

    #[test]
    fn suspended_gate_times_out() {
        let gate = SuspendResumeLock::new(true);
        gate.suspend();
        let start = Instant::now();
        assert!(gate.acquire(start + Duration::from_millis(50)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn resume_releases_waiters() {
        let gate = Arc::new(SuspendResumeLock::new(true));
        gate.suspend();

        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.acquire(Instant::now() + Duration::from_secs(5)).is_some())
        };
        thread::sleep(Duration::from_millis(30));
        gate.resume();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn suspend_waits_for_in_flight_permits() {
        let gate = Arc::new(SuspendResumeLock::new(true));
        let permit = gate.acquire(Instant::now()).unwrap();

        let suspender = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let start = Instant::now();
                gate.suspend();
                start.elapsed()
            })
        };
        thread::sleep(Duration::from_millis(40));
        drop(permit);
        assert!(suspender.join().unwrap() >= Duration::from_millis(30));
        assert!(gate.is_suspended());
    }
}
