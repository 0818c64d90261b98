//! Pool entries: one live resource plus its bookkeeping

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::bag::{BagEntry, EntryState};
use crate::factory::AbortHandle;
use crate::scheduler::ScheduledTask;

/// Pool-owned record pairing a resource with its lifecycle state.
///
/// The resource itself moves out into the checkout handle while borrowed
/// and comes back on return, so `resource` is `None` while in use and
/// after the entry is closed.
pub(crate) struct PoolEntry<R> {
    id: u64,
    state: AtomicU8,
    resource: Mutex<Option<R>>,
    created_at: Instant,
    // Nanoseconds since `created_at`.
    last_accessed: AtomicU64,
    last_borrowed: AtomicU64,
    evicted: AtomicBool,
    end_of_life: Mutex<Option<ScheduledTask>>,
    keepalive: Mutex<Option<ScheduledTask>>,
    abort: Option<AbortHandle>,
}

impl<R> PoolEntry<R> {
    pub fn new(id: u64, resource: R, abort: Option<AbortHandle>) -> Self {
        Self {
            id,
            state: AtomicU8::new(EntryState::NotInUse as u8),
            resource: Mutex::new(Some(resource)),
            created_at: Instant::now(),
            last_accessed: AtomicU64::new(0),
            last_borrowed: AtomicU64::new(0),
            evicted: AtomicBool::new(false),
            end_of_life: Mutex::new(None),
            keepalive: Mutex::new(None),
            abort,
        }
    }

    pub fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::Release);
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    pub fn touch(&self, now: Instant) {
        self.last_accessed.store(self.offset(now), Ordering::Release);
    }

    pub fn mark_borrowed(&self, now: Instant) {
        self.last_borrowed.store(self.offset(now), Ordering::Release);
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        let last = self.created_at + Duration::from_nanos(self.last_accessed.load(Ordering::Acquire));
        now.saturating_duration_since(last)
    }

    pub fn borrowed_for(&self, now: Instant) -> Duration {
        let last = self.created_at + Duration::from_nanos(self.last_borrowed.load(Ordering::Acquire));
        now.saturating_duration_since(last)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn set_end_of_life(&self, task: ScheduledTask) {
        *self.end_of_life.lock() = Some(task);
    }

    pub fn set_keepalive(&self, task: ScheduledTask) {
        *self.keepalive.lock() = Some(task);
    }

    /// Run `f` against the resource while it sits in the entry. Returns
    /// `None` when the resource is checked out or already closed.
    pub fn with_resource<T>(&self, f: impl FnOnce(&mut R) -> T) -> Option<T> {
        self.resource.lock().as_mut().map(f)
    }

    pub fn take_resource(&self) -> Option<R> {
        self.resource.lock().take()
    }

    pub fn restore_resource(&self, resource: R) {
        *self.resource.lock() = Some(resource);
    }

    /// Cancel the entry's timers and hand back the resource, if present.
    pub fn close(&self) -> Option<R> {
        for slot in [&self.end_of_life, &self.keepalive] {
            if let Some(task) = slot.lock().take() {
                task.cancel();
            }
        }
        self.resource.lock().take()
    }

    /// Break the resource from this thread, if the factory supports it.
    pub fn abort(&self) -> bool {
        match &self.abort {
            Some(abort) => {
                abort();
                true
            }
            None => false,
        }
    }

    fn offset(&self, now: Instant) -> u64 {
        u64::try_from(now.saturating_duration_since(self.created_at).as_nanos()).unwrap_or(u64::MAX)
    }
}

impl<R: Send> BagEntry for PoolEntry<R> {
    fn id(&self) -> u64 {
        self.id
    }

    fn state(&self) -> EntryState {
        EntryState::from(self.state.load(Ordering::Acquire))
    }

    fn compare_and_set(&self, expect: EntryState, update: EntryState) -> bool {
        self.state
            .compare_exchange(expect as u8, update as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set_state(&self, update: EntryState) {
        self.state.store(update as u8, Ordering::Release);
    }
}

impl<R> fmt::Display for PoolEntry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry#{}", self.id)
    }
}

impl<R> fmt::Debug for PoolEntry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEntry")
            .field("id", &self.id)
            .field("state", &EntryState::from(self.state.load(Ordering::Acquire)))
            .field("evicted", &self.is_evicted())
            .field("age", &self.age())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_are_compare_and_set() {
        let entry = PoolEntry::new(1, "conn", None);
        assert_eq!(entry.state(), EntryState::NotInUse);
        assert!(entry.compare_and_set(EntryState::NotInUse, EntryState::InUse));
        assert!(!entry.compare_and_set(EntryState::NotInUse, EntryState::Reserved));
        assert_eq!(entry.state(), EntryState::InUse);
    }

    #[test]
    fn resource_moves_out_and_back() {
        let entry = PoolEntry::new(1, String::from("conn"), None);
        let resource = entry.take_resource().unwrap();
        assert!(entry.with_resource(|r| r.len()).is_none());
        entry.restore_resource(resource);
        assert_eq!(entry.with_resource(|r| r.len()), Some(4));
    }

    #[test]
    fn close_hands_back_resource_once() {
        let entry = PoolEntry::new(1, 7u8, None);
        assert_eq!(entry.close(), Some(7));
        assert_eq!(entry.close(), None);
    }

    #[test]
    fn idle_time_tracks_last_access() {
        let entry = PoolEntry::new(1, (), None);
        let later = Instant::now() + Duration::from_secs(5);
        entry.touch(later);
        assert_eq!(entry.idle_for(later), Duration::ZERO);
        assert!(entry.idle_for(later + Duration::from_secs(1)) >= Duration::from_secs(1));
    }

    #[test]
    fn eviction_flag_sticks() {
        let entry = PoolEntry::new(1, (), None);
        assert!(!entry.is_evicted());
        entry.mark_evicted();
        entry.mark_evicted();
        assert!(entry.is_evicted());
    }
}
