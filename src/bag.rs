//! Concurrent hand-off bag holding the pool's entries
//!
//! Entries live in a shared registry for their whole life; borrowing and
//! returning only flip the entry's state with compare-and-set. Borrowers
//! that find nothing idle park on a zero-capacity channel, so a returned
//! entry goes straight to a waiting thread instead of back through the
//! registry.

use std::fmt;
use std::sync::atomic::{self, AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;

/// Lifecycle state of a bag entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryState {
    NotInUse = 0,
    InUse = 1,
    Reserved = 2,
    Removed = 3,
}

impl From<u8> for EntryState {
    fn from(value: u8) -> Self {
        match value {
            0 => EntryState::NotInUse,
            1 => EntryState::InUse,
            2 => EntryState::Reserved,
            _ => EntryState::Removed,
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryState::NotInUse => "NOT_IN_USE",
            EntryState::InUse => "IN_USE",
            EntryState::Reserved => "RESERVED",
            EntryState::Removed => "REMOVED",
        };
        f.write_str(name)
    }
}

/// An item the bag can circulate.
pub(crate) trait BagEntry: Send + Sync {
    fn id(&self) -> u64;
    fn state(&self) -> EntryState;
    fn compare_and_set(&self, expect: EntryState, update: EntryState) -> bool;
    fn set_state(&self, update: EntryState);
}

/// Told when a borrower found nothing idle, with the number of threads
/// currently waiting.
pub(crate) trait BagStateListener: Send + Sync {
    fn add_bag_item(&self, waiting: usize);
}

/// Keeps the waiter count honest on every exit path of `borrow`.
struct WaiterGuard<'a>(&'a AtomicUsize);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) struct ConcurrentBag<T: BagEntry> {
    shared: DashMap<u64, Arc<T>>,
    waiters: AtomicUsize,
    closed: AtomicBool,
    handoff_tx: Sender<Arc<T>>,
    handoff_rx: Receiver<Arc<T>>,
    // Dropping the sender wakes every parked borrower.
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
    listener: Weak<dyn BagStateListener>,
}

impl<T: BagEntry> ConcurrentBag<T> {
    pub fn new(listener: Weak<dyn BagStateListener>) -> Self {
        let (handoff_tx, handoff_rx) = channel::bounded(0);
        let (close_tx, close_rx) = channel::bounded(0);
        Self {
            shared: DashMap::new(),
            waiters: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            handoff_tx,
            handoff_rx,
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
            listener,
        }
    }

    /// Borrow an idle entry, waiting up to `timeout` for one to be added or
    /// returned. `None` on timeout or once the bag is closed.
    pub fn borrow(&self, timeout: Duration) -> Option<Arc<T>> {
        if self.is_closed() {
            return None;
        }

        let waiting = self.waiters.fetch_add(1, Ordering::SeqCst);
        let _guard = WaiterGuard(&self.waiters);
        // Pairs with the fence in `offer`: either this scan sees the returned
        // entry or the returning thread sees this waiter.
        atomic::fence(Ordering::SeqCst);

        if let Some(entry) = self.claim_idle() {
            if waiting > 0 {
                self.notify_listener(waiting);
            }
            return Some(entry);
        }

        self.notify_listener(waiting + 1);

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            channel::select! {
                recv(self.handoff_rx) -> msg => {
                    if let Ok(entry) = msg
                        && entry.compare_and_set(EntryState::NotInUse, EntryState::InUse)
                    {
                        return Some(entry);
                    }
                }
                recv(self.close_rx) -> _ => return None,
                default(remaining) => return None,
            }
        }
    }

    /// Return a borrowed entry, handing it to a waiting borrower if there is
    /// one.
    pub fn requite(&self, entry: &Arc<T>) {
        entry.set_state(EntryState::NotInUse);
        self.offer(entry);
    }

    /// Make a new entry available.
    pub fn add(&self, entry: Arc<T>) -> bool {
        if self.is_closed() {
            tracing::info!(entry = entry.id(), "bag has been closed, ignoring add");
            return false;
        }
        self.shared.insert(entry.id(), Arc::clone(&entry));
        self.offer(&entry);
        true
    }

    /// Take an idle entry out of circulation without borrowing it.
    pub fn reserve(&self, entry: &T) -> bool {
        entry.compare_and_set(EntryState::NotInUse, EntryState::Reserved)
    }

    /// Put a reserved entry back into circulation.
    pub fn unreserve(&self, entry: &Arc<T>) {
        if entry.compare_and_set(EntryState::Reserved, EntryState::NotInUse) {
            self.offer(entry);
        } else {
            tracing::warn!(entry = entry.id(), state = %entry.state(),
                "attempt to unreserve an entry that was not reserved");
        }
    }

    /// Remove an idle or reserved entry. Entries in use can only be removed
    /// by their borrower, or by anyone once the bag is closed.
    pub fn remove(&self, entry: &T) -> bool {
        let removed = entry.compare_and_set(EntryState::Reserved, EntryState::Removed)
            || entry.compare_and_set(EntryState::NotInUse, EntryState::Removed)
            || (self.is_closed() && entry.compare_and_set(EntryState::InUse, EntryState::Removed));
        if !removed {
            tracing::warn!(entry = entry.id(), state = %entry.state(),
                "attempt to remove an entry that was not idle or reserved");
            return false;
        }
        self.forget(entry);
        true
    }

    /// Remove an entry the calling thread has borrowed.
    pub fn remove_borrowed(&self, entry: &T) -> bool {
        if !entry.compare_and_set(EntryState::InUse, EntryState::Removed) {
            return false;
        }
        self.forget(entry);
        true
    }

    /// Point-in-time snapshot of the entries, optionally filtered by state.
    pub fn values(&self, state: Option<EntryState>) -> Vec<Arc<T>> {
        self.shared
            .iter()
            .filter(|item| state.is_none_or(|s| item.value().state() == s))
            .map(|item| Arc::clone(item.value()))
            .collect()
    }

    pub fn get_count(&self, state: EntryState) -> usize {
        self.shared
            .iter()
            .filter(|item| item.value().state() == state)
            .count()
    }

    pub fn size(&self) -> usize {
        self.shared.len()
    }

    pub fn waiting_borrower_count(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    /// Stop accepting entries and wake every parked borrower.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn claim_idle(&self) -> Option<Arc<T>> {
        self.shared.iter().find_map(|item| {
            let entry = item.value();
            entry
                .compare_and_set(EntryState::NotInUse, EntryState::InUse)
                .then(|| Arc::clone(entry))
        })
    }

    /// Keep offering an idle entry to parked borrowers until one takes it,
    /// someone else claims it, or nobody is waiting any more.
    fn offer(&self, entry: &Arc<T>) {
        let mut attempt: u32 = 0;
        atomic::fence(Ordering::SeqCst);
        while self.waiters.load(Ordering::SeqCst) > 0 && !self.is_closed() {
            if entry.state() != EntryState::NotInUse
                || self.handoff_tx.try_send(Arc::clone(entry)).is_ok()
            {
                return;
            }
            attempt = attempt.wrapping_add(1);
            if attempt & 0xff == 0xff {
                thread::sleep(Duration::from_micros(10));
            } else {
                thread::yield_now();
            }
        }
    }

    fn forget(&self, entry: &T) {
        if self.shared.remove(&entry.id()).is_none() {
            tracing::warn!(entry = entry.id(), "attempt to remove an entry that does not exist");
        }
    }

    fn notify_listener(&self, waiting: usize) {
        if let Some(listener) = self.listener.upgrade() {
            listener.add_bag_item(waiting);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, AtomicU64};

    struct Item {
        id: u64,
        state: AtomicU8,
    }

    impl Item {
        fn new(id: u64) -> Arc<Self> {
            Arc::new(Self { id, state: AtomicU8::new(EntryState::NotInUse as u8) })
        }
    }

    impl BagEntry for Item {
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

    #[derive(Default)]
    struct CountingListener {
        calls: AtomicU64,
    }

    impl BagStateListener for CountingListener {
        fn add_bag_item(&self, _waiting: usize) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn bag() -> (ConcurrentBag<Item>, Arc<CountingListener>) {
        let listener = Arc::new(CountingListener::default());
        let weak: Weak<dyn BagStateListener> = Arc::downgrade(&listener) as Weak<dyn BagStateListener>;
        (ConcurrentBag::new(weak), listener)
    }

    #[test]
    fn borrow_and_requite() {
        let (bag, _) = bag();
        bag.add(Item::new(1));

        let entry = bag.borrow(Duration::from_millis(10)).unwrap();
        assert_eq!(entry.state(), EntryState::InUse);
        assert!(bag.borrow(Duration::from_millis(10)).is_none());

        bag.requite(&entry);
        assert_eq!(bag.get_count(EntryState::NotInUse), 1);
        assert!(bag.borrow(Duration::from_millis(10)).is_some());
    }

    #[test]
    fn empty_borrow_notifies_listener_and_times_out() {
        let (bag, listener) = bag();
        let start = Instant::now();
        assert!(bag.borrow(Duration::from_millis(50)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
        assert_eq!(bag.waiting_borrower_count(), 0);
    }

    #[test]
    fn requite_hands_off_to_waiter() {
        let (bag, _) = bag();
        let bag = Arc::new(bag);
        bag.add(Item::new(1));
        let held = bag.borrow(Duration::ZERO).unwrap();

        let waiter = {
            let bag = Arc::clone(&bag);
            thread::spawn(move || {
                let start = Instant::now();
                let entry = bag.borrow(Duration::from_secs(5));
                (entry.map(|e| e.id()), start.elapsed())
            })
        };
        while bag.waiting_borrower_count() == 0 {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(20));
        bag.requite(&held);

        let (id, waited) = waiter.join().unwrap();
        assert_eq!(id, Some(1));
        assert!(waited < Duration::from_secs(1));
    }

    #[test]
    fn reserve_refuses_in_use_entries() {
        let (bag, _) = bag();
        let item = Item::new(1);
        bag.add(Arc::clone(&item));

        let borrowed = bag.borrow(Duration::ZERO).unwrap();
        assert!(!bag.reserve(&item));
        assert!(!bag.remove(&item));
        bag.requite(&borrowed);

        assert!(bag.reserve(&item));
        assert!(bag.borrow(Duration::ZERO).is_none());
        bag.unreserve(&item);
        assert!(bag.reserve(&item));
        assert!(bag.remove(&item));
        assert_eq!(bag.size(), 0);
        assert_eq!(item.state(), EntryState::Removed);
    }

    #[test]
    fn borrower_may_remove_its_own_entry() {
        let (bag, _) = bag();
        bag.add(Item::new(1));
        let entry = bag.borrow(Duration::ZERO).unwrap();
        assert!(bag.remove_borrowed(&entry));
        assert_eq!(bag.size(), 0);
    }

    #[test]
    fn close_wakes_parked_borrowers() {
        let (bag, _) = bag();
        let bag = Arc::new(bag);
        let waiter = {
            let bag = Arc::clone(&bag);
            thread::spawn(move || {
                let start = Instant::now();
                (bag.borrow(Duration::from_secs(10)).is_none(), start.elapsed())
            })
        };
        while bag.waiting_borrower_count() == 0 {
            thread::yield_now();
        }
        bag.close();

        let (none, waited) = waiter.join().unwrap();
        assert!(none);
        assert!(waited < Duration::from_secs(5));
        assert!(!bag.add(Item::new(2)));
    }

    #[test]
    fn closed_bag_removes_in_use_entries() {
        let (bag, _) = bag();
        let item = Item::new(1);
        bag.add(Arc::clone(&item));
        let _borrowed = bag.borrow(Duration::ZERO).unwrap();
        bag.close();
        assert!(bag.remove(&item));
    }

    #[test]
    fn concurrent_borrowers_never_share_an_entry() {
        let (bag, _) = bag();
        let bag = Arc::new(bag);
        for id in 0..3 {
            bag.add(Item::new(id));
        }
        let holders: Arc<Vec<AtomicU8>> = Arc::new((0..3).map(|_| AtomicU8::new(0)).collect());

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let bag = Arc::clone(&bag);
                let holders = Arc::clone(&holders);
                thread::spawn(move || {
                    for _ in 0..500 {
                        if let Some(entry) = bag.borrow(Duration::from_secs(1)) {
                            let slot = &holders[entry.id() as usize];
                            assert_eq!(slot.fetch_add(1, Ordering::SeqCst), 0);
                            thread::yield_now();
                            slot.fetch_sub(1, Ordering::SeqCst);
                            bag.requite(&entry);
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(bag.get_count(EntryState::NotInUse), 3);
    }

    #[test]
    fn single_entry_ping_pong_never_misses_a_wakeup() {
        let (bag, _) = bag();
        let bag = Arc::new(bag);
        bag.add(Item::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let bag = Arc::clone(&bag);
                thread::spawn(move || {
                    let mut missed = 0;
                    for _ in 0..2_000 {
                        match bag.borrow(Duration::from_secs(2)) {
                            Some(entry) => bag.requite(&entry),
                            None => missed += 1,
                        }
                    }
                    missed
                })
            })
            .collect();

        let missed: usize = workers.into_iter().map(|worker| worker.join().unwrap()).sum();
        assert_eq!(missed, 0);
        assert_eq!(bag.get_count(EntryState::NotInUse), 1);
    }
}
