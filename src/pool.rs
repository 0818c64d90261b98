//! Pool controller: acquisition, growth, eviction and shutdown

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rand::Rng;

use crate::bag::{BagEntry, BagStateListener, ConcurrentBag, EntryState};
use crate::config::{PoolConfiguration, Tunables};
use crate::entry::PoolEntry;
use crate::errors::{PoolError, PoolResult, ResourceError, SharedResourceError};
use crate::executor::{BoundedExecutor, Saturation};
use crate::factory::{ResourceFactory, SessionProperty};
use crate::handle::{DirtyBits, PooledResource, SessionState};
use crate::health::HealthStatus;
use crate::housekeeper::Housekeeper;
use crate::leak::LeakDetector;
use crate::metrics::{MetricsTracker, PoolMetrics};
use crate::scheduler::{ScheduledTask, Scheduler};
use crate::suspend::SuspendResumeLock;

const HOUSEKEEPING_INITIAL_DELAY: Duration = Duration::from_millis(100);
const INITIAL_CREATE_BACKOFF: Duration = Duration::from_millis(250);
const MAX_CREATE_BACKOFF: Duration = Duration::from_secs(10);
const CREATE_BACKOFF_MULTIPLIER: f64 = 1.5;
const FAIL_FAST_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const CREATOR_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const FORCED_ABORT_GRACE: Duration = Duration::from_secs(10);
const EXECUTOR_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

const EVICTED_REASON: &str = "(connection was evicted)";
const DEAD_REASON: &str = "(connection is dead)";

type Entry<F> = PoolEntry<<F as ResourceFactory>::Resource>;

/// High-level state of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    Normal = 0,
    Suspended = 1,
    Shutdown = 2,
}

impl From<u8> for PoolState {
    fn from(value: u8) -> Self {
        match value {
            0 => PoolState::Normal,
            1 => PoolState::Suspended,
            _ => PoolState::Shutdown,
        }
    }
}

pub(crate) struct PoolInner<F: ResourceFactory> {
    pub(crate) config: PoolConfiguration,
    pub(crate) tunables: Tunables,
    pub(crate) factory: F,
    pub(crate) bag: ConcurrentBag<Entry<F>>,
    pub(crate) metrics: Arc<MetricsTracker>,
    pub(crate) leak_detector: LeakDetector,
    pub(crate) scheduler: Scheduler,
    state: AtomicU8,
    creator: BoundedExecutor,
    closer: BoundedExecutor,
    suspend_lock: SuspendResumeLock,
    housekeeper: Mutex<Option<ScheduledTask>>,
    shutdown_lock: Mutex<()>,
    // Dropped at shutdown to interrupt creation backoff.
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    last_failure: Mutex<Option<SharedResourceError>>,
    // Probed on the first resource: `None` when unsupported.
    default_network_timeout: OnceLock<Option<Duration>>,
    next_id: AtomicU64,
    self_ref: Weak<Self>,
}

impl<F: ResourceFactory> PoolInner<F> {
    fn start(factory: F, config: PoolConfiguration) -> PoolResult<Arc<Self>> {
        let name = config.pool_name.clone();
        let max = config.maximum_pool_size;

        let scheduler = Scheduler::start(format!("{name}-housekeeper")).map_err(init_error)?;
        let creator = BoundedExecutor::start(&format!("{name}-creator"), 1, max, Saturation::DiscardOldest)
            .map_err(init_error)?;
        let closer = BoundedExecutor::start(&format!("{name}-closer"), 1, max, Saturation::CallerRuns)
            .map_err(init_error)?;
        let (shutdown_tx, shutdown_rx) = channel::bounded(0);

        Ok(Arc::new_cyclic(|weak: &Weak<Self>| {
            let listener: Weak<dyn BagStateListener> = weak.clone();
            PoolInner {
                tunables: Tunables::from_config(&config),
                leak_detector: LeakDetector::new(name, config.leak_detection_threshold),
                suspend_lock: SuspendResumeLock::new(config.allow_suspension),
                bag: ConcurrentBag::new(listener),
                metrics: Arc::new(MetricsTracker::new()),
                state: AtomicU8::new(PoolState::Normal as u8),
                housekeeper: Mutex::new(None),
                shutdown_lock: Mutex::new(()),
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                shutdown_rx,
                last_failure: Mutex::new(None),
                default_network_timeout: OnceLock::new(),
                next_id: AtomicU64::new(1),
                self_ref: weak.clone(),
                config,
                factory,
                scheduler,
                creator,
                closer,
            }
        }))
    }

    pub(crate) fn state(&self) -> PoolState {
        PoolState::from(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn name(&self) -> &str {
        &self.config.pool_name
    }

    fn acquire(&self, timeout: Duration) -> PoolResult<PooledResource<F>> {
        if self.state() == PoolState::Shutdown {
            return Err(PoolError::PoolClosed);
        }

        let start = Instant::now();
        let deadline = start + timeout;
        let Some(_permit) = self.suspend_lock.acquire(deadline) else {
            return Err(self.timeout_error(start));
        };

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(entry) = self.bag.borrow(remaining) else {
                break;
            };

            let now = Instant::now();
            if entry.is_evicted() {
                self.destroy_entry(&entry, EVICTED_REASON, true);
            } else if entry.idle_for(now) > self.config.alive_bypass_window
                && !self.validate_within(&entry, start, deadline)?
            {
                self.destroy_entry(&entry, DEAD_REASON, true);
            } else if let Some(resource) = entry.take_resource() {
                let now = Instant::now();
                entry.mark_borrowed(now);
                let leak = self.leak_detector.schedule(&self.scheduler, &self.metrics, &*entry);
                self.metrics.record_acquire(start.elapsed());
                let pool = self.self_ref.upgrade().ok_or(PoolError::PoolClosed)?;
                return Ok(PooledResource::new(pool, entry, resource, leak));
            } else {
                self.destroy_entry(&entry, EVICTED_REASON, true);
            }

            if Instant::now() >= deadline {
                break;
            }
        }

        if self.state() == PoolState::Shutdown || self.bag.is_closed() {
            return Err(PoolError::PoolClosed);
        }
        Err(self.timeout_error(start))
    }

    fn timeout_error(&self, start: Instant) -> PoolError {
        self.metrics.record_timeout();
        self.log_pool_state("timeout failure");
        PoolError::AcquireTimeout {
            timeout: start.elapsed(),
            last_failure: self.last_failure.lock().clone(),
        }
    }

    /// Return a checked-out entry; evicted entries are destroyed instead.
    pub(crate) fn recycle(&self, entry: &Arc<Entry<F>>) {
        self.metrics.record_return();
        entry.touch(Instant::now());
        if entry.is_evicted() || self.bag.is_closed() {
            self.destroy_entry(entry, EVICTED_REASON, true);
        } else {
            self.bag.requite(entry);
        }
    }

    /// Mark an entry evicted and destroy it now if nobody else is using it.
    pub(crate) fn soft_evict(&self, entry: &Arc<Entry<F>>, reason: &str, owner: bool) -> bool {
        entry.mark_evicted();
        if owner || self.bag.reserve(entry) {
            self.destroy_entry(entry, reason, owner);
            true
        } else {
            false
        }
    }

    pub(crate) fn soft_evict_all(&self) {
        for entry in self.bag.values(None) {
            self.soft_evict(&entry, "(connection evicted)", false);
        }
    }

    /// Remove an entry from the bag and close its resource off the caller's
    /// thread. `owned` is set when the calling thread holds the entry.
    pub(crate) fn destroy_entry(&self, entry: &Arc<Entry<F>>, reason: &str, owned: bool) {
        // Force-removed during shutdown while its owner still held it.
        let aborted = entry.state() == EntryState::Removed;
        let removed = match entry.state() {
            EntryState::Removed => owned,
            EntryState::InUse if owned => self.bag.remove_borrowed(entry),
            _ => self.bag.remove(entry),
        };
        if !removed {
            return;
        }

        let resource = entry.close();
        if !aborted {
            self.metrics.record_destroyed();
        }
        let Some(resource) = resource else {
            return;
        };

        let label = entry.to_string();
        let reason = reason.to_string();
        match self.self_ref.upgrade() {
            Some(pool) => {
                let task = move || {
                    pool.close_resource(resource, &label, &reason);
                    if pool.state() == PoolState::Normal {
                        pool.fill_to_minimum();
                    }
                };
                if let Err(rejected) = self.closer.execute(task) {
                    rejected();
                }
            }
            None => self.close_resource(resource, &label, &reason),
        }
    }

    fn close_resource(&self, resource: F::Resource, entry: &str, reason: &str) {
        tracing::debug!(pool = %self.name(), entry, reason, "closing resource");
        self.factory.close(resource);
    }

    /// Submit enough creator tasks to reach the idle floor.
    pub(crate) fn fill_to_minimum(&self) {
        if self.state() == PoolState::Shutdown {
            return;
        }

        let total = self.bag.size();
        let idle = self.bag.get_count(EntryState::NotInUse);
        let to_add = self
            .config
            .maximum_pool_size
            .saturating_sub(total)
            .min(self.config.min_idle().saturating_sub(idle))
            .saturating_sub(self.creator.queued());

        for _ in 0..to_add {
            self.submit_creator();
        }
    }

    fn submit_creator(&self) {
        let pool = self.self_ref.clone();
        // A full queue discards the oldest request; a shut-down one refuses.
        let _ = self.creator.execute(move || create_until_added(&pool));
    }

    fn should_continue_creating(&self) -> bool {
        self.state() == PoolState::Normal
            && self.bag.size() < self.config.maximum_pool_size
            && (self.bag.waiting_borrower_count() > 0
                || self.bag.get_count(EntryState::NotInUse) < self.config.min_idle())
    }

    fn backoff_cap(&self) -> Duration {
        MAX_CREATE_BACKOFF.min(self.tunables.connection_timeout())
    }

    /// Create and configure one resource and wrap it in a timed entry.
    fn create_entry(&self) -> PoolResult<Arc<Entry<F>>> {
        let mut resource = match self.factory.create() {
            Ok(resource) => resource,
            Err(err) => {
                let source = self.record_creation_failure(err);
                return Err(PoolError::Resource { source });
            }
        };

        if let Err(err) = self.setup_resource(&mut resource) {
            self.factory.close(resource);
            let source = self.record_creation_failure(err);
            return Err(PoolError::ResourceSetup { source });
        }
        self.last_failure.lock().take();

        let abort = self.factory.abort_handle(&resource);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(PoolEntry::new(id, resource, abort));
        entry.touch(Instant::now());
        self.schedule_end_of_life(&entry);
        self.schedule_keepalive(&entry);
        self.metrics.record_created();

        tracing::debug!(pool = %self.name(), entry = %entry, "created resource");
        Ok(entry)
    }

    fn record_creation_failure(&self, err: ResourceError) -> SharedResourceError {
        let source: SharedResourceError = Arc::from(err);
        tracing::debug!(pool = %self.name(), error = %source, "cannot acquire resource from factory");
        self.metrics.record_creation_failure();
        *self.last_failure.lock() = Some(Arc::clone(&source));
        source
    }

    /// One-time setup of a fresh resource to the configured session defaults.
    fn setup_resource(&self, resource: &mut F::Resource) -> Result<(), ResourceError> {
        let default_timeout = *self
            .default_network_timeout
            .get_or_init(|| {
                let probed = self.factory.network_timeout(resource);
                if probed.is_none() {
                    tracing::info!(pool = %self.name(), "resource does not support network timeouts");
                }
                probed
            });
        if default_timeout.is_some() {
            let timeout = self.tunables.validation_timeout();
            self.factory.set_session_property(resource, &SessionProperty::NetworkTimeout(timeout))?;
        }

        let session = SessionState::from_config(&self.config, default_timeout);
        let configured = session
            .properties(DirtyBits::all() - DirtyBits::NETWORK_TIMEOUT)
            .into_iter()
            .filter(|property| {
                !matches!(
                    property,
                    SessionProperty::Isolation(None) | SessionProperty::Catalog(None) | SessionProperty::Schema(None)
                )
            });
        for property in configured {
            self.factory.set_session_property(resource, &property)?;
        }

        if let Some(statement) = &self.config.init_statement {
            self.factory.run_init_statement(resource, statement)?;
        }

        if let Some(timeout) = default_timeout {
            self.factory.set_session_property(resource, &SessionProperty::NetworkTimeout(timeout))?;
        }
        Ok(())
    }

    /// Put the properties named in `dirty` back to the pool defaults.
    pub(crate) fn reset_session(
        &self,
        resource: &mut F::Resource,
        dirty: DirtyBits,
    ) -> Result<(), ResourceError> {
        let defaults = self.session_defaults();
        for property in defaults.properties(dirty) {
            self.factory.set_session_property(resource, &property)?;
        }
        Ok(())
    }

    pub(crate) fn session_defaults(&self) -> SessionState {
        SessionState::from_config(&self.config, self.default_network_timeout.get().copied().flatten())
    }

    /// Liveness check of a borrowed entry, bounded by whatever is left of
    /// the caller's deadline. With no time left the entry goes back to the
    /// bag and the acquire times out.
    fn validate_within(&self, entry: &Arc<Entry<F>>, start: Instant, deadline: Instant) -> PoolResult<bool> {
        let budget = deadline.saturating_duration_since(Instant::now());
        if budget.is_zero() {
            if self.bag.is_closed() {
                self.destroy_entry(entry, EVICTED_REASON, true);
                return Err(PoolError::PoolClosed);
            }
            self.bag.requite(entry);
            return Err(self.timeout_error(start));
        }
        let timeout = self.tunables.validation_timeout().min(budget);
        Ok(self.validate(entry, timeout).is_ok())
    }

    /// Liveness check of an entry that is not checked out, bounded by
    /// `timeout`.
    fn validate(&self, entry: &Entry<F>, timeout: Duration) -> PoolResult<()> {
        let default_timeout = self.default_network_timeout.get().copied().flatten();

        let alive = entry
            .with_resource(|resource| {
                if default_timeout.is_some()
                    && self
                        .factory
                        .set_session_property(resource, &SessionProperty::NetworkTimeout(timeout))
                        .is_err()
                {
                    return false;
                }
                let alive = self.factory.is_alive(resource, timeout);
                match default_timeout {
                    Some(restore) => {
                        alive
                            && self
                                .factory
                                .set_session_property(resource, &SessionProperty::NetworkTimeout(restore))
                                .is_ok()
                    }
                    None => alive,
                }
            })
            .unwrap_or(false);

        if alive {
            return Ok(());
        }
        tracing::warn!(pool = %self.name(), entry = %entry,
            "failed to validate resource, consider a shorter max_lifetime");
        Err(PoolError::Validation)
    }

    fn schedule_end_of_life(&self, entry: &Arc<Entry<F>>) {
        let lifetime = self.config.max_lifetime;
        if lifetime.is_zero() {
            return;
        }

        // Spread expiry of resources created together.
        let variance = if lifetime > Duration::from_secs(10) {
            Duration::from_millis(rand::thread_rng().gen_range(0..millis(lifetime) / 40))
        } else {
            Duration::ZERO
        };

        let pool = self.self_ref.clone();
        let target = Arc::downgrade(entry);
        let task = self.scheduler.schedule_once(lifetime - variance, move || {
            let (Some(pool), Some(entry)) = (pool.upgrade(), target.upgrade()) else {
                return;
            };
            if pool.soft_evict(&entry, "(connection has passed max_lifetime)", false) {
                pool.add_bag_item(pool.bag.waiting_borrower_count());
            }
        });
        entry.set_end_of_life(task);
    }

    fn schedule_keepalive(&self, entry: &Arc<Entry<F>>) {
        let interval = self.config.keepalive_time;
        if interval.is_zero() {
            return;
        }

        let spread = millis(interval) / 10;
        let variance = if spread > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..spread))
        } else {
            Duration::ZERO
        };
        let heartbeat = interval - variance;

        let pool = self.self_ref.clone();
        let target = Arc::downgrade(entry);
        let task = self.scheduler.schedule_with_fixed_delay(heartbeat, heartbeat, move || {
            let (Some(pool), Some(entry)) = (pool.upgrade(), target.upgrade()) else {
                return;
            };
            if !pool.bag.reserve(&entry) {
                return;
            }
            if pool.validate(&entry, pool.tunables.validation_timeout()).is_ok() {
                pool.bag.unreserve(&entry);
                tracing::debug!(pool = %pool.name(), entry = %entry, "keepalive passed");
            } else {
                pool.soft_evict(&entry, DEAD_REASON, true);
                pool.add_bag_item(pool.bag.waiting_borrower_count());
            }
        });
        entry.set_keepalive(task);
    }

    /// Synchronous startup attempt, per `initialization_fail_timeout`.
    fn check_fail_fast(&self) -> PoolResult<()> {
        let Some(timeout) = self.config.initialization_fail_timeout else {
            return Ok(());
        };

        let start = Instant::now();
        loop {
            match self.create_entry() {
                Ok(entry) => {
                    if self.config.min_idle() > 0 {
                        self.bag.add(entry);
                    } else if let Some(resource) = entry.close() {
                        self.close_resource(resource, &entry.to_string(),
                            "(initialization check complete and minimum_idle is zero)");
                    }
                    return Ok(());
                }
                Err(PoolError::ResourceSetup { source }) => {
                    return Err(PoolError::PoolInitialization { source });
                }
                Err(_) => {}
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                break;
            }
            thread::sleep(FAIL_FAST_RETRY_INTERVAL.min(timeout - elapsed));
        }

        if timeout.is_zero() {
            return Ok(());
        }
        let source = self
            .last_failure
            .lock()
            .clone()
            .unwrap_or_else(|| Arc::from(ResourceError::from("no resource could be created")));
        Err(PoolError::PoolInitialization { source })
    }

    fn suspend(&self) -> PoolResult<()> {
        if !self.suspend_lock.is_enabled() {
            return Err(PoolError::SuspensionNotAllowed);
        }
        match self.state.compare_exchange(
            PoolState::Normal as u8,
            PoolState::Suspended as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.suspend_lock.suspend();
                tracing::info!(pool = %self.name(), "pool suspended");
                Ok(())
            }
            Err(current) if PoolState::from(current) == PoolState::Suspended => Ok(()),
            Err(_) => Err(PoolError::PoolClosed),
        }
    }

    fn resume(&self) -> PoolResult<()> {
        match self.state.compare_exchange(
            PoolState::Suspended as u8,
            PoolState::Normal as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.suspend_lock.resume();
                tracing::info!(pool = %self.name(), "pool resumed");
                self.fill_to_minimum();
                Ok(())
            }
            Err(current) if PoolState::from(current) == PoolState::Normal => Ok(()),
            Err(_) => Err(PoolError::PoolClosed),
        }
    }

    fn shutdown(&self) {
        let _serialized = self.shutdown_lock.lock();
        let previous = PoolState::from(self.state.swap(PoolState::Shutdown as u8, Ordering::AcqRel));
        if previous == PoolState::Shutdown {
            return;
        }
        tracing::info!(pool = %self.name(), "shutdown initiated");
        self.log_pool_state("before shutdown");

        if previous == PoolState::Suspended {
            self.suspend_lock.resume();
        }
        if let Some(housekeeper) = self.housekeeper.lock().take() {
            housekeeper.cancel();
        }

        self.soft_evict_all();

        self.shutdown_tx.lock().take();
        self.creator.shutdown_now();
        if !self.creator.await_termination(CREATOR_DRAIN_TIMEOUT) {
            tracing::warn!(pool = %self.name(), "resource creation did not stop in time");
        }
        self.scheduler.shutdown();

        self.bag.close();

        let aborter = BoundedExecutor::start(
            &format!("{}-aborter", self.name()),
            1,
            self.config.maximum_pool_size,
            Saturation::CallerRuns,
        )
        .ok();
        let start = Instant::now();
        loop {
            self.abort_active(aborter.as_ref());
            self.soft_evict_all();
            if self.bag.size() == 0 || start.elapsed() >= FORCED_ABORT_GRACE {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        if let Some(aborter) = aborter {
            aborter.shutdown();
            aborter.await_termination(EXECUTOR_DRAIN_TIMEOUT);
        }

        self.closer.shutdown();
        if !self.closer.await_termination(EXECUTOR_DRAIN_TIMEOUT) {
            tracing::warn!(pool = %self.name(), "closing resources did not finish in time");
        }

        self.log_pool_state("after shutdown");
        tracing::info!(pool = %self.name(), "shutdown completed");
    }

    /// Pull entries that are still in use or reserved out of the closed bag
    /// and break their resources.
    fn abort_active(&self, aborter: Option<&BoundedExecutor>) {
        let stuck = self
            .bag
            .values(Some(EntryState::InUse))
            .into_iter()
            .chain(self.bag.values(Some(EntryState::Reserved)));

        for entry in stuck {
            entry.mark_evicted();
            if !self.bag.remove(&entry) {
                continue;
            }
            self.metrics.record_destroyed();
            // The owner closes the resource itself once it hands it back.
            if let Some(resource) = entry.close() {
                self.close_resource(resource, &entry.to_string(), "(connection aborted during shutdown)");
            }

            let target = Arc::clone(&entry);
            let task = move || {
                if target.abort() {
                    tracing::debug!(entry = %target, "aborted resource in use");
                }
            };
            match aborter {
                Some(aborter) => {
                    if let Err(rejected) = aborter.execute(task) {
                        rejected();
                    }
                }
                None => task(),
            }
        }
    }

    pub(crate) fn log_pool_state(&self, prefix: &str) {
        tracing::debug!(
            pool = %self.name(),
            total = self.bag.size(),
            active = self.bag.get_count(EntryState::InUse),
            idle = self.bag.get_count(EntryState::NotInUse),
            waiting = self.bag.waiting_borrower_count(),
            "{prefix} stats"
        );
    }

    fn metrics(&self) -> PoolMetrics {
        self.metrics.snapshot(PoolMetrics {
            active: self.bag.get_count(EntryState::InUse),
            idle: self.bag.get_count(EntryState::NotInUse),
            total: self.bag.size(),
            waiting: self.bag.waiting_borrower_count(),
            maximum_pool_size: self.config.maximum_pool_size,
            minimum_idle: self.config.min_idle(),
            ..PoolMetrics::default()
        })
    }
}

impl<F: ResourceFactory> BagStateListener for PoolInner<F> {
    fn add_bag_item(&self, waiting: usize) {
        if waiting >= self.creator.queued() {
            self.submit_creator();
        }
    }
}

impl<F: ResourceFactory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        if self.state() == PoolState::Shutdown {
            return;
        }
        self.state.store(PoolState::Shutdown as u8, Ordering::Release);
        self.scheduler.shutdown();
        self.bag.close();
        for entry in self.bag.values(None) {
            if let Some(resource) = entry.close() {
                self.factory.close(resource);
            }
        }
    }
}

/// Creator task: keep trying to add one entry while the pool needs it,
/// backing off between failures. Holds the pool only while creating.
fn create_until_added<F: ResourceFactory>(pool: &Weak<PoolInner<F>>) {
    let mut backoff = INITIAL_CREATE_BACKOFF;
    loop {
        let (shutdown, cap) = {
            let Some(pool) = pool.upgrade() else {
                return;
            };
            if !pool.should_continue_creating() {
                return;
            }
            if let Ok(entry) = pool.create_entry() {
                if !pool.bag.add(Arc::clone(&entry)) {
                    if let Some(resource) = entry.close() {
                        pool.close_resource(resource, &entry.to_string(), "(pool is shutting down)");
                    }
                }
                pool.log_pool_state("after adding");
                return;
            }
            (pool.shutdown_rx.clone(), pool.backoff_cap())
        };

        match shutdown.recv_timeout(backoff) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => return,
        }
        backoff = backoff.mul_f64(CREATE_BACKOFF_MULTIPLIER).min(cap);
    }
}

fn init_error(err: std::io::Error) -> PoolError {
    PoolError::PoolInitialization { source: Arc::new(err) }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// A pool of exclusive, reusable resources
///
/// Cloning is cheap and every clone refers to the same pool.
///
/// # Examples
///
/// ```
/// use esox_connectionpool::{PoolConfiguration, ResourceError, ResourceFactory, ResourcePool, SessionProperty};
/// use std::time::Duration;
///
/// struct Sessions;
///
/// impl ResourceFactory for Sessions {
///     type Resource = Vec<String>;
///
///     fn create(&self) -> Result<Vec<String>, ResourceError> {
///         Ok(Vec::new())
///     }
///
///     fn is_alive(&self, _resource: &mut Vec<String>, _timeout: Duration) -> bool {
///         true
///     }
///
///     fn close(&self, _resource: Vec<String>) {}
///
///     fn set_session_property(&self, _: &mut Vec<String>, _: &SessionProperty) -> Result<(), ResourceError> {
///         Ok(())
///     }
/// }
///
/// let pool = ResourcePool::new(Sessions, PoolConfiguration::new().with_max_pool_size(2)).unwrap();
/// {
///     let mut session = pool.acquire().unwrap();
///     session.push("SELECT 1".to_string());
///     assert_eq!(pool.active_count(), 1);
/// }
/// assert_eq!(pool.active_count(), 0);
/// pool.shutdown();
/// ```
pub struct ResourcePool<F: ResourceFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ResourceFactory> Clone for ResourcePool<F> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<F: ResourceFactory> ResourcePool<F> {
    /// Create a pool, run the startup check and start housekeeping
    pub fn new(factory: F, config: PoolConfiguration) -> PoolResult<Self> {
        let config = config.validate()?;
        tracing::info!(pool = %config.pool_name, "starting");

        let inner = PoolInner::start(factory, config)?;
        if let Err(err) = inner.check_fail_fast() {
            tracing::error!(pool = %inner.name(), error = %err, "startup check failed");
            inner.shutdown();
            return Err(err);
        }

        let housekeeper = Housekeeper::new(Arc::downgrade(&inner), inner.config.housekeeping_period);
        let task = inner.scheduler.schedule_with_fixed_delay(
            HOUSEKEEPING_INITIAL_DELAY,
            inner.config.housekeeping_period,
            move || housekeeper.run(),
        );
        *inner.housekeeper.lock() = Some(task);
        inner.fill_to_minimum();

        tracing::info!(pool = %inner.name(), "start completed");
        Ok(Self { inner })
    }

    /// Acquire a resource, waiting up to the configured connection timeout
    pub fn acquire(&self) -> PoolResult<PooledResource<F>> {
        self.inner.acquire(self.inner.tunables.connection_timeout())
    }

    /// Acquire a resource, waiting up to `timeout`
    pub fn acquire_timeout(&self, timeout: Duration) -> PoolResult<PooledResource<F>> {
        self.inner.acquire(timeout)
    }

    /// Acquire a resource without blocking the async runtime
    pub async fn acquire_async(&self) -> PoolResult<PooledResource<F>> {
        let pool = self.clone();
        tokio::task::spawn_blocking(move || pool.acquire())
            .await
            .map_err(|_| PoolError::Cancelled)?
    }

    /// Pause new acquisitions; requires `allow_suspension`
    pub fn suspend(&self) -> PoolResult<()> {
        self.inner.suspend()
    }

    pub fn resume(&self) -> PoolResult<()> {
        self.inner.resume()
    }

    /// Shut the pool down. Blocks until every resource is closed or aborted.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Mark every resource evicted: idle ones close now, busy ones on return
    pub fn soft_evict_all(&self) {
        self.inner.soft_evict_all();
    }

    pub fn state(&self) -> PoolState {
        self.inner.state()
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.suspend_lock.is_suspended()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state() == PoolState::Shutdown
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn config(&self) -> &PoolConfiguration {
        &self.inner.config
    }

    /// Settings adjustable while the pool runs
    pub fn tunables(&self) -> &Tunables {
        &self.inner.tunables
    }

    pub fn active_count(&self) -> usize {
        self.inner.bag.get_count(EntryState::InUse)
    }

    pub fn idle_count(&self) -> usize {
        self.inner.bag.get_count(EntryState::NotInUse)
    }

    pub fn total_count(&self) -> usize {
        self.inner.bag.size()
    }

    pub fn waiting_count(&self) -> usize {
        self.inner.bag.waiting_borrower_count()
    }

    /// Get pool metrics
    pub fn metrics(&self) -> PoolMetrics {
        self.inner.metrics()
    }

    /// Get health status
    pub fn health(&self) -> HealthStatus {
        let last_failure = self.inner.last_failure.lock().as_ref().map(|err| err.to_string());
        HealthStatus::new(&self.inner.metrics(), last_failure)
    }

    /// Prometheus collector reading this pool at scrape time
    #[cfg(feature = "prometheus")]
    pub fn prometheus_collector(&self) -> prometheus::Result<crate::metrics::PoolCollector> {
        let pool = Arc::downgrade(&self.inner);
        crate::metrics::PoolCollector::new(
            self.name(),
            Box::new(move || pool.upgrade().map(|pool| pool.metrics())),
        )
    }

    /// Run one housekeeping pass now
    #[cfg(test)]
    pub(crate) fn housekeeper(&self) -> Housekeeper<F> {
        Housekeeper::new(Arc::downgrade(&self.inner), self.inner.config.housekeeping_period)
    }
}

impl<F: ResourceFactory> fmt::Debug for ResourcePool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("total", &self.total_count())
            .field("active", &self.active_count())
            .field("idle", &self.idle_count())
            .field("waiting", &self.waiting_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Abortable {
        aborts: Arc<AtomicUsize>,
    }

    impl ResourceFactory for Abortable {
        type Resource = u32;

        fn create(&self) -> Result<u32, ResourceError> {
            Ok(7)
        }

        fn is_alive(&self, _resource: &mut u32, _timeout: Duration) -> bool {
            true
        }

        fn close(&self, _resource: u32) {}

        fn set_session_property(&self, _: &mut u32, _: &SessionProperty) -> Result<(), ResourceError> {
            Ok(())
        }

        fn abort_handle(&self, _resource: &u32) -> Option<crate::factory::AbortHandle> {
            let aborts = Arc::clone(&self.aborts);
            Some(Box::new(move || {
                aborts.fetch_add(1, Ordering::SeqCst);
            }))
        }
    }

    #[test]
    fn aborts_in_use_entries_inline_without_an_aborter() {
        let aborts = Arc::new(AtomicUsize::new(0));
        let config = PoolConfiguration::new()
            .with_max_pool_size(1)
            .with_min_idle(0)
            .with_housekeeping_period(Duration::from_secs(3600))
            .with_initialization_fail_timeout(None);
        let pool = ResourcePool::new(Abortable { aborts: Arc::clone(&aborts) }, config).unwrap();
        let held = pool.acquire().unwrap();

        pool.inner.bag.close();
        pool.inner.abort_active(None);

        assert_eq!(aborts.load(Ordering::SeqCst), 1);
        assert_eq!(pool.total_count(), 0);
        assert_eq!(pool.metrics().total_destroyed, 1);

        drop(held);
        assert_eq!(pool.metrics().total_destroyed, 1);
        pool.shutdown();
    }
}
