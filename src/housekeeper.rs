//! Periodic pool maintenance

use std::sync::Weak;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::bag::EntryState;
use crate::factory::ResourceFactory;
use crate::pool::PoolInner;

/// Clock moves backwards by less than this are tolerated.
const CLOCK_SKEW_TOLERANCE: Duration = Duration::from_millis(128);

/// What one housekeeping pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sweep {
    /// The pool is gone
    Skipped,
    /// Wall clock went backwards: every entry was soft-evicted
    ClockRetrograde,
    /// Normal pass, with the number of idle entries retired
    Completed { retired: usize },
}

/// Retires idle entries above the floor, watches the wall clock and tops
/// the pool back up.
pub(crate) struct Housekeeper<F: ResourceFactory> {
    pool: Weak<PoolInner<F>>,
    period: Duration,
    previous: Mutex<SystemTime>,
}

impl<F: ResourceFactory> Housekeeper<F> {
    pub fn new(pool: Weak<PoolInner<F>>, period: Duration) -> Self {
        let now = SystemTime::now();
        Self {
            pool,
            period,
            previous: Mutex::new(now.checked_sub(period).unwrap_or(now)),
        }
    }

    pub fn run(&self) {
        self.tick(SystemTime::now());
    }

    pub fn tick(&self, now: SystemTime) -> Sweep {
        let Some(pool) = self.pool.upgrade() else {
            return Sweep::Skipped;
        };

        pool.leak_detector.update_threshold(pool.tunables.leak_detection_threshold());

        let previous = std::mem::replace(&mut *self.previous.lock(), now);
        let expected = previous + self.period;
        if now + CLOCK_SKEW_TOLERANCE < expected {
            let behind = expected.duration_since(now).unwrap_or_default();
            tracing::warn!(pool = %pool.name(), behind_ms = behind.as_millis() as u64,
                "retrograde clock change detected, soft-evicting resources");
            pool.soft_evict_all();
            return Sweep::ClockRetrograde;
        }
        if now > previous + self.period.mul_f64(1.5) {
            let gap = now.duration_since(previous).unwrap_or_default();
            tracing::warn!(pool = %pool.name(), gap_ms = gap.as_millis() as u64,
                "thread starvation or clock leap detected");
        }

        let mut retired = 0;
        let idle_timeout = pool.tunables.idle_timeout();
        let min_idle = pool.config.min_idle();
        if !idle_timeout.is_zero() && min_idle < pool.config.maximum_pool_size {
            pool.log_pool_state("before cleanup");

            let idle = pool.bag.values(Some(EntryState::NotInUse));
            let mut surplus = idle.len().saturating_sub(min_idle);
            let checked_at = std::time::Instant::now();
            for entry in idle {
                if surplus == 0 {
                    break;
                }
                if entry.idle_for(checked_at) > idle_timeout && pool.bag.reserve(&entry) {
                    pool.destroy_entry(&entry, "(connection has passed idle_timeout)", false);
                    surplus -= 1;
                    retired += 1;
                }
            }
        }

        pool.log_pool_state("after cleanup");
        pool.fill_to_minimum();
        Sweep::Completed { retired }
    }
}
