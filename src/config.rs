//! Pool configuration options

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::errors::{PoolError, PoolResult};
use crate::factory::IsolationLevel;

/// Configuration for connection pool behavior
///
/// # Examples
///
/// ```
/// use esox_connectionpool::PoolConfiguration;
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new()
///     .with_max_pool_size(20)
///     .with_min_idle(5)
///     .with_connection_timeout(Duration::from_secs(5))
///     .with_max_lifetime(Duration::from_secs(1800));
///
/// assert_eq!(config.maximum_pool_size, 20);
/// assert_eq!(config.minimum_idle, Some(5));
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfiguration {
    /// Name used in log lines, thread names and exported metrics
    pub pool_name: String,

    /// Number of idle resources the pool tries to keep warm; `None` means
    /// the same as `maximum_pool_size`
    pub minimum_idle: Option<usize>,

    /// Hard upper bound on the number of resources, idle and in use
    pub maximum_pool_size: usize,

    /// How long `acquire` waits for a resource
    pub connection_timeout: Duration,

    /// How long a resource may sit idle before it is retired; zero disables
    pub idle_timeout: Duration,

    /// Maximum age of a resource; zero disables
    pub max_lifetime: Duration,

    /// Interval of the liveness probe run on idle resources; zero disables
    pub keepalive_time: Duration,

    /// How long a resource may stay checked out before a leak is reported;
    /// zero disables
    pub leak_detection_threshold: Duration,

    /// Upper bound on a single liveness check
    pub validation_timeout: Duration,

    /// Startup fail-fast window; `None` skips the startup attempt
    pub initialization_fail_timeout: Option<Duration>,

    /// Interval of the housekeeping run
    pub housekeeping_period: Duration,

    /// Whether `suspend`/`resume` are permitted
    pub allow_suspension: bool,

    /// Liveness checks are skipped for resources used within this window
    pub alive_bypass_window: Duration,

    /// Session default: read-only
    pub read_only: bool,

    /// Session default: auto-commit
    pub auto_commit: bool,

    /// Session default: transaction isolation, `None` leaves the driver default
    pub transaction_isolation: Option<IsolationLevel>,

    /// Session default: catalog
    pub catalog: Option<String>,

    /// Session default: schema
    pub schema: Option<String>,

    /// Statement run once on every newly created resource
    pub init_statement: Option<String>,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            pool_name: "esox-pool".to_string(),
            minimum_idle: None,
            maximum_pool_size: 10,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
            keepalive_time: Duration::ZERO,
            leak_detection_threshold: Duration::ZERO,
            validation_timeout: Duration::from_secs(5),
            initialization_fail_timeout: Some(Duration::from_millis(1)),
            housekeeping_period: Duration::from_secs(30),
            allow_suspension: false,
            alive_bypass_window: Duration::from_millis(500),
            read_only: false,
            auto_commit: true,
            transaction_isolation: None,
            catalog: None,
            schema: None,
            init_statement: None,
        }
    }
}

impl PoolConfiguration {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool_name(mut self, name: impl Into<String>) -> Self {
        self.pool_name = name.into();
        self
    }

    /// Set the maximum pool size
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_connectionpool::PoolConfiguration;
    ///
    /// let config = PoolConfiguration::new().with_max_pool_size(50);
    /// assert_eq!(config.maximum_pool_size, 50);
    /// ```
    pub fn with_max_pool_size(mut self, size: usize) -> Self {
        self.maximum_pool_size = size;
        self
    }

    /// Set the minimum number of idle resources
    pub fn with_min_idle(mut self, count: usize) -> Self {
        self.minimum_idle = Some(count);
        self
    }

    /// Set the acquire timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the maximum lifetime of a resource
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    pub fn with_keepalive_time(mut self, interval: Duration) -> Self {
        self.keepalive_time = interval;
        self
    }

    /// Enable leak detection
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_connectionpool::PoolConfiguration;
    /// use std::time::Duration;
    ///
    /// let config = PoolConfiguration::new()
    ///     .with_leak_detection_threshold(Duration::from_secs(10));
    ///
    /// assert_eq!(config.leak_detection_threshold, Duration::from_secs(10));
    /// ```
    pub fn with_leak_detection_threshold(mut self, threshold: Duration) -> Self {
        self.leak_detection_threshold = threshold;
        self
    }

    pub fn with_validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = timeout;
        self
    }

    /// Set the startup fail-fast window, `None` to skip it
    pub fn with_initialization_fail_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.initialization_fail_timeout = timeout;
        self
    }

    pub fn with_housekeeping_period(mut self, period: Duration) -> Self {
        self.housekeeping_period = period;
        self
    }

    pub fn with_allow_suspension(mut self, allow: bool) -> Self {
        self.allow_suspension = allow;
        self
    }

    pub fn with_alive_bypass_window(mut self, window: Duration) -> Self {
        self.alive_bypass_window = window;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    pub fn with_transaction_isolation(mut self, level: IsolationLevel) -> Self {
        self.transaction_isolation = Some(level);
        self
    }

    pub fn with_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_init_statement(mut self, statement: impl Into<String>) -> Self {
        self.init_statement = Some(statement.into());
        self
    }

    /// Effective minimum idle count.
    pub fn min_idle(&self) -> usize {
        self.minimum_idle
            .unwrap_or(self.maximum_pool_size)
            .min(self.maximum_pool_size)
    }

    /// Check the configuration and normalize contradictory settings.
    ///
    /// Settings that cannot be honored together are adjusted with a warning;
    /// settings that leave the pool unusable are rejected.
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_connectionpool::PoolConfiguration;
    /// use std::time::Duration;
    ///
    /// let config = PoolConfiguration::new()
    ///     .with_max_pool_size(4)
    ///     .with_min_idle(8)
    ///     .validate()
    ///     .unwrap();
    /// assert_eq!(config.minimum_idle, Some(4));
    ///
    /// assert!(PoolConfiguration::new().with_max_pool_size(0).validate().is_err());
    /// ```
    pub fn validate(mut self) -> PoolResult<Self> {
        let pool = self.pool_name.clone();

        if self.maximum_pool_size == 0 {
            return Err(PoolError::InvalidConfiguration(
                "maximum_pool_size must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("connection_timeout", self.connection_timeout),
            ("validation_timeout", self.validation_timeout),
            ("housekeeping_period", self.housekeeping_period),
        ] {
            if value.is_zero() {
                return Err(PoolError::InvalidConfiguration(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if let Some(min_idle) = self.minimum_idle
            && min_idle > self.maximum_pool_size
        {
            tracing::warn!(pool = %pool, min_idle, max = self.maximum_pool_size,
                "minimum_idle exceeds maximum_pool_size, clamping");
            self.minimum_idle = Some(self.maximum_pool_size);
        }

        let lifetime = self.max_lifetime;
        if !lifetime.is_zero() {
            if !self.idle_timeout.is_zero() && self.idle_timeout >= lifetime {
                tracing::warn!(pool = %pool, "idle_timeout is not below max_lifetime, disabling it");
                self.idle_timeout = Duration::ZERO;
            }
            if !self.keepalive_time.is_zero() && self.keepalive_time >= lifetime {
                tracing::warn!(pool = %pool, "keepalive_time is not below max_lifetime, disabling it");
                self.keepalive_time = Duration::ZERO;
            }
            if !self.leak_detection_threshold.is_zero() && self.leak_detection_threshold >= lifetime {
                tracing::warn!(pool = %pool, "leak_detection_threshold is not below max_lifetime, disabling it");
                self.leak_detection_threshold = Duration::ZERO;
            }
        }

        Ok(self)
    }
}

/// Settings that may be changed while the pool is running.
///
/// Writes become visible to `acquire` immediately and to the housekeeper
/// and leak detector on the next housekeeping run.
#[derive(Debug)]
pub struct Tunables {
    connection_timeout_ms: AtomicU64,
    idle_timeout_ms: AtomicU64,
    validation_timeout_ms: AtomicU64,
    leak_detection_threshold_ms: AtomicU64,
}

impl Tunables {
    pub(crate) fn from_config(config: &PoolConfiguration) -> Self {
        Self {
            connection_timeout_ms: AtomicU64::new(as_millis(config.connection_timeout)),
            idle_timeout_ms: AtomicU64::new(as_millis(config.idle_timeout)),
            validation_timeout_ms: AtomicU64::new(as_millis(config.validation_timeout)),
            leak_detection_threshold_ms: AtomicU64::new(as_millis(config.leak_detection_threshold)),
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_connection_timeout(&self, timeout: Duration) {
        if !timeout.is_zero() {
            self.connection_timeout_ms.store(as_millis(timeout), Ordering::Relaxed);
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_idle_timeout(&self, timeout: Duration) {
        self.idle_timeout_ms.store(as_millis(timeout), Ordering::Relaxed);
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_validation_timeout(&self, timeout: Duration) {
        if !timeout.is_zero() {
            self.validation_timeout_ms.store(as_millis(timeout), Ordering::Relaxed);
        }
    }

    pub fn leak_detection_threshold(&self) -> Duration {
        Duration::from_millis(self.leak_detection_threshold_ms.load(Ordering::Relaxed))
    }

    pub fn set_leak_detection_threshold(&self, threshold: Duration) {
        self.leak_detection_threshold_ms.store(as_millis(threshold), Ordering::Relaxed);
    }
}

fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_idle_defaults_to_max() {
        let config = PoolConfiguration::new().with_max_pool_size(7);
        assert_eq!(config.min_idle(), 7);
    }

    #[test]
    fn validate_disables_contradictory_timeouts() {
        let config = PoolConfiguration::new()
            .with_max_lifetime(Duration::from_secs(60))
            .with_idle_timeout(Duration::from_secs(120))
            .with_keepalive_time(Duration::from_secs(60))
            .with_leak_detection_threshold(Duration::from_secs(90))
            .validate()
            .unwrap();

        assert!(config.idle_timeout.is_zero());
        assert!(config.keepalive_time.is_zero());
        assert!(config.leak_detection_threshold.is_zero());
    }

    #[test]
    fn validate_keeps_timeouts_when_lifetime_disabled() {
        let config = PoolConfiguration::new()
            .with_max_lifetime(Duration::ZERO)
            .with_idle_timeout(Duration::from_secs(120))
            .validate()
            .unwrap();
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
    }

    #[test]
    fn validate_rejects_zero_timeouts() {
        let err = PoolConfiguration::new()
            .with_connection_timeout(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfiguration(msg) if msg.contains("connection_timeout")));
    }

    #[test]
    fn tunables_ignore_zero_connection_timeout() {
        let tunables = Tunables::from_config(&PoolConfiguration::default());
        tunables.set_connection_timeout(Duration::ZERO);
        assert_eq!(tunables.connection_timeout(), Duration::from_secs(30));
        tunables.set_connection_timeout(Duration::from_millis(750));
        assert_eq!(tunables.connection_timeout(), Duration::from_millis(750));
    }
}
