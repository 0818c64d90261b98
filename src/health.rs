//! Health snapshot for connection pools

use crate::metrics::PoolMetrics;

/// Utilization above which the pool reports itself unhealthy.
const HIGH_UTILIZATION: f64 = 0.9;

/// Health status of a connection pool
///
/// # Examples
///
/// ```
/// use esox_connectionpool::{HealthStatus, PoolMetrics};
///
/// let metrics = PoolMetrics { active: 1, idle: 2, total: 3, maximum_pool_size: 10, ..Default::default() };
/// let health = HealthStatus::new(&metrics, None);
/// assert!(health.is_healthy());
/// assert!(health.warnings.is_empty());
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct HealthStatus {
    /// Whether the pool is healthy
    pub is_healthy: bool,

    /// Number of warnings detected
    pub warning_count: usize,

    /// Current pool utilization (0.0 to 1.0)
    pub utilization: f64,

    /// Idle resources
    pub idle: usize,

    /// Checked-out resources
    pub active: usize,

    /// Threads waiting for a resource
    pub waiting: usize,

    /// Maximum pool size
    pub total_capacity: usize,

    /// Message of the most recent resource creation failure, if creation is
    /// currently failing
    pub last_failure: Option<String>,

    /// Warning messages
    pub warnings: Vec<String>,
}

impl HealthStatus {
    /// Derive a health status from a metrics snapshot
    pub fn new(metrics: &PoolMetrics, last_failure: Option<String>) -> Self {
        let utilization = metrics.utilization();
        let mut warnings = Vec::new();
        let mut is_healthy = true;

        if utilization > HIGH_UTILIZATION {
            warnings.push(format!("High utilization: {:.1}%", utilization * 100.0));
            is_healthy = false;
        }

        if metrics.waiting > 0 {
            warnings.push(format!("{} thread(s) waiting for a resource", metrics.waiting));
        }

        if let Some(failure) = &last_failure {
            warnings.push(format!("Resource creation failing: {failure}"));
            if metrics.total == 0 {
                is_healthy = false;
            }
        }

        Self {
            is_healthy,
            warning_count: warnings.len(),
            utilization,
            idle: metrics.idle,
            active: metrics.active,
            waiting: metrics.waiting,
            total_capacity: metrics.maximum_pool_size,
            last_failure,
            warnings,
        }
    }

    /// Check if the pool is healthy
    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturated_pool_is_unhealthy() {
        let metrics = PoolMetrics {
            active: 10,
            total: 10,
            waiting: 3,
            maximum_pool_size: 10,
            ..Default::default()
        };
        let health = HealthStatus::new(&metrics, None);
        assert!(!health.is_healthy());
        assert_eq!(health.warning_count, 2);
    }

    #[test]
    fn failing_creation_with_empty_pool_is_unhealthy() {
        let metrics = PoolMetrics { maximum_pool_size: 4, ..Default::default() };
        let health = HealthStatus::new(&metrics, Some("connection refused".to_string()));
        assert!(!health.is_healthy());
        assert!(health.warnings[0].contains("connection refused"));
    }
}
