//! Error types for the connection pool

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Error type produced by a [`ResourceFactory`](crate::ResourceFactory).
pub type ResourceError = Box<dyn StdError + Send + Sync>;

/// Shared form of a [`ResourceError`], kept inside [`PoolError`] so the
/// error stays cheap to clone.
pub type SharedResourceError = Arc<dyn StdError + Send + Sync>;

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("Resource is not available, acquire timed out after {}ms{}", .timeout.as_millis(), describe_failure(.last_failure))]
    AcquireTimeout {
        timeout: Duration,
        #[source]
        last_failure: Option<SharedResourceError>,
    },

    #[error("Pool has been shut down")]
    PoolClosed,

    #[error("Failed to initialize pool: {source}")]
    PoolInitialization {
        #[source]
        source: SharedResourceError,
    },

    #[error("Failed to set up a newly created resource: {source}")]
    ResourceSetup {
        #[source]
        source: SharedResourceError,
    },

    #[error("Resource validation failed")]
    Validation,

    #[error("Resource operation failed: {source}")]
    Resource {
        #[source]
        source: SharedResourceError,
    },

    #[error("Handle is closed")]
    HandleClosed,

    #[error("Pool is not configured to allow suspension")]
    SuspensionNotAllowed,

    #[error("Invalid pool configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Operation was cancelled")]
    Cancelled,
}

impl PoolError {
    pub(crate) fn resource(err: ResourceError) -> Self {
        PoolError::Resource { source: Arc::from(err) }
    }

    /// True for the errors a caller sees from normal operation.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PoolError::AcquireTimeout { .. })
    }
}

fn describe_failure(failure: &Option<SharedResourceError>) -> String {
    match failure {
        Some(err) => format!(" (last creation failure: {err})"),
        None => String::new(),
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
