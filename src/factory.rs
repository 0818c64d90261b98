//! The pluggable resource collaborator

use std::fmt;
use std::time::Duration;

use crate::errors::ResourceError;

/// Callback that breaks a resource from another thread, for example by
/// shutting down a cloned socket. Used only during forced shutdown.
pub type AbortHandle = Box<dyn Fn() + Send + Sync>;

/// Transaction isolation level of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        };
        f.write_str(name)
    }
}

/// A mutable session property of a pooled resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionProperty {
    ReadOnly(bool),
    AutoCommit(bool),
    Isolation(Option<IsolationLevel>),
    Catalog(Option<String>),
    Schema(Option<String>),
    NetworkTimeout(Duration),
}

/// Creates, checks and destroys the resources held by a pool.
///
/// The pool never speaks the resource's protocol itself; everything it
/// needs goes through this trait.
///
/// # Examples
///
/// ```
/// use esox_connectionpool::{ResourceError, ResourceFactory, SessionProperty};
/// use std::time::Duration;
///
/// struct Numbers;
///
/// impl ResourceFactory for Numbers {
///     type Resource = u32;
///
///     fn create(&self) -> Result<u32, ResourceError> {
///         Ok(42)
///     }
///
///     fn is_alive(&self, _resource: &mut u32, _timeout: Duration) -> bool {
///         true
///     }
///
///     fn close(&self, _resource: u32) {}
///
///     fn set_session_property(
///         &self,
///         _resource: &mut u32,
///         _property: &SessionProperty,
///     ) -> Result<(), ResourceError> {
///         Ok(())
///     }
/// }
/// ```
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + 'static;

    /// Open a new resource.
    fn create(&self) -> Result<Self::Resource, ResourceError>;

    /// Liveness check, bounded by `timeout`.
    fn is_alive(&self, resource: &mut Self::Resource, timeout: Duration) -> bool;

    /// Release the resource. Errors are the factory's to log.
    fn close(&self, resource: Self::Resource);

    fn set_session_property(
        &self,
        resource: &mut Self::Resource,
        property: &SessionProperty,
    ) -> Result<(), ResourceError>;

    fn run_init_statement(
        &self,
        _resource: &mut Self::Resource,
        _statement: &str,
    ) -> Result<(), ResourceError> {
        Ok(())
    }

    fn commit(&self, _resource: &mut Self::Resource) -> Result<(), ResourceError> {
        Ok(())
    }

    fn rollback(&self, _resource: &mut Self::Resource) -> Result<(), ResourceError> {
        Ok(())
    }

    /// Current network timeout, or `None` when the resource has no such
    /// notion. Probed once per pool.
    fn network_timeout(&self, _resource: &mut Self::Resource) -> Option<Duration> {
        None
    }

    /// Whether an error raised while using a resource means the resource is
    /// broken and must not be reused.
    fn is_fatal(&self, _error: &ResourceError) -> bool {
        false
    }

    fn abort_handle(&self, _resource: &Self::Resource) -> Option<AbortHandle> {
        None
    }
}
