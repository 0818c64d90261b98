//! # Esox Connection Pool
//!
//! High-performance, thread-safe pool of exclusive, reusable resources such
//! as database connections, with bounded waits, background maintenance and
//! automatic session reset.
//!
//! ## Features
//!
//! - Exclusive checkouts returned automatically via RAII (Drop trait)
//! - Hand-off of returned resources directly to waiting threads
//! - On-demand growth with background creation and backoff
//! - Idle timeout, max lifetime and keepalive maintenance
//! - Liveness checks before reuse, with transparent replacement
//! - Dirty-bit tracking so only changed session properties are reset
//! - Leak detection with checkout backtraces
//! - Suspend/resume and bounded, forced shutdown
//! - Async acquisition on Tokio
//! - Health monitoring, metrics and Prometheus export
//!
//! ## Quick Start
//!
//! ```rust
//! use esox_connectionpool::{PoolConfiguration, ResourceError, ResourceFactory, ResourcePool, SessionProperty};
//! use std::time::Duration;
//!
//! struct Connections;
//!
//! impl ResourceFactory for Connections {
//!     type Resource = String;
//!
//!     fn create(&self) -> Result<String, ResourceError> {
//!         Ok("connection".to_string())
//!     }
//!
//!     fn is_alive(&self, _conn: &mut String, _timeout: Duration) -> bool {
//!         true
//!     }
//!
//!     fn close(&self, _conn: String) {}
//!
//!     fn set_session_property(&self, _: &mut String, _: &SessionProperty) -> Result<(), ResourceError> {
//!         Ok(())
//!     }
//! }
//!
//! let pool = ResourcePool::new(Connections, PoolConfiguration::new().with_max_pool_size(4)).unwrap();
//! {
//!     let conn = pool.acquire().unwrap();
//!     println!("Got: {}", *conn);
//!     // Resource automatically returned when `conn` goes out of scope
//! }
//! pool.shutdown();
//! ```

mod bag;
mod config;
mod entry;
mod errors;
mod executor;
mod factory;
mod handle;
mod health;
mod housekeeper;
mod leak;
mod metrics;
mod pool;
mod scheduler;
mod suspend;

pub use bag::EntryState;
pub use config::{PoolConfiguration, Tunables};
pub use errors::{PoolError, PoolResult, ResourceError, SharedResourceError};
pub use factory::{AbortHandle, IsolationLevel, ResourceFactory, SessionProperty};
pub use handle::{DirtyBits, PooledResource};
pub use health::HealthStatus;
#[cfg(feature = "prometheus")]
pub use metrics::PoolCollector;
pub use metrics::{MetricsExporter, PoolMetrics};
pub use pool::{PoolState, ResourcePool};
