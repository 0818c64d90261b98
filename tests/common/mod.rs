//! Scriptable in-memory factory shared by the integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use esox_connectionpool::{
    AbortHandle, PoolConfiguration, ResourceError, ResourceFactory, SessionProperty,
};
use parking_lot::Mutex;

#[derive(Debug)]
pub struct MockConnection {
    pub id: u64,
    pub queries: Vec<String>,
    aborted: Arc<AtomicBool>,
}

impl MockConnection {
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MockState {
    next_id: AtomicU64,
    pub created: AtomicUsize,
    pub closed: AtomicUsize,
    pub aborted: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub down: AtomicBool,
    pub setup_broken: AtomicBool,
    pub dead: Mutex<HashSet<u64>>,
    pub property_calls: Mutex<Vec<(u64, SessionProperty)>>,
    pub init_statements: Mutex<Vec<String>>,
    pub create_delay: Mutex<Option<Duration>>,
    pub hung: AtomicBool,
}

impl MockState {
    pub fn live(&self) -> usize {
        self.created.load(Ordering::SeqCst) - self.closed.load(Ordering::SeqCst)
    }

    pub fn kill(&self, id: u64) {
        self.dead.lock().insert(id);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Property calls made against one connection
    pub fn calls_for(&self, id: u64) -> Vec<SessionProperty> {
        self.property_calls
            .lock()
            .iter()
            .filter(|(conn, _)| *conn == id)
            .map(|(_, property)| property.clone())
            .collect()
    }

    pub fn clear_calls(&self) {
        self.property_calls.lock().clear();
    }
}

#[derive(Clone, Default)]
pub struct MockFactory {
    pub state: Arc<MockState>,
    pub network_timeout: Option<Duration>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_network_timeout(timeout: Duration) -> Self {
        Self { network_timeout: Some(timeout), ..Self::default() }
    }
}

#[derive(Debug)]
pub struct Refused;

impl std::fmt::Display for Refused {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("connection refused")
    }
}

impl std::error::Error for Refused {}

impl ResourceFactory for MockFactory {
    type Resource = MockConnection;

    fn create(&self) -> Result<MockConnection, ResourceError> {
        if let Some(delay) = *self.state.create_delay.lock() {
            std::thread::sleep(delay);
        }
        if self.state.down.load(Ordering::SeqCst) {
            return Err(Box::new(Refused));
        }
        self.state.created.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            id: self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            queries: Vec::new(),
            aborted: Arc::new(AtomicBool::new(false)),
        })
    }

    fn is_alive(&self, conn: &mut MockConnection, timeout: Duration) -> bool {
        if self.state.hung.load(Ordering::SeqCst) {
            std::thread::sleep(timeout);
            return false;
        }
        !conn.is_aborted() && !self.state.dead.lock().contains(&conn.id)
    }

    fn close(&self, _conn: MockConnection) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn set_session_property(
        &self,
        conn: &mut MockConnection,
        property: &SessionProperty,
    ) -> Result<(), ResourceError> {
        if self.state.setup_broken.load(Ordering::SeqCst) {
            return Err("session setup rejected".into());
        }
        self.state.property_calls.lock().push((conn.id, property.clone()));
        Ok(())
    }

    fn run_init_statement(&self, _conn: &mut MockConnection, statement: &str) -> Result<(), ResourceError> {
        self.state.init_statements.lock().push(statement.to_string());
        Ok(())
    }

    fn rollback(&self, _conn: &mut MockConnection) -> Result<(), ResourceError> {
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn network_timeout(&self, _conn: &mut MockConnection) -> Option<Duration> {
        self.network_timeout
    }

    fn is_fatal(&self, error: &ResourceError) -> bool {
        error.to_string().contains("broken pipe")
    }

    fn abort_handle(&self, conn: &MockConnection) -> Option<AbortHandle> {
        let flag = Arc::clone(&conn.aborted);
        let state = Arc::clone(&self.state);
        Some(Box::new(move || {
            flag.store(true, Ordering::SeqCst);
            state.aborted.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

/// Small pool that skips the startup check and never sweeps during a test.
pub fn config(max: usize) -> PoolConfiguration {
    PoolConfiguration::new()
        .with_pool_name("test-pool")
        .with_max_pool_size(max)
        .with_min_idle(0)
        .with_connection_timeout(Duration::from_millis(500))
        .with_housekeeping_period(Duration::from_secs(3600))
        .with_initialization_fail_timeout(None)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
