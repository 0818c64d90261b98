//! Basic usage examples for ResourcePool

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use esox_connectionpool::{
    MetricsExporter, PoolConfiguration, ResourceError, ResourceFactory, ResourcePool, SessionProperty,
};

/// Pretend database connection
#[derive(Debug)]
struct Connection {
    id: u32,
    read_only: bool,
}

#[derive(Default)]
struct ConnectionFactory {
    next_id: AtomicU32,
}

impl ResourceFactory for ConnectionFactory {
    type Resource = Connection;

    fn create(&self) -> Result<Connection, ResourceError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Connection { id, read_only: false })
    }

    fn is_alive(&self, _conn: &mut Connection, _timeout: Duration) -> bool {
        true
    }

    fn close(&self, conn: Connection) {
        println!("   (closing connection {})", conn.id);
    }

    fn set_session_property(&self, conn: &mut Connection, property: &SessionProperty) -> Result<(), ResourceError> {
        if let SessionProperty::ReadOnly(read_only) = property {
            conn.read_only = *read_only;
        }
        Ok(())
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== Esox Connection Pool - Basic Examples ===\n");

    let config = PoolConfiguration::new()
        .with_pool_name("demo")
        .with_max_pool_size(3)
        .with_min_idle(1)
        .with_connection_timeout(Duration::from_millis(250));
    let pool = ResourcePool::new(ConnectionFactory::default(), config).unwrap();

    // Example 1: Simple checkout
    simple_checkout(&pool);

    // Example 2: Session properties are reset on return
    session_reset(&pool);

    // Example 3: Exhausting the pool
    exhaustion(&pool);

    // Example 4: Metrics and health
    metrics_and_health(&pool);

    pool.shutdown();
    println!("Pool shut down, total resources: {}", pool.total_count());
}

fn simple_checkout(pool: &ResourcePool<ConnectionFactory>) {
    println!("1. Simple checkout:");
    {
        let conn = pool.acquire().unwrap();
        println!("   Got connection {}", conn.id);
        println!("   Active: {}", pool.active_count());
        // Returned when dropped
    }
    println!("   Idle after return: {}\n", pool.idle_count());
}

fn session_reset(pool: &ResourcePool<ConnectionFactory>) {
    println!("2. Session reset:");
    {
        let mut conn = pool.acquire().unwrap();
        conn.set_read_only(true).unwrap();
        println!("   Connection {} read-only: {}", conn.id, conn.read_only);
    }
    let conn = pool.acquire().unwrap();
    println!("   Connection {} read-only after reuse: {}\n", conn.id, conn.read_only);
}

fn exhaustion(pool: &ResourcePool<ConnectionFactory>) {
    println!("3. Exhaustion:");
    let held: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
    match pool.acquire() {
        Ok(_) => println!("   Unexpected extra connection"),
        Err(err) => println!("   Fourth acquire failed: {err}"),
    }
    drop(held);
    println!("   Idle after return: {}\n", pool.idle_count());
}

fn metrics_and_health(pool: &ResourcePool<ConnectionFactory>) {
    println!("4. Metrics and health:");
    let metrics = pool.metrics();
    println!("   Acquired: {}", metrics.total_acquired);
    println!("   Timeouts: {}", metrics.acquire_timeouts);
    println!("   Utilization: {:.1}%", metrics.utilization() * 100.0);

    let health = pool.health();
    println!("   Healthy: {}", health.is_healthy());

    let exported = MetricsExporter::export_prometheus(&metrics, pool.name(), None);
    println!("   Prometheus lines: {}\n", exported.lines().count());
}
