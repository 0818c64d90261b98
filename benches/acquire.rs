// Pool acquire/return overhead with a zero-cost resource.

use std::hint::black_box;
use std::thread;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use esox_connectionpool::{PoolConfiguration, ResourceError, ResourceFactory, ResourcePool, SessionProperty};

struct NoOpFactory;

impl ResourceFactory for NoOpFactory {
    type Resource = u64;

    fn create(&self) -> Result<u64, ResourceError> {
        Ok(0)
    }

    fn is_alive(&self, _resource: &mut u64, _timeout: Duration) -> bool {
        true
    }

    fn close(&self, _resource: u64) {}

    fn set_session_property(&self, _: &mut u64, _: &SessionProperty) -> Result<(), ResourceError> {
        Ok(())
    }
}

fn pool(max: usize) -> ResourcePool<NoOpFactory> {
    let config = PoolConfiguration::new()
        .with_pool_name("bench")
        .with_max_pool_size(max)
        .with_connection_timeout(Duration::from_secs(5));
    let pool = ResourcePool::new(NoOpFactory, config).expect("failed to create pool");
    while pool.idle_count() < max {
        thread::sleep(Duration::from_millis(1));
    }
    pool
}

fn single_thread(c: &mut Criterion) {
    let pool = pool(8);
    c.bench_function("acquire_release", |b| {
        b.iter(|| {
            let conn = pool.acquire().unwrap();
            black_box(*conn);
        });
    });
    pool.shutdown();
}

fn contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_acquire_release");
    for threads in [2usize, 4, 8] {
        let pool = pool(4);
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                thread::scope(|scope| {
                    for _ in 0..threads {
                        scope.spawn(|| {
                            for _ in 0..100 {
                                let conn = pool.acquire().unwrap();
                                black_box(*conn);
                            }
                        });
                    }
                });
            });
        });
        pool.shutdown();
    }
    group.finish();
}

criterion_group!(benches, single_thread, contended);
criterion_main!(benches);
