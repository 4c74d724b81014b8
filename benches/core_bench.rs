//! Criterion benchmarks for hot paths in the strand core.
//!
//! Run with:
//!   cargo bench
//!
//! Covers:
//!   - Context submit/drain throughput (queue hop + ambient wrapping)
//!   - Pool acquire/complete cycle against a null transport

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use strand::{
    CodecEvent, ConnectionPool, CoreConfig, CoreError, EndpointKey, PoolOptions, Runtime,
    Transport, TransportConn,
};
use tokio::sync::oneshot;

struct NullConn;

impl TransportConn for NullConn {
    fn write(&self, _bytes: &[u8]) -> Result<(), CoreError> {
        Ok(())
    }
    fn close(&self) {}
}

struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn connect(&self, _key: &EndpointKey) -> Result<Box<dyn TransportConn>, CoreError> {
        Ok(Box::new(NullConn))
    }
}

fn small_config() -> CoreConfig {
    let mut config = CoreConfig::default();
    config.event_workers = 1;
    config
}

// ─── Context submit ──────────────────────────────────────────────────────────

fn bench_context_submit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let core = rt.block_on(async { Runtime::new(small_config()).unwrap() });
    let ctx = core.create_event_context();

    c.bench_function("context_submit_drain_1000", |b| {
        b.iter(|| {
            rt.block_on(async {
                let counter = Arc::new(AtomicU64::new(0));
                for _ in 0..1000 {
                    let counter = counter.clone();
                    ctx.submit(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
                let (tx, rx) = oneshot::channel();
                ctx.submit(move || {
                    let _ = tx.send(());
                });
                rx.await.unwrap();
                black_box(counter.load(Ordering::Relaxed));
            });
        });
    });
}

// ─── Pool acquire/complete ───────────────────────────────────────────────────

fn bench_pool_cycle(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let core = rt.block_on(async { Runtime::new(small_config()).unwrap() });
    let pool = ConnectionPool::new(
        Arc::new(NullTransport),
        PoolOptions::default(),
        core.create_event_context(),
    );
    let key = EndpointKey::plain("bench.local", 9);

    c.bench_function("pool_acquire_complete", |b| {
        b.iter(|| {
            rt.block_on(async {
                let lease = pool.acquire_wait(key.clone(), None).await.unwrap();
                pool.codec_event(
                    lease.connection_id(),
                    CodecEvent::ResponseComplete {
                        request: lease.request_id(),
                    },
                );
                black_box(lease.connection_id());
            });
        });
    });
}

criterion_group!(benches, bench_context_submit, bench_pool_cycle);
criterion_main!(benches);
