use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::thread;
use telemetry_pipeline::{
    Batch, BatchConfig, Batcher, Consumer, DeliveryError, OverflowPolicy, Span, TraceIdRatioSampler,
};
use tokio::runtime::Runtime;

const RECORDS_PER_PRODUCER: u64 = 100_000;

struct Discard;

impl Consumer for Discard {
    async fn consume(&self, batch: Batch) -> Result<(), DeliveryError> {
        black_box(batch);
        Ok(())
    }

    fn name(&self) -> &str {
        "discard"
    }
}

fn span(i: u64) -> Span {
    Span::new(u128::from(i) + 1, i, "GET /users").with_times(1_000, 2_000)
}

fn config() -> BatchConfig {
    BatchConfig {
        send_batch_size: 512,
        max_queue_size: 1 << 16,
        overflow_policy: OverflowPolicy::Backpressure,
        ..BatchConfig::default()
    }
}

fn bench_ingest(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("batcher_ingest");

    for producers in [1u64, 4, 8] {
        group.throughput(Throughput::Elements(RECORDS_PER_PRODUCER * producers));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{producers}P")),
            &producers,
            |b, &n| {
                b.iter(|| {
                    let batcher = {
                        let _guard = rt.enter();
                        Arc::new(Batcher::spawn("bench", config(), Arc::new(Discard)))
                    };

                    let handles: Vec<_> = (0..n)
                        .map(|p| {
                            let batcher = Arc::clone(&batcher);
                            thread::spawn(move || {
                                let base = p * RECORDS_PER_PRODUCER;
                                for i in base..base + RECORDS_PER_PRODUCER {
                                    while batcher.add(span(i).into()).is_err() {
                                        std::hint::spin_loop();
                                    }
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }

                    rt.block_on(batcher.shutdown());
                    assert_eq!(batcher.metrics().records_flushed(), RECORDS_PER_PRODUCER * n);
                });
            },
        );
    }

    group.finish();
}

fn bench_sampler(c: &mut Criterion) {
    let sampler = TraceIdRatioSampler::new(0.25, 22).unwrap();
    let mut group = c.benchmark_group("sampler");
    group.throughput(Throughput::Elements(1));
    group.bench_function("decide", |b| {
        let mut trace_id = 1u128;
        b.iter(|| {
            trace_id = trace_id.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(1);
            black_box(sampler.decide(black_box(trace_id)))
        });
    });
    group.finish();
}

criterion_group!(benches, bench_ingest, bench_sampler);
criterion_main!(benches);
