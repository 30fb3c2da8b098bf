use criterion::{black_box, criterion_group, criterion_main, Criterion};

use hashed_wheel_timer::Timer;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SCHEDULE_AMOUNT: usize = 10_000;

fn bench_schedule(c: &mut Criterion) {
    let timer = Timer::builder()
        .tick_duration(Duration::from_millis(10))
        .ticks_per_wheel(4096)
        .build()
        .unwrap();

    c.bench_function("schedule 10k long-delay timeouts", |b| {
        b.iter(|| {
            let mut handles = Vec::with_capacity(SCHEDULE_AMOUNT);
            for _ in 0..SCHEDULE_AMOUNT {
                let handle = timer
                    .schedule(Box::new(|_| {}), Duration::from_secs(3600))
                    .unwrap();
                handles.push(black_box(handle));
            }
            for handle in handles {
                handle.cancel();
            }
        });
    });

    timer.stop().unwrap();
}

fn bench_cancel(c: &mut Criterion) {
    let timer = Timer::builder()
        .tick_duration(Duration::from_millis(10))
        .ticks_per_wheel(4096)
        .build()
        .unwrap();

    c.bench_function("cancel 10k pending timeouts", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..SCHEDULE_AMOUNT)
                .map(|_| {
                    timer
                        .schedule(Box::new(|_| {}), Duration::from_secs(3600))
                        .unwrap()
                })
                .collect();
            for handle in handles {
                black_box(handle.cancel());
            }
        });
    });

    timer.stop().unwrap();
}

fn bench_fire_throughput(c: &mut Criterion) {
    c.bench_function("fire 1k short-delay timeouts", |b| {
        b.iter(|| {
            let timer = Timer::builder()
                .tick_duration(Duration::from_millis(1))
                .ticks_per_wheel(256)
                .build()
                .unwrap();

            let fired = Arc::new(AtomicUsize::new(0));
            for _ in 0..1_000 {
                let fired2 = fired.clone();
                timer
                    .schedule(
                        Box::new(move |_| {
                            fired2.fetch_add(1, Ordering::SeqCst);
                        }),
                        Duration::from_millis(1),
                    )
                    .unwrap();
            }

            while fired.load(Ordering::SeqCst) < 1_000 {
                std::thread::yield_now();
            }

            timer.stop().unwrap();
        });
    });
}

criterion_group!(benches, bench_schedule, bench_cancel, bench_fire_throughput);
criterion_main!(benches);
