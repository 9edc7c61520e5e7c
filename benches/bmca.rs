use criterion::{black_box, criterion_group, criterion_main, Criterion};

use gptp_core::core::{ClockIdentity, ClockQuality, Dataset, PortIdentity};
use gptp_core::protocol::bmca::{compare_datasets, BmcaEngine};

fn foreign_masters(count: u8) -> Vec<Dataset> {
    (1..=count)
        .map(|i| Dataset {
            grandmaster_identity: ClockIdentity([i; 8]),
            grandmaster_quality: ClockQuality {
                clock_class: 248 - (i % 4),
                clock_accuracy: 0x20 + i,
                offset_scaled_log_variance: 0x4E5D,
            },
            priority1: 128 + (i % 3),
            priority2: 248,
            steps_removed: u16::from(i % 5),
            sender: PortIdentity::new(ClockIdentity([i; 8]), 1),
            receiver_port: 1,
        })
        .collect()
}

fn bench_select(c: &mut Criterion) {
    let local = Dataset::local(
        PortIdentity::new(ClockIdentity([0xF0; 8]), 1),
        ClockQuality::default(),
        248,
        248,
    );
    let foreign = foreign_masters(16);
    let mut engine = BmcaEngine::new(1);

    c.bench_function("bmca_select_16", |b| {
        b.iter(|| engine.select(black_box(&local), black_box(&foreign)))
    });

    c.bench_function("bmca_compare", |b| {
        b.iter(|| compare_datasets(black_box(&foreign[0]), black_box(&foreign[15])))
    });
}

criterion_group!(benches, bench_select);
criterion_main!(benches);
