//! Full send → deliver → release cycles between two instances in one thread.

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use icbmsg_core::InstanceConfig;
use icbmsg_perf::LinkedPair;

const REGION_SIZE: usize = 4096;

fn bench_send_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("link");
    group.throughput(Throughput::Elements(1));

    for &size in &[4usize, 64, 200] {
        let mut pair = LinkedPair::new(REGION_SIZE, InstanceConfig::default());
        let payload = vec![0xa5u8; size];
        let ept = pair.initiator_ept;

        group.bench_function(format!("send+pump_{size}B"), |b| {
            b.iter(|| {
                pair.initiator.send(ept, black_box(&payload)).expect("send");
                pair.pump();
            });
        });
    }

    drop(group);
}

fn bench_zero_copy(c: &mut Criterion) {
    let mut group = c.benchmark_group("link");
    group.throughput(Throughput::Elements(1));

    let mut pair = LinkedPair::new(REGION_SIZE, InstanceConfig::default());
    let ept = pair.initiator_ept;
    let payload = [0x3cu8; 64];

    group.bench_function("alloc+send_buf+pump_64B", |b| {
        b.iter(|| {
            let buf = pair.initiator.alloc_tx_buf(512).expect("alloc");
            pair.initiator.tx_buf_write(&buf, 0, &payload).expect("write");
            pair.initiator.send_buf(ept, buf, payload.len()).expect("send");
            pair.pump();
        });
    });

    drop(group);
}

fn bench_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("link");
    group.throughput(Throughput::Elements(16));

    let mut pair = LinkedPair::new(REGION_SIZE, InstanceConfig::default());
    let ept = pair.follower_ept;

    group.bench_function("burst_16x8B", |b| {
        b.iter(|| {
            for seq in 0..16u64 {
                pair.follower.send(ept, &seq.to_le_bytes()).expect("send");
            }
            pair.pump();
        });
    });

    drop(group);
}

criterion_group!(benches, bench_send_round_trip, bench_zero_copy, bench_burst);
criterion_main!(benches);
