use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use anvil_interpreter::config::ChannelKind;
use anvil_interpreter::{
    Channel, ConfigBuilder, Elemwise, ElemwiseMode, HostTensor, Interpreter, OpDef,
};

fn channel(kind: ChannelKind) -> Arc<dyn Channel> {
    let config = ConfigBuilder::new()
        .channel(|c| c.kind = kind)
        .build()
        .unwrap();
    Interpreter::with_reference_kernel(config)
        .unwrap()
        .create_channel()
        .unwrap()
}

fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_chain");
    let op: Arc<dyn OpDef> = Arc::new(Elemwise::new(ElemwiseMode::AddScalar(1.0)));

    for (name, kind) in [("worker", ChannelKind::Worker), ("inline", ChannelKind::Inline)] {
        for len in [16usize, 4096] {
            let channel = channel(kind);
            let input = HostTensor::from_f32([len], vec![0.0; len]).unwrap();
            group.bench_with_input(BenchmarkId::new(name, len), &len, |b, _| {
                b.iter(|| {
                    let mut current = channel.put(input.clone(), true).unwrap();
                    for _ in 0..32 {
                        let next = channel.apply_op(op.clone(), &[current]).unwrap()[0];
                        channel.del(current).unwrap();
                        current = next;
                    }
                    let value = channel.get_value(current).unwrap();
                    channel.del(current).unwrap();
                    black_box(value)
                })
            });
        }
    }
    group.finish();
}

fn bench_put(c: &mut Criterion) {
    let channel = channel(ChannelKind::Worker);
    let value = HostTensor::from_f32([8], vec![1.0; 8]).unwrap();

    c.bench_function("put_cached", |b| {
        b.iter(|| {
            let handle = channel.put(black_box(value.clone()), false).unwrap();
            channel.del(handle).unwrap();
        })
    });
    c.bench_function("put_uncached", |b| {
        b.iter(|| {
            let handle = channel.put(black_box(value.clone()), true).unwrap();
            channel.del(handle).unwrap();
        })
    });
}

criterion_group!(benches, bench_chain, bench_put);
criterion_main!(benches);
