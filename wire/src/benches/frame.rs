use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::io::Cursor;
use tiercache_wire::{
    encode_response, recv_frame, send_frame, Kind, Outgoing, DEFAULT_MAX_PAYLOAD,
};

fn bench_frame(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(42);
    for size in [4 * 1024, 64 * 1024, 1024 * 1024] {
        let mut payload = vec![0u8; size];
        rng.fill_bytes(&mut payload);
        let encoded = encode_response(1, 0, Bytes::from(payload)).unwrap();

        let mut group = c.benchmark_group(module_path!());
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("send/size={size}"), |b| {
            b.iter_batched(
                || (Outgoing::from_encoded(encoded.clone()), Vec::with_capacity(encoded.len())),
                |(mut frame, mut sink)| send_frame(&mut sink, &mut frame).unwrap(),
                BatchSize::SmallInput,
            )
        });
        group.bench_function(format!("recv/size={size}"), |b| {
            b.iter_batched(
                || Cursor::new(encoded.clone()),
                |mut source| recv_frame(&mut source, Kind::Response, DEFAULT_MAX_PAYLOAD).unwrap(),
                BatchSize::SmallInput,
            )
        });
        group.finish();
    }
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(20);
    targets = bench_frame
}
criterion_main!(benches);
