use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use jalop_core::DigestMethod;

fn bench_digest(c: &mut Criterion) {
    let data = vec![0x5au8; 1 << 20];
    let mut group = c.benchmark_group("digest_1mib");
    group.throughput(Throughput::Bytes(data.len() as u64));
    for method in DigestMethod::ALL {
        group.bench_function(method.name(), |b| {
            b.iter(|| {
                let mut d = method.digester();
                for chunk in data.chunks(jalop_core::CHUNK_SIZE) {
                    d.update(black_box(chunk));
                }
                d.finish()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_digest);
criterion_main!(benches);
