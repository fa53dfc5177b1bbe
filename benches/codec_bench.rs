use criterion::{black_box, criterion_group, criterion_main, Criterion};
use emaildb::codec::{get_compressor, CompressionAlgorithm};

/// A 1 MiB email-like corpus: headers plus repetitive quoted text.
fn corpus() -> Vec<u8> {
    let mut data = Vec::with_capacity(1024 * 1024);
    let mut n = 0usize;
    while data.len() < 1024 * 1024 {
        data.extend_from_slice(
            format!(
                "From: sender{n}@example.com\r\nSubject: weekly report {n}\r\n\r\n\
                 > On Monday the pipeline processed {n} messages without incident.\r\n"
            )
            .as_bytes(),
        );
        n += 1;
    }
    data.truncate(1024 * 1024);
    data
}

fn bench_compression(c: &mut Criterion) {
    let data = corpus();
    for algorithm in [
        CompressionAlgorithm::Gzip,
        CompressionAlgorithm::Lz4,
        CompressionAlgorithm::Zstd,
        CompressionAlgorithm::Brotli,
    ] {
        let compressor = get_compressor(algorithm);
        c.bench_function(&format!("{}_compress_1mb", algorithm.name()), |b| {
            b.iter(|| compressor.compress(black_box(&data), 3))
        });
    }
}

criterion_group!(benches, bench_compression);
criterion_main!(benches);
