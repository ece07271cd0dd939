use comlink::{
    codec::Codec,
    framing::{Framer, FramingMode},
    Envelope, Message,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct Quote {
    symbol: String,
    bid: f64,
    ask: f64,
    venue: String,
}

impl Message for Quote {
    const TAG: &'static str = "Quote";
}

fn quote(n: usize) -> Quote {
    Quote {
        symbol: format!("SYM{n}"),
        bid: n as f64 * 0.5,
        ask: n as f64 * 0.5 + 0.01,
        venue: "loopback".to_string(),
    }
}

fn encoded(mode: FramingMode, count: usize) -> Vec<u8> {
    let codec = Codec::new();
    (0..count)
        .flat_map(|n| {
            let envelope = Envelope::wrap(&quote(n)).unwrap();
            mode.frame(codec.serialize(&envelope).unwrap()).into_bytes()
        })
        .collect()
}

fn framing_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("framer");
    for mode in [FramingMode::Line, FramingMode::Boundary] {
        let bytes = encoded(mode, 1_000);
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        for chunk_size in [64, 1_024, 16_384] {
            group.bench_with_input(
                BenchmarkId::new(format!("{mode:?}"), chunk_size),
                &chunk_size,
                |b, &chunk_size| {
                    b.iter(|| {
                        let mut framer = Framer::new(mode);
                        let mut units = 0;
                        for chunk in bytes.chunks(chunk_size) {
                            units += framer.feed(chunk).len();
                        }
                        assert_eq!(units, 1_000);
                    })
                },
            );
        }
    }
    group.finish();
}

fn codec_benchmarks(c: &mut Criterion) {
    let codec = Codec::new();
    let envelope = Envelope::wrap(&quote(42)).unwrap();
    let wire = codec.serialize(&envelope).unwrap();

    c.bench_function("codec_serialize", |b| {
        b.iter(|| codec.serialize(&envelope).unwrap())
    });
    c.bench_function("codec_deserialize", |b| {
        b.iter(|| codec.deserialize(&wire).unwrap())
    });
}

criterion_group!(benches, framing_benchmarks, codec_benchmarks);
criterion_main!(benches);
