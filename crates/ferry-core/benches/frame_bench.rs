//! Mux and length-prefixed frame codec benchmarks.
//!
//! Run with: `cargo bench -p ferry-core frame`

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ferry_core::framed::{FrameDecoder, encode_frame};
use ferry_core::mux::{Flag, Frame};

const SIZES: [usize; 5] = [64, 1024, 16 * 1024, 64 * 1024, 1024 * 1024];

fn bench_mux_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("mux_frame_encode");

    for size in SIZES {
        let frame = Frame::new(42, Flag::MessageInitiator, vec![0xAA; size]);
        let mut out = Vec::with_capacity(size + 16);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| {
                out.clear();
                black_box(frame).encode(&mut out);
            })
        });
    }

    group.finish();
}

fn bench_mux_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("mux_frame_decode");

    for size in SIZES {
        let mut wire = Vec::new();
        Frame::new(42, Flag::MessageReceiver, vec![0xBB; size]).encode(&mut wire);

        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, wire| {
            b.iter(|| Frame::decode(black_box(wire), 1024 * 1024))
        });
    }

    group.finish();
}

fn bench_length_prefixed_stream(c: &mut Criterion) {
    let mut wire = Vec::new();
    for _ in 0..64 {
        encode_frame(&[0x42; 1024], &mut wire);
    }

    let mut group = c.benchmark_group("length_prefixed");
    group.throughput(Throughput::Bytes(wire.len() as u64));

    // Fed in 1500-byte pieces, as a TCP stream would deliver it
    group.bench_function("decode_64x1KiB_fragmented", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new(64 * 1024);
            let mut frames = 0;
            for piece in wire.chunks(1500) {
                decoder.push(piece);
                while let Ok(Some(_)) = decoder.next_frame() {
                    frames += 1;
                }
            }
            black_box(frames)
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_mux_encode,
    bench_mux_decode,
    bench_length_prefixed_stream
);
criterion_main!(benches);
