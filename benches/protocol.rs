//! Benchmarks for wire-protocol parsing.

use atrium::protocol::{
    decode_frame_infos, ClientOpcode, Frame, FrameInfo, PacketParser, ParseOutcome,
    RequestBuilder,
};
use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

const MAX: usize = 30 * 1024 * 1024;

fn encoded_set(value_len: usize) -> BytesMut {
    let mut buf = BytesMut::new();
    RequestBuilder::new(ClientOpcode::Set)
        .extras(&[0u8; 8])
        .key(b"benchmark-key")
        .value(&vec![0xabu8; value_len])
        .build(&mut buf);
    buf
}

fn benchmark_frame_parse(c: &mut Criterion) {
    let small = encoded_set(64);
    let large = encoded_set(16 * 1024);

    let mut group = c.benchmark_group("frame_parse");
    group.throughput(Throughput::Bytes(small.len() as u64));
    group.bench_function("parse_64b", |b| {
        b.iter(|| match Frame::parse(black_box(&small), MAX) {
            ParseOutcome::Complete(frame) => black_box(frame.value().len()),
            _ => unreachable!(),
        })
    });
    group.throughput(Throughput::Bytes(large.len() as u64));
    group.bench_function("parse_16k", |b| {
        b.iter(|| match Frame::parse(black_box(&large), MAX) {
            ParseOutcome::Complete(frame) => black_box(frame.value().len()),
            _ => unreachable!(),
        })
    });
    group.finish();
}

fn benchmark_pipelined_stream(c: &mut Criterion) {
    let mut stream = BytesMut::new();
    for _ in 0..64 {
        stream.extend_from_slice(&encoded_set(128));
    }

    let mut group = c.benchmark_group("packet_parser");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("pipeline_64x128b", |b| {
        b.iter(|| {
            let mut parser = PacketParser::new(MAX);
            parser.extend(&stream);
            let mut frames = 0usize;
            while let Ok(Some(frame)) = parser.next_frame() {
                frames += frame.key().len();
            }
            black_box(frames)
        })
    });
    group.finish();
}

fn benchmark_frame_infos(c: &mut Criterion) {
    let mut encoded = BytesMut::new();
    FrameInfo::Reorder.encode(&mut encoded);
    FrameInfo::DcpStreamId(7).encode(&mut encoded);
    FrameInfo::OpenTracingContext(vec![0x55; 24]).encode(&mut encoded);

    c.bench_function("frame_info_decode", |b| {
        b.iter(|| {
            let mut count = 0usize;
            decode_frame_infos(black_box(&encoded), |_| {
                count += 1;
                Ok(())
            })
            .unwrap();
            black_box(count)
        })
    });
}

criterion_group!(
    benches,
    benchmark_frame_parse,
    benchmark_pipelined_stream,
    benchmark_frame_infos
);
criterion_main!(benches);
