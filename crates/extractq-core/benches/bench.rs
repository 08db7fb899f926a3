use bytes::BytesMut;
use core::hint::black_box;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use extractq_core::{ChunkProgress, NetstringCodec, ServerMessage, frame::encode_frame};
use serde_json::json;
use tokio_util::codec::Decoder;

fn progress_message(place_bytes: usize) -> ServerMessage {
    ServerMessage::Chunk(ChunkProgress {
        num: 17,
        filename: "r62149_017.xml".to_string(),
        place: json!({
            "area": 1234.5,
            "display_name": "x".repeat(place_bytes),
        }),
    })
}

fn bench_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("netstring");

    for place_bytes in [64, 4 * 1024, 256 * 1024] {
        let payload = progress_message(place_bytes).to_bytes().unwrap();
        group.throughput(Throughput::Bytes(payload.len() as u64));

        group.bench_with_input(
            BenchmarkId::new("encode", place_bytes),
            &payload,
            |b, payload| {
                let mut buf = BytesMut::with_capacity(payload.len() + 16);
                b.iter(|| {
                    buf.clear();
                    encode_frame(black_box(payload), &mut buf);
                });
            },
        );

        let mut framed = BytesMut::new();
        encode_frame(&payload, &mut framed);
        group.bench_with_input(
            BenchmarkId::new("decode", place_bytes),
            &framed,
            |b, framed| {
                let mut codec = NetstringCodec::new();
                b.iter(|| {
                    let mut buf = framed.clone();
                    black_box(codec.decode(&mut buf).unwrap());
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("decode_message", place_bytes),
            &payload,
            |b, payload| {
                b.iter(|| black_box(ServerMessage::from_slice(black_box(payload)).unwrap()));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_frames);
criterion_main!(benches);
