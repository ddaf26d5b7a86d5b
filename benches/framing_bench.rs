use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use netcore::core::buffer::Buffer;
use netcore::core::format::{BinaryFormat, PacketFormat};
use netcore::core::packet::Packet;
use netcore::core::serialization::{Codec, SerdeCodec, SerializationFormat};
use netcore::protocol::message::Message;

fn sample_messages(count: usize) -> Vec<Message> {
    (0..count)
        .map(|i| {
            Message::new(1, i as u32, vec![(i & 0xFF) as u8; 256])
                .with_tags([10, 11])
                .with_sync(i % 4 == 0)
        })
        .collect()
}

fn bench_codecs(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let messages = sample_messages(32);

    for format in [
        SerializationFormat::Bincode,
        SerializationFormat::Json,
        SerializationFormat::MessagePack,
    ] {
        let codec = SerdeCodec::new(format);

        group.bench_function(format!("encode/{}", format.name()), |b| {
            b.iter(|| {
                for msg in &messages {
                    let _ = codec.encode(msg).unwrap();
                }
            })
        });

        let mut payload = BytesMut::new();
        for msg in &messages {
            payload.extend_from_slice(&codec.encode(msg).unwrap());
        }
        let payload = payload.freeze();
        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_function(format!("decode_stream/{}", format.name()), |b| {
            b.iter(|| {
                let mut rest = payload.clone();
                while let (Some(_), remaining) = codec.decode(rest).unwrap() {
                    rest = remaining;
                }
            })
        });
    }

    group.finish();
}

fn bench_binary_format(c: &mut Criterion) {
    let mut group = c.benchmark_group("binary_format");
    let stream: Bytes = (0..64)
        .flat_map(|i| Packet::raw(vec![i as u8; 512]).to_bytes().unwrap().to_vec())
        .collect::<Vec<u8>>()
        .into();
    let format = BinaryFormat::default();
    group.throughput(Throughput::Bytes(stream.len() as u64));

    for chunk in [64usize, 1024, 16 * 1024] {
        group.bench_function(format!("pop/chunk_{chunk}"), |b| {
            b.iter_batched(
                Buffer::new,
                |buf| {
                    let mut packets = 0;
                    for piece in stream.chunks(chunk) {
                        buf.write(piece);
                        while let Ok(Some(_)) = format.pop(&buf) {
                            packets += 1;
                        }
                    }
                    assert_eq!(packets, 64);
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_codecs, bench_binary_format);
criterion_main!(benches);
