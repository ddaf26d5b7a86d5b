//! Connection pipeline behaviour over in-memory transports.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use netcore::config::ConnectionConfig;
use netcore::connection::Connection;
use netcore::core::codec::PacketCodec;
use netcore::core::format::{BinaryFormat, HelloFormat};
use netcore::core::packet::{protocol, Packet, ProtocolId};
use netcore::core::serialization::{Codec, SerdeCodec, SerializationFormat};
use netcore::error::ProtocolError;
use netcore::protocol::message::Message;
use netcore::registry::Registry;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::timeout;
use tokio_util::codec::FramedRead;

const WAIT: Duration = Duration::from_secs(5);

fn packet_bytes(format: SerializationFormat, protocol: ProtocolId, msgs: &[Message]) -> Bytes {
    let codec = SerdeCodec::new(format);
    let mut payload = BytesMut::new();
    for msg in msgs {
        payload.extend_from_slice(&codec.encode(msg).unwrap());
    }
    Packet::new(protocol, payload.freeze()).to_bytes().unwrap()
}

fn bincode_packet(msgs: &[Message]) -> Bytes {
    packet_bytes(
        SerializationFormat::Bincode,
        ProtocolId::new(protocol::BINCODE, 1),
        msgs,
    )
}

struct Harness {
    client: DuplexStream,
    conn: Connection,
    received: UnboundedReceiver<Message>,
    stopped: UnboundedReceiver<()>,
    stop_count: Arc<AtomicUsize>,
}

impl Harness {
    fn start(config: ConnectionConfig, buffer: usize) -> Self {
        let (client, server) = duplex(buffer);
        let (msg_tx, received) = unbounded_channel();
        let (stop_tx, stopped) = unbounded_channel();
        let stop_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&stop_count);

        let conn = Connection::builder(server, Registry::standard())
            .config(config)
            .on_receive(move |_conn, msg| {
                msg_tx.send(msg).map_err(|_| ProtocolError::QueueClosed)
            })
            .on_stop(move |_conn| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = stop_tx.send(());
            })
            .start()
            .expect("pipeline starts");

        Self {
            client,
            conn,
            received,
            stopped,
            stop_count,
        }
    }

    fn new() -> Self {
        Self::start(ConnectionConfig::default(), 64 * 1024)
    }

    async fn next(&mut self) -> Message {
        timeout(WAIT, self.received.recv())
            .await
            .expect("message within deadline")
            .expect("callback channel open")
    }

    async fn nothing_more(&mut self) {
        assert!(timeout(Duration::from_millis(100), self.received.recv())
            .await
            .map_or(true, |m| m.is_none()));
    }

    async fn wait_stopped(&mut self) {
        timeout(WAIT, self.stopped.recv())
            .await
            .expect("on_stop within deadline")
            .expect("stop channel open");
        // Give a stray second invocation the chance to show up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(self.stop_count.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn test_two_messages_in_one_packet_arrive_in_order() {
    let mut h = Harness::new();
    let first = Message::new(1, 10, &b"one"[..]).with_tag(1);
    let second = Message::new(1, 11, &b"two"[..]).with_tags([1, 2]).with_sync(true);

    h.client
        .write_all(&bincode_packet(&[first.clone(), second.clone()]))
        .await
        .unwrap();

    assert_eq!(h.next().await, first);
    let delivered = h.next().await;
    assert_eq!(delivered, second);
    h.nothing_more().await;

    assert_eq!(h.conn.protocol(), Some(ProtocolId::new(protocol::BINCODE, 1)));
    assert_eq!(h.conn.protocol_tag(), (2 << 16) | 1);
    assert_eq!(h.conn.packet_format().unwrap().name(), BinaryFormat::NAME);
}

#[tokio::test]
async fn test_json_messages_are_delivered() {
    let mut h = Harness::new();
    let msgs = [
        Message::new(7, 1, &b"a"[..]).with_tag(3),
        Message::new(7, 2, &b"b"[..]).with_tag(3),
    ];

    h.client
        .write_all(&packet_bytes(
            SerializationFormat::Json,
            ProtocolId::new(protocol::JSON, 1),
            &msgs,
        ))
        .await
        .unwrap();

    assert_eq!(h.next().await, msgs[0]);
    assert_eq!(h.next().await, msgs[1]);
    assert_eq!(h.conn.protocol(), Some(ProtocolId::new(protocol::JSON, 1)));
}

#[tokio::test]
async fn test_split_header_waits_for_more_data() {
    let mut h = Harness::new();
    let msg = Message::new(2, 5, &b"payload"[..]);
    let bytes = bincode_packet(&[msg.clone()]);

    h.client.write_all(&bytes[..5]).await.unwrap();
    h.nothing_more().await;
    assert!(!h.conn.is_closed());

    h.client.write_all(&bytes[5..]).await.unwrap();
    assert_eq!(h.next().await, msg);
}

#[tokio::test]
async fn test_full_packet_plus_partial_keeps_surplus() {
    let mut h = Harness::new();
    let a = Message::new(1, 1, &b"a"[..]);
    let b = Message::new(1, 2, &b"b"[..]);
    let first = bincode_packet(&[a.clone()]);
    let second = bincode_packet(&[b.clone()]);

    let mut chunk = BytesMut::from(&first[..]);
    chunk.extend_from_slice(&second[..8]);
    h.client.write_all(&chunk).await.unwrap();

    assert_eq!(h.next().await, a);
    h.nothing_more().await;

    h.client.write_all(&second[8..]).await.unwrap();
    assert_eq!(h.next().await, b);
}

#[tokio::test]
async fn test_randomly_chunked_stream_delivers_everything() {
    let mut h = Harness::new();
    let msgs: Vec<Message> = (0..40)
        .map(|i| Message::new(3, i, vec![i as u8; (i as usize * 7) % 300]).with_tag(1))
        .collect();

    let mut stream = BytesMut::new();
    for group in msgs.chunks(3) {
        stream.extend_from_slice(&bincode_packet(group));
    }

    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut offset = 0;
    while offset < stream.len() {
        let end = (offset + rng.random_range(1..97)).min(stream.len());
        h.client.write_all(&stream[offset..end]).await.unwrap();
        offset = end;
    }

    for expected in &msgs {
        assert_eq!(&h.next().await, expected);
    }
    h.nothing_more().await;
}

#[tokio::test]
async fn test_unknown_format_closes_connection() {
    let mut h = Harness::new();
    h.client
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    h.wait_stopped().await;
    assert!(h.conn.is_closed());
    assert!(h.conn.packet_format().is_none());
}

#[tokio::test]
async fn test_hello_format_replies_before_packets() {
    let mut h = Harness::new();
    let msg = Message::new(4, 4, &b"hi"[..]);

    let mut opening = BytesMut::from(HelloFormat::GREETING);
    opening.extend_from_slice(&bincode_packet(&[msg.clone()]));
    h.client.write_all(&opening).await.unwrap();

    let mut reply = vec![0u8; HelloFormat::READY.len()];
    timeout(WAIT, h.client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, HelloFormat::READY);

    assert_eq!(h.next().await, msg);
    assert_eq!(h.conn.packet_format().unwrap().name(), HelloFormat::NAME);
}

#[tokio::test]
async fn test_raw_packets_bypass_codec_and_bindings_stay_put() {
    let mut h = Harness::new();

    h.client
        .write_all(&Packet::raw(&b"opaque"[..]).to_bytes().unwrap())
        .await
        .unwrap();
    let raw = h.next().await;
    assert_eq!(raw.payload, Bytes::from_static(b"opaque"));
    assert_eq!(h.conn.protocol(), None);

    let first = Message::new(1, 1, &b"x"[..]);
    h.client.write_all(&bincode_packet(&[first.clone()])).await.unwrap();
    assert_eq!(h.next().await, first);
    let bound = h.conn.protocol();
    assert_eq!(bound, Some(ProtocolId::new(protocol::BINCODE, 1)));

    // A later packet tagged with another protocol is still decoded with the bound codec.
    let second = Message::new(1, 2, &b"y"[..]);
    h.client
        .write_all(&packet_bytes(
            SerializationFormat::Bincode,
            ProtocolId::new(protocol::MSGPACK, 1),
            &[second.clone()],
        ))
        .await
        .unwrap();
    assert_eq!(h.next().await, second);
    assert_eq!(h.conn.protocol(), bound);
    assert_eq!(h.conn.packet_format().unwrap().name(), BinaryFormat::NAME);
}

#[tokio::test]
async fn test_unknown_codec_closes_connection() {
    let mut h = Harness::new();
    h.client
        .write_all(&Packet::new(ProtocolId::new(99, 1), &b"zzz"[..]).to_bytes().unwrap())
        .await
        .unwrap();

    h.wait_stopped().await;
    assert!(h.conn.protocol().is_none());
}

#[tokio::test]
async fn test_undecodable_first_message_closes_connection() {
    let mut h = Harness::new();
    h.client
        .write_all(
            &Packet::new(ProtocolId::new(protocol::JSON, 1), &b"{not json"[..])
                .to_bytes()
                .unwrap(),
        )
        .await
        .unwrap();

    h.wait_stopped().await;
}

#[tokio::test]
async fn test_bad_remainder_only_ends_that_packet() {
    let mut h = Harness::new();
    let good = Message::new(1, 1, &b"ok"[..]);
    let codec = SerdeCodec::new(SerializationFormat::Json);

    let mut payload = BytesMut::from(&codec.encode(&good).unwrap()[..]);
    payload.extend_from_slice(b"{broken");
    let packet = Packet::new(ProtocolId::new(protocol::JSON, 1), payload.freeze());
    h.client.write_all(&packet.to_bytes().unwrap()).await.unwrap();

    assert_eq!(h.next().await, good);

    let after = Message::new(1, 2, &b"after"[..]);
    h.client
        .write_all(&packet_bytes(
            SerializationFormat::Json,
            ProtocolId::new(protocol::JSON, 1),
            &[after.clone()],
        ))
        .await
        .unwrap();
    assert_eq!(h.next().await, after);
    assert!(!h.conn.is_closed());
}

async fn assert_rejecting_callback_closes(packet: Bytes) {
    let (mut client, server) = duplex(4096);
    let (stop_tx, mut stopped) = unbounded_channel();
    let conn = Connection::builder(server, Registry::standard())
        .on_receive(|_conn, _msg| Err(ProtocolError::Custom("rejected".into())))
        .on_stop(move |_conn| {
            let _ = stop_tx.send(());
        })
        .start()
        .unwrap();

    client.write_all(&packet).await.unwrap();
    timeout(WAIT, stopped.recv()).await.unwrap().unwrap();
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_callback_failure_closes_connection() {
    assert_rejecting_callback_closes(bincode_packet(&[Message::default()])).await;
}

#[tokio::test]
async fn test_callback_failure_on_raw_packet_closes_connection() {
    let packet = Packet::raw(&b"opaque"[..]).to_bytes().unwrap();
    assert_rejecting_callback_closes(packet).await;
}

#[tokio::test]
async fn test_peer_eof_stops_pipeline() {
    let mut h = Harness::new();
    h.client.shutdown().await.unwrap();

    h.wait_stopped().await;
    assert!(h.conn.close_requested());
}

#[tokio::test]
async fn test_close_twice_is_harmless() {
    let mut h = Harness::new();
    h.conn.close();
    h.conn.close();

    h.wait_stopped().await;
    assert!(h.conn.is_closed());
    assert!(matches!(
        h.conn.send(&[Message::default()]),
        Err(ProtocolError::ConnectionClosed)
    ));
    assert!(matches!(
        h.conn.send_packet(&Packet::raw(Bytes::new())),
        Err(ProtocolError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_stalled_peer_hits_write_deadline() {
    let config = ConnectionConfig {
        write_timeout: Duration::from_millis(100),
        ..ConnectionConfig::default()
    };
    // Tiny pipe and a peer that never reads.
    let mut h = Harness::start(config, 64);

    h.conn.write(&[0xAB; 16 * 1024]);
    h.wait_stopped().await;
    assert!(h.conn.is_closed());
}

#[tokio::test]
async fn test_send_uses_default_codec_and_binary_framing() {
    let (client, server) = duplex(64 * 1024);
    let conn = Connection::builder(server, Registry::standard())
        .on_receive(|_conn, _msg| Ok(()))
        .start()
        .unwrap();

    let msgs = [
        Message::new(9, 1, &b"first"[..]).with_tag(1),
        Message::new(9, 2, &b"second"[..]).with_tag(1),
    ];
    conn.send(&msgs).unwrap();
    conn.send_packet(&Packet::raw(&b"tail"[..])).unwrap();

    let mut frames = FramedRead::new(client, PacketCodec);
    let packet = timeout(WAIT, frames.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(packet.protocol(), ProtocolId::new(protocol::BINCODE, 1));

    let codec = SerdeCodec::new(SerializationFormat::Bincode);
    let (first, rest) = codec.decode(packet.payload).unwrap();
    let (second, rest) = codec.decode(rest).unwrap();
    assert_eq!(first.unwrap(), msgs[0]);
    assert_eq!(second.unwrap(), msgs[1]);
    assert!(rest.is_empty());

    let raw = timeout(WAIT, frames.next()).await.unwrap().unwrap().unwrap();
    assert!(raw.is_raw());
    assert_eq!(raw.payload, Bytes::from_static(b"tail"));
}

#[tokio::test]
async fn test_close_after_flush_drains_then_closes() {
    let (client, server) = duplex(64 * 1024);
    let (stop_tx, mut stopped) = unbounded_channel();
    let conn = Connection::builder(server, Registry::standard())
        .on_receive(|_conn, _msg| Ok(()))
        .on_stop(move |_conn| {
            let _ = stop_tx.send(());
        })
        .start()
        .unwrap();

    conn.send_packet(&Packet::raw(&b"bye"[..])).unwrap();
    conn.close_after_flush();

    let mut frames = FramedRead::new(client, PacketCodec);
    let packet = timeout(WAIT, frames.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(packet.payload, Bytes::from_static(b"bye"));

    timeout(WAIT, stopped.recv()).await.unwrap().unwrap();
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_missing_receive_callback_is_rejected() {
    let (_client, server) = duplex(1024);
    let result = Connection::builder(server, Registry::standard()).start();
    assert!(matches!(result, Err(ProtocolError::ConfigError(_))));
}

#[tokio::test]
async fn test_associated_object_and_receive_buffer_access() {
    let h = Harness::new();

    assert!(h.conn.associated::<String>().is_none());
    h.conn.set_associated_object(Arc::new(String::from("player-7")));
    assert_eq!(h.conn.associated::<String>().as_deref().map(String::as_str), Some("player-7"));
    assert!(h.conn.associated::<u64>().is_none());

    assert!(h.conn.peek(4).is_empty());
    assert!(h.conn.read(4).is_empty());
    h.conn.discard();
    assert_ne!(h.conn.session_id(), Harness::new().conn.session_id());
    assert_eq!(h.conn.source(), "memory:duplex");
}

#[tokio::test]
async fn test_configured_payload_limit_rejects_larger_packets() {
    let config = ConnectionConfig {
        max_payload_size: 2048,
        ..ConnectionConfig::default()
    };
    let (mut client, server) = duplex(64 * 1024);
    let (stop_tx, mut stopped) = unbounded_channel();
    let conn = Connection::builder(server, config.standard_registry())
        .config(config)
        .on_receive(|_conn, _msg| Ok(()))
        .on_stop(move |_conn| {
            let _ = stop_tx.send(());
        })
        .start()
        .unwrap();

    client
        .write_all(&Packet::raw(vec![0u8; 4096]).to_bytes().unwrap())
        .await
        .unwrap();
    timeout(WAIT, stopped.recv()).await.unwrap().unwrap();
    assert!(conn.is_closed());
}
