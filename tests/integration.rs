//! End-to-end broker tests
//!
//! Each test boots a broker on an ephemeral port and speaks raw MQTT over
//! TCP through the public codec.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use relaymq::broker::{Broker, BrokerConfig};
use relaymq::codec::{Decoder, Encoder};
use relaymq::protocol::{
    ConnAck, Connect, ConnectReturnCode, FilterRequest, Packet, Publish, QoS, SubAckCode,
    Subscribe, Unsubscribe,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

async fn start_broker() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let broker = Arc::new(Broker::new(BrokerConfig {
        bind_addr: addr,
        ..Default::default()
    }));
    tokio::spawn(async move { broker.serve(listener).await });
    addr
}

struct TestClient {
    stream: TcpStream,
    decoder: Decoder,
    buf: BytesMut,
}

impl TestClient {
    async fn open(addr: std::net::SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            decoder: Decoder::new(),
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Open a connection and complete the CONNECT handshake.
    async fn connect(addr: std::net::SocketAddr, client_id: &str) -> Self {
        let mut client = Self::open(addr).await;
        client
            .send(&Packet::Connect(Box::new(Connect {
                client_id: client_id.to_string(),
                clean_session: true,
                keep_alive: 1,
                ..Default::default()
            })))
            .await;

        match client.recv().await {
            Packet::ConnAck(ack) => {
                assert_eq!(ack.return_code, ConnectReturnCode::Accepted);
                assert!(!ack.session_present);
            }
            other => panic!("expected CONNACK, got {:?}", other),
        }
        client
    }

    async fn send(&mut self, packet: &Packet) {
        let mut buf = BytesMut::with_capacity(packet.encoded_len());
        Encoder::new().encode(packet, &mut buf).unwrap();
        self.stream.write_all(&buf).await.unwrap();
    }

    async fn recv(&mut self) -> Packet {
        timeout(RECV_TIMEOUT, self.recv_inner())
            .await
            .expect("timed out waiting for packet")
            .expect("connection closed while waiting for packet")
    }

    async fn recv_inner(&mut self) -> Option<Packet> {
        loop {
            if let Some((packet, consumed)) = self.decoder.decode(&self.buf[..]).unwrap() {
                self.buf.advance(consumed);
                return Some(packet);
            }
            if self.stream.read_buf(&mut self.buf).await.unwrap() == 0 {
                return None;
            }
        }
    }

    /// Assert the broker closed the connection.
    async fn expect_closed(&mut self) {
        let closed = timeout(RECV_TIMEOUT, self.recv_inner())
            .await
            .expect("timed out waiting for close");
        assert!(closed.is_none(), "expected EOF, got {:?}", closed);
    }

    /// Assert no packet arrives within a short window.
    async fn expect_silence(&mut self) {
        let result = timeout(Duration::from_millis(300), self.recv_inner()).await;
        assert!(result.is_err(), "expected silence, got {:?}", result);
    }

    async fn subscribe(&mut self, filter: &str) {
        self.send(&Packet::Subscribe(Subscribe {
            packet_id: 1,
            filters: vec![FilterRequest {
                filter: filter.to_string(),
                qos: QoS::AtMostOnce,
            }],
        }))
        .await;

        match self.recv().await {
            Packet::SubAck(ack) => {
                assert_eq!(ack.packet_id, 1);
                assert_eq!(ack.return_codes, vec![SubAckCode::GrantedQoS0]);
            }
            other => panic!("expected SUBACK, got {:?}", other),
        }
    }

    async fn publish(&mut self, topic: &str, payload: &'static [u8]) {
        self.send(&Packet::Publish(Publish {
            topic: topic.into(),
            payload: Bytes::from_static(payload),
            ..Default::default()
        }))
        .await;
    }

    async fn expect_publish(&mut self, topic: &str, payload: &[u8]) {
        match self.recv().await {
            Packet::Publish(publish) => {
                assert_eq!(publish.topic.as_ref(), topic);
                assert_eq!(&publish.payload[..], payload);
                assert_eq!(publish.qos, QoS::AtMostOnce);
            }
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn connect_ping_disconnect() {
    let addr = start_broker().await;
    let mut client = TestClient::connect(addr, "abcde").await;

    client.send(&Packet::PingReq).await;
    assert_eq!(client.recv().await, Packet::PingResp);

    client.send(&Packet::Disconnect).await;
    client.expect_closed().await;
}

#[tokio::test]
async fn publish_reaches_wildcard_subscriber() {
    let addr = start_broker().await;

    let mut subscriber = TestClient::connect(addr, "sub").await;
    subscriber.subscribe("foo/+").await;

    let mut publisher = TestClient::connect(addr, "pub").await;
    publisher.publish("foo/bar", b"hi").await;

    subscriber.expect_publish("foo/bar", b"hi").await;
}

#[tokio::test]
async fn overlapping_filters_and_hash_parent_rule() {
    let addr = start_broker().await;

    let mut sub_hash = TestClient::connect(addr, "sub-hash").await;
    sub_hash.subscribe("a/#").await;

    let mut sub_plus = TestClient::connect(addr, "sub-plus").await;
    sub_plus.subscribe("a/b/+").await;

    let mut publisher = TestClient::connect(addr, "pub").await;

    // both filters match a/b/c
    publisher.publish("a/b/c", b"one").await;
    sub_hash.expect_publish("a/b/c", b"one").await;
    sub_plus.expect_publish("a/b/c", b"one").await;

    // "a/#" matches its parent "a"; "a/b/+" does not
    publisher.publish("a", b"two").await;
    sub_hash.expect_publish("a", b"two").await;
    sub_plus.expect_silence().await;
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let addr = start_broker().await;

    let mut subscriber = TestClient::connect(addr, "sub").await;
    subscriber.subscribe("news/#").await;

    let mut publisher = TestClient::connect(addr, "pub").await;
    publisher.publish("news/today", b"first").await;
    subscriber.expect_publish("news/today", b"first").await;

    subscriber
        .send(&Packet::Unsubscribe(Unsubscribe {
            packet_id: 2,
            filters: vec!["news/#".to_string()],
        }))
        .await;
    match subscriber.recv().await {
        Packet::UnsubAck(ack) => assert_eq!(ack.packet_id, 2),
        other => panic!("expected UNSUBACK, got {:?}", other),
    }

    publisher.publish("news/today", b"second").await;
    subscriber.expect_silence().await;
}

#[tokio::test]
async fn duplicate_client_id_rejected() {
    let addr = start_broker().await;
    let _first = TestClient::connect(addr, "same-id").await;

    let mut second = TestClient::open(addr).await;
    second
        .send(&Packet::Connect(Box::new(Connect {
            client_id: "same-id".to_string(),
            ..Default::default()
        })))
        .await;

    match second.recv().await {
        Packet::ConnAck(ConnAck { return_code, .. }) => {
            assert_eq!(return_code, ConnectReturnCode::IdentifierRejected);
        }
        other => panic!("expected CONNACK, got {:?}", other),
    }
    second.expect_closed().await;
}

#[tokio::test]
async fn client_id_released_after_disconnect() {
    let addr = start_broker().await;

    let mut first = TestClient::connect(addr, "reuse-me").await;
    first.send(&Packet::Disconnect).await;
    first.expect_closed().await;

    // the id is free again once the first session tore down
    let _second = TestClient::connect(addr, "reuse-me").await;
}

#[tokio::test]
async fn non_connect_first_packet_closes_connection() {
    let addr = start_broker().await;

    let mut client = TestClient::open(addr).await;
    client.send(&Packet::PingReq).await;
    client.expect_closed().await;
}

#[tokio::test]
async fn malformed_packet_closes_connection() {
    let addr = start_broker().await;
    let mut client = TestClient::connect(addr, "bad-bytes").await;

    // SUBSCRIBE with reserved control flags 0000
    client.stream.write_all(&[0x80, 0x02, 0x00, 0x01]).await.unwrap();
    client.expect_closed().await;
}

#[tokio::test]
async fn multiple_filters_in_one_subscribe() {
    let addr = start_broker().await;

    let mut subscriber = TestClient::connect(addr, "multi").await;
    subscriber
        .send(&Packet::Subscribe(Subscribe {
            packet_id: 7,
            filters: vec![
                FilterRequest {
                    filter: "x/+".to_string(),
                    qos: QoS::AtMostOnce,
                },
                FilterRequest {
                    filter: "y/#/bad".to_string(), // invalid: '#' not last
                    qos: QoS::AtMostOnce,
                },
            ],
        }))
        .await;

    match subscriber.recv().await {
        Packet::SubAck(ack) => {
            assert_eq!(ack.packet_id, 7);
            assert_eq!(
                ack.return_codes,
                vec![SubAckCode::GrantedQoS0, SubAckCode::Failure]
            );
        }
        other => panic!("expected SUBACK, got {:?}", other),
    }

    // the valid filter still works
    let mut publisher = TestClient::connect(addr, "pub").await;
    publisher.publish("x/1", b"ok").await;
    subscriber.expect_publish("x/1", b"ok").await;
}
