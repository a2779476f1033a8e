//! Per-connection session handling
//!
//! Each accepted connection runs two cooperating tasks: the read loop
//! (owned by [`Connection::handle`]) decodes inbound packets and dispatches
//! them, and a write loop drains the session's event channel, serializing
//! every received [`PublishEvent`] as an outbound QoS-0 PUBLISH. Packets the
//! read loop produces directly (acks, PINGRESP) go through the shared
//! writer.

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use bytes::{Buf, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, trace};
use uuid::Uuid;

use super::BrokerConfig;
use crate::codec::{Decoder, Encoder};
use crate::feed::{PublishEvent, Subscription};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, EncodeError, Packet, Publish, QoS, SubAck,
    SubAckCode, Subscribe, UnsubAck, Unsubscribe,
};
use crate::topic::{parse_topic_filter, parse_topic_name, TopicIndex};

/// Why a connection ended
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Decode(DecodeError),
    Encode(EncodeError),
    /// MQTT-level violation (wrong first packet, duplicate CONNECT, ...)
    Protocol(&'static str),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {}", e),
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::Protocol(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl From<EncodeError> for ConnectionError {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}

type ClientIds = Arc<DashMap<Arc<str>, (), ahash::RandomState>>;
type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// One accepted TCP connection, from CONNECT handshake to teardown.
pub struct Connection {
    config: BrokerConfig,
    topics: Arc<TopicIndex>,
    client_ids: ClientIds,
    shutdown: broadcast::Receiver<()>,
}

impl Connection {
    pub(crate) fn new(
        config: BrokerConfig,
        topics: Arc<TopicIndex>,
        client_ids: ClientIds,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            topics,
            client_ids,
            shutdown,
        }
    }

    /// Drive the connection until DISCONNECT, EOF, shutdown or error.
    pub async fn handle(mut self, stream: TcpStream) -> Result<(), ConnectionError> {
        let (mut reader, writer) = stream.into_split();
        let writer: SharedWriter = Arc::new(Mutex::new(writer));

        let decoder = Decoder::new().with_max_packet_size(self.config.max_packet_size);
        let mut buf = BytesMut::with_capacity(4096);

        // The first packet must be a valid CONNECT
        let connect = match read_packet(&mut reader, &decoder, &mut buf).await? {
            Some(Packet::Connect(connect)) => connect,
            Some(_) => return Err(ConnectionError::Protocol("first packet must be CONNECT")),
            None => return Err(ConnectionError::Protocol("connection closed before CONNECT")),
        };

        let client_id = match self.register_client_id(&connect, &writer).await? {
            Some(id) => id,
            None => return Ok(()), // refused, CONNACK already sent
        };

        send_packet(&writer, &Packet::ConnAck(ConnAck::accepted())).await?;
        debug!(
            client_id = %client_id,
            keep_alive = connect.keep_alive,
            clean_session = connect.clean_session,
            "session established"
        );

        let (event_tx, event_rx) = mpsc::channel(self.config.channel_capacity);
        let (cancel_tx, cancel_rx) = broadcast::channel(1);

        // propagate broker shutdown into any in-flight publish
        let forwarder = {
            let cancel_tx = cancel_tx.clone();
            let mut shutdown = self.shutdown.resubscribe();
            tokio::spawn(async move {
                let _ = shutdown.recv().await;
                let _ = cancel_tx.send(());
            })
        };

        let write_task = tokio::spawn(write_loop(
            event_rx,
            writer.clone(),
            cancel_tx.subscribe(),
        ));

        let mut session = Session {
            client_id: client_id.clone(),
            topics: self.topics.clone(),
            writer,
            subscriptions: AHashMap::new(),
            event_tx,
            cancel_rx,
        };

        let result = session
            .run(&mut reader, &decoder, &mut buf, &mut self.shutdown)
            .await;

        session.teardown().await;
        drop(cancel_tx); // unblocks the write loop and any pending publish
        forwarder.abort();
        let _ = write_task.await;
        self.client_ids.remove(&client_id);
        debug!(client_id = %client_id, "session closed");

        result
    }

    /// Register the client identifier, assigning one for empty-id clean
    /// sessions. Returns `None` after refusing a duplicate.
    async fn register_client_id(
        &self,
        connect: &Connect,
        writer: &SharedWriter,
    ) -> Result<Option<Arc<str>>, ConnectionError> {
        if connect.client_id.is_empty() {
            loop {
                let id: Arc<str> = Arc::from(Uuid::new_v4().simple().to_string().as_str());
                if self.try_claim(&id) {
                    return Ok(Some(id));
                }
            }
        }

        let id: Arc<str> = Arc::from(connect.client_id.as_str());
        if self.try_claim(&id) {
            return Ok(Some(id));
        }

        debug!(client_id = %id, "duplicate client id refused");
        send_packet(
            writer,
            &Packet::ConnAck(ConnAck::refused(ConnectReturnCode::IdentifierRejected)),
        )
        .await?;
        Ok(None)
    }

    fn try_claim(&self, id: &Arc<str>) -> bool {
        match self.client_ids.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(());
                true
            }
        }
    }
}

enum Flow {
    Continue,
    Disconnect,
}

/// Per-session dispatch state for the read loop
struct Session {
    client_id: Arc<str>,
    topics: Arc<TopicIndex>,
    writer: SharedWriter,
    /// Filter string -> subscription handle, for unsubscribe
    subscriptions: AHashMap<String, Subscription>,
    /// Sender attached to feeds on SUBSCRIBE
    event_tx: mpsc::Sender<PublishEvent>,
    /// Cancellation handle passed into every publish
    cancel_rx: broadcast::Receiver<()>,
}

impl Session {
    async fn run(
        &mut self,
        reader: &mut OwnedReadHalf,
        decoder: &Decoder,
        buf: &mut BytesMut,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ConnectionError> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                packet = read_packet(reader, decoder, buf) => {
                    match packet? {
                        None => return Ok(()), // peer closed
                        Some(packet) => match self.dispatch(packet).await? {
                            Flow::Continue => {}
                            Flow::Disconnect => return Ok(()),
                        },
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, packet: Packet) -> Result<Flow, ConnectionError> {
        match packet {
            Packet::PingReq => {
                send_packet(&self.writer, &Packet::PingResp).await?;
                Ok(Flow::Continue)
            }
            Packet::Publish(publish) => {
                self.handle_publish(publish).await?;
                Ok(Flow::Continue)
            }
            Packet::Subscribe(subscribe) => {
                self.handle_subscribe(subscribe).await?;
                Ok(Flow::Continue)
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(unsubscribe).await?;
                Ok(Flow::Continue)
            }
            Packet::Disconnect => Ok(Flow::Disconnect),
            Packet::Connect(_) => Err(ConnectionError::Protocol("duplicate CONNECT")),
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                Err(ConnectionError::Protocol("server-to-client packet from client"))
            }
        }
    }

    async fn handle_publish(&mut self, publish: Publish) -> Result<(), ConnectionError> {
        // the decoder already validated the topic; tokenize for matching
        let feeds = {
            let tokens = parse_topic_name(&publish.topic).map_err(DecodeError::from)?;
            self.topics.match_feeds(&tokens)
        };
        if feeds.is_empty() {
            trace!(client_id = %self.client_id, topic = %publish.topic, "no matching feeds");
            return Ok(());
        }

        let packet = Arc::new(publish);
        for feed in feeds {
            let event = PublishEvent {
                filter: feed.filter().clone(),
                packet: packet.clone(),
            };
            let delivered = feed.publish(&mut self.cancel_rx, event).await;
            trace!(
                client_id = %self.client_id,
                topic = %packet.topic,
                filter = %feed.filter(),
                delivered,
                "published"
            );
        }
        Ok(())
    }

    async fn handle_subscribe(&mut self, subscribe: Subscribe) -> Result<(), ConnectionError> {
        let mut return_codes = Vec::with_capacity(subscribe.filters.len());

        for request in subscribe.filters {
            match parse_topic_filter(&request.filter) {
                Ok((tokens, _)) => {
                    let (feed, _) = self.topics.init_feed(&request.filter, &tokens);
                    let subscription = feed.subscribe(self.event_tx.clone());
                    // re-subscribing to the same filter replaces the old handle
                    if let Some(old) = self.subscriptions.insert(request.filter, subscription) {
                        old.unsubscribe().await;
                    }
                    // QoS 1/2 flow is not implemented, so grant QoS 0
                    return_codes.push(SubAckCode::GrantedQoS0);
                }
                Err(e) => {
                    debug!(client_id = %self.client_id, filter = %request.filter, "bad filter: {}", e);
                    return_codes.push(SubAckCode::Failure);
                }
            }
        }

        send_packet(
            &self.writer,
            &Packet::SubAck(SubAck {
                packet_id: subscribe.packet_id,
                return_codes,
            }),
        )
        .await
    }

    async fn handle_unsubscribe(
        &mut self,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        for filter in &unsubscribe.filters {
            if let Some(subscription) = self.subscriptions.remove(filter.as_str()) {
                subscription.unsubscribe().await;
            }
        }

        send_packet(
            &self.writer,
            &Packet::UnsubAck(UnsubAck {
                packet_id: unsubscribe.packet_id,
            }),
        )
        .await
    }

    async fn teardown(&mut self) {
        for (_, subscription) in self.subscriptions.drain() {
            subscription.unsubscribe().await;
        }
    }
}

/// Read one complete packet, growing `buf` as needed.
/// Returns `None` on a clean EOF at a packet boundary.
async fn read_packet(
    reader: &mut OwnedReadHalf,
    decoder: &Decoder,
    buf: &mut BytesMut,
) -> Result<Option<Packet>, ConnectionError> {
    loop {
        if let Some((packet, consumed)) = decoder.decode(&buf[..])? {
            buf.advance(consumed);
            return Ok(Some(packet));
        }
        if reader.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ConnectionError::Protocol("connection closed mid-packet"));
        }
    }
}

async fn send_packet(writer: &SharedWriter, packet: &Packet) -> Result<(), ConnectionError> {
    let mut buf = BytesMut::with_capacity(packet.encoded_len());
    Encoder::new().encode(packet, &mut buf)?;
    writer.lock().await.write_all(&buf).await?;
    Ok(())
}

/// Drains the session's event channel, serializing each event as an
/// outbound QoS-0 PUBLISH with the concrete topic from the raw packet.
async fn write_loop(
    mut events: mpsc::Receiver<PublishEvent>,
    writer: SharedWriter,
    mut closed: broadcast::Receiver<()>,
) {
    let encoder = Encoder::new();
    loop {
        let event = tokio::select! {
            _ = closed.recv() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let outbound = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: event.packet.topic.clone(),
            packet_id: None,
            payload: event.packet.payload.clone(),
        });

        let mut buf = BytesMut::with_capacity(outbound.encoded_len());
        if encoder.encode(&outbound, &mut buf).is_err() {
            continue;
        }
        if writer.lock().await.write_all(&buf).await.is_err() {
            break;
        }
    }
}
