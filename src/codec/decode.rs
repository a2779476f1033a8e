//! MQTT packet decoder
//!
//! Strict v3.1.1 parsing: any structural violation is an error and the
//! caller is expected to close the connection.

use std::sync::Arc;

use bytes::Bytes;

use super::{read_binary, read_remaining_length, read_string, read_u16, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, FilterRequest, Packet, PacketType, Publish,
    QoS, SubAck, SubAckCode, Subscribe, UnsubAck, Unsubscribe, Will, PROTOCOL_HEADER,
};
use crate::topic::validate_topic_name;

/// Parsed fixed header: packet type, control flags and remaining length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: u32,
}

impl FixedHeader {
    /// Parse a fixed header from the front of `buf`.
    /// Returns `Ok(None)` until enough bytes are buffered.
    pub fn parse(buf: &[u8]) -> Result<Option<(FixedHeader, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let type_bits = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let packet_type =
            PacketType::from_u8(type_bits).ok_or(DecodeError::InvalidPacketType(type_bits))?;

        let (remaining_length, len_bytes) = match read_remaining_length(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if !packet_type.valid_flags(flags) {
            return Err(DecodeError::InvalidFlags);
        }

        Ok(Some((
            FixedHeader {
                packet_type,
                flags,
                remaining_length,
            },
            1 + len_bytes,
        )))
    }
}

/// Streaming MQTT packet decoder.
///
/// Frames packets out of a growable read buffer: `decode` returns `None`
/// until a complete packet is buffered, then the packet plus the number of
/// bytes consumed.
pub struct Decoder {
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Decode one packet from the front of `buf`.
    /// Returns (packet, bytes_consumed), or `None` if more data is needed.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        let (header, header_len) = match FixedHeader::parse(buf)? {
            Some(h) => h,
            None => return Ok(None),
        };

        if header.remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = header_len + header.remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let payload = &buf[header_len..total_len];
        let packet = decode_packet(&header, payload)?;
        Ok(Some((packet, total_len)))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a packet whose fixed header has already been parsed and whose
/// payload (`remaining_length` bytes) is fully buffered.
pub fn decode_packet(header: &FixedHeader, payload: &[u8]) -> Result<Packet, DecodeError> {
    debug_assert_eq!(payload.len(), header.remaining_length as usize);

    if !header.packet_type.valid_flags(header.flags) {
        return Err(DecodeError::InvalidFlags);
    }

    match header.packet_type {
        PacketType::Connect => decode_connect(payload),
        PacketType::ConnAck => decode_connack(payload),
        PacketType::Publish => decode_publish(header.flags, payload),
        PacketType::Subscribe => decode_subscribe(payload),
        PacketType::SubAck => decode_suback(payload),
        PacketType::Unsubscribe => decode_unsubscribe(payload),
        PacketType::UnsubAck => decode_unsuback(payload),
        PacketType::PingReq => decode_empty(payload, Packet::PingReq),
        PacketType::PingResp => decode_empty(payload, Packet::PingResp),
        PacketType::Disconnect => decode_empty(payload, Packet::Disconnect),
        PacketType::PubAck | PacketType::PubRec | PacketType::PubRel | PacketType::PubComp => {
            Err(DecodeError::UnsupportedPacket(header.packet_type as u8))
        }
    }
}

fn decode_connect(payload: &[u8]) -> Result<Packet, DecodeError> {
    // Protocol name "MQTT" + level 4, byte for byte
    if payload.len() < PROTOCOL_HEADER.len() {
        return Err(DecodeError::InsufficientData);
    }
    if payload[..PROTOCOL_HEADER.len()] != PROTOCOL_HEADER {
        return Err(DecodeError::InvalidProtocolName);
    }
    let mut pos = PROTOCOL_HEADER.len();

    if pos >= payload.len() {
        return Err(DecodeError::InsufficientData);
    }
    let connect_flags = payload[pos];
    pos += 1;

    // Reserved bit must be 0
    if (connect_flags & 0x01) != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let clean_session = (connect_flags & 0x02) != 0;
    let will_flag = (connect_flags & 0x04) != 0;
    let will_qos = (connect_flags >> 3) & 0x03;
    let will_retain = (connect_flags & 0x20) != 0;
    let password_flag = (connect_flags & 0x40) != 0;
    let username_flag = (connect_flags & 0x80) != 0;

    // [MQTT-3.1.2-22] password flag requires username flag
    if !username_flag && password_flag {
        return Err(DecodeError::InvalidFlags);
    }

    if will_qos > 2 {
        return Err(DecodeError::InvalidQoS(will_qos));
    }

    // [MQTT-3.1.2-13] will QoS and will retain must be 0 without a will
    if !will_flag && (will_qos != 0 || will_retain) {
        return Err(DecodeError::InvalidFlags);
    }

    if pos + 2 > payload.len() {
        return Err(DecodeError::InsufficientData);
    }
    let keep_alive = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
    pos += 2;

    let (client_id, len) = read_string(&payload[pos..])?;
    pos += len;

    // [MQTT-3.1.3-7] a zero-byte client id requires a clean session
    if client_id.is_empty() && !clean_session {
        return Err(DecodeError::MalformedPacket(
            "empty client id requires clean session",
        ));
    }

    let will = if will_flag {
        let (will_topic, len) = read_string(&payload[pos..])?;
        pos += len;

        let (will_payload, len) = read_binary(&payload[pos..])?;
        pos += len;

        Some(Will {
            topic: will_topic.to_string(),
            payload: Bytes::copy_from_slice(will_payload),
            qos: QoS::from_u8(will_qos).expect("will qos validated above"),
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        let (s, len) = read_string(&payload[pos..])?;
        pos += len;
        Some(s.to_string())
    } else {
        None
    };

    let password = if password_flag {
        let (data, _len) = read_binary(&payload[pos..])?;
        Some(Bytes::copy_from_slice(data))
    } else {
        None
    };

    Ok(Packet::Connect(Box::new(Connect {
        client_id: client_id.to_string(),
        clean_session,
        keep_alive,
        username,
        password,
        will,
    })))
}

fn decode_connack(payload: &[u8]) -> Result<Packet, DecodeError> {
    if payload.len() != 2 {
        return Err(DecodeError::MalformedPacket("CONNACK payload must be 2 bytes"));
    }

    let ack_flags = payload[0];
    // Only bit 0 (session present) may be set
    if (ack_flags & 0xFE) != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let return_code =
        ConnectReturnCode::from_u8(payload[1]).ok_or(DecodeError::InvalidReturnCode(payload[1]))?;

    Ok(Packet::ConnAck(ConnAck {
        session_present: (ack_flags & 0x01) != 0,
        return_code,
    }))
}

fn decode_publish(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    let dup = (flags & 0x08) != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let retain = (flags & 0x01) != 0;

    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

    // [MQTT-3.3.1-2] DUP must be 0 for QoS 0
    if qos == QoS::AtMostOnce && dup {
        return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
    }

    let mut pos = 0;

    let (topic, len) = read_string(&payload[pos..])?;
    pos += len;

    // No wildcards or NUL in a publish topic
    validate_topic_name(topic)?;

    let packet_id = if qos != QoS::AtMostOnce {
        let id = read_u16(&payload[pos..])?;
        if id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }
        pos += 2;
        Some(id)
    } else {
        None
    };

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic: Arc::from(topic),
        packet_id,
        payload: Bytes::copy_from_slice(&payload[pos..]),
    }))
}

fn decode_subscribe(payload: &[u8]) -> Result<Packet, DecodeError> {
    let packet_id = read_u16(payload)?;
    if packet_id == 0 {
        return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
    }

    let mut pos = 2;
    let mut filters = Vec::new();

    while pos < payload.len() {
        let (filter, len) = read_string(&payload[pos..])?;
        pos += len;

        // [MQTT-4.7.3-1] a topic filter is at least one character
        if filter.is_empty() {
            return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
        }

        if pos >= payload.len() {
            return Err(DecodeError::InsufficientData);
        }
        let qos_byte = payload[pos];
        pos += 1;

        // [MQTT-3.8.3-4] upper six bits of the requested QoS byte are reserved
        let qos = QoS::from_u8(qos_byte).ok_or(DecodeError::InvalidQoS(qos_byte))?;

        filters.push(FilterRequest {
            filter: filter.to_string(),
            qos,
        });
    }

    // [MQTT-3.8.3-3] at least one filter/QoS pair
    if filters.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "SUBSCRIBE must carry at least one filter",
        ));
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
}

fn decode_suback(payload: &[u8]) -> Result<Packet, DecodeError> {
    if payload.len() < 3 {
        return Err(DecodeError::InsufficientData);
    }

    let packet_id = read_u16(payload)?;

    let mut return_codes = Vec::with_capacity(payload.len() - 2);
    for &code in &payload[2..] {
        return_codes.push(SubAckCode::from_u8(code).ok_or(DecodeError::InvalidReturnCode(code))?);
    }

    Ok(Packet::SubAck(SubAck {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(payload: &[u8]) -> Result<Packet, DecodeError> {
    let packet_id = read_u16(payload)?;
    if packet_id == 0 {
        return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
    }

    let mut pos = 2;
    let mut filters = Vec::new();

    while pos < payload.len() {
        let (filter, len) = read_string(&payload[pos..])?;
        pos += len;

        if filter.is_empty() {
            return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
        }

        filters.push(filter.to_string());
    }

    // [MQTT-3.10.3-2] at least one filter
    if filters.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "UNSUBSCRIBE must carry at least one filter",
        ));
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}

fn decode_unsuback(payload: &[u8]) -> Result<Packet, DecodeError> {
    if payload.len() != 2 {
        return Err(DecodeError::MalformedPacket("UNSUBACK payload must be 2 bytes"));
    }

    Ok(Packet::UnsubAck(UnsubAck {
        packet_id: read_u16(payload)?,
    }))
}

fn decode_empty(payload: &[u8], packet: Packet) -> Result<Packet, DecodeError> {
    if !payload.is_empty() {
        return Err(DecodeError::MalformedPacket("packet carries no payload"));
    }
    Ok(packet)
}
