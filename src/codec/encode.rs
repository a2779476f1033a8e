//! MQTT packet encoder
//!
//! Encoders compute the remaining length before writing the fixed header,
//! so a serialized packet's length prefix is exact by construction.

use bytes::BufMut;

use super::{remaining_length_len, write_binary, write_remaining_length, write_string};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, Publish, QoS, SubAck, Subscribe, UnsubAck, Unsubscribe,
    PROTOCOL_HEADER,
};

impl Packet {
    /// Exact number of bytes this packet occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        let remaining = remaining_len(self);
        1 + remaining_length_len(remaining as u32) + remaining
    }
}

fn remaining_len(packet: &Packet) -> usize {
    match packet {
        Packet::Connect(p) => connect_remaining_len(p),
        Packet::ConnAck(_) => 2,
        Packet::Publish(p) => publish_remaining_len(p),
        Packet::Subscribe(p) => {
            2 + p
                .filters
                .iter()
                .map(|f| 2 + f.filter.len() + 1)
                .sum::<usize>()
        }
        Packet::SubAck(p) => 2 + p.return_codes.len(),
        Packet::Unsubscribe(p) => {
            2 + p.filters.iter().map(|f| 2 + f.len()).sum::<usize>()
        }
        Packet::UnsubAck(_) => 2,
        Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
    }
}

fn connect_remaining_len(p: &Connect) -> usize {
    let mut len = PROTOCOL_HEADER.len() + 1 + 2; // header, flags, keep alive
    len += 2 + p.client_id.len();
    if let Some(will) = &p.will {
        len += 2 + will.topic.len() + 2 + will.payload.len();
    }
    if let Some(username) = &p.username {
        len += 2 + username.len();
    }
    if let Some(password) = &p.password {
        len += 2 + password.len();
    }
    len
}

fn publish_remaining_len(p: &Publish) -> usize {
    let mut len = 2 + p.topic.len() + p.payload.len();
    if p.qos != QoS::AtMostOnce {
        len += 2;
    }
    len
}

/// MQTT packet encoder
#[derive(Debug, Default, Clone, Copy)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet, extending the buffer as needed.
    pub fn encode(&self, packet: &Packet, buf: &mut impl BufMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => encode_connect(p, buf),
            Packet::ConnAck(p) => encode_connack(p, buf),
            Packet::Publish(p) => encode_publish(p, buf),
            Packet::Subscribe(p) => encode_subscribe(p, buf),
            Packet::SubAck(p) => encode_suback(p, buf),
            Packet::Unsubscribe(p) => encode_unsubscribe(p, buf),
            Packet::UnsubAck(p) => encode_unsuback(p, buf),
            Packet::PingReq => encode_header_only(0xC0, buf),
            Packet::PingResp => encode_header_only(0xD0, buf),
            Packet::Disconnect => encode_header_only(0xE0, buf),
        }
    }

    /// Encode into a caller-provided buffer.
    ///
    /// Fails with [`EncodeError::BufferTooSmall`] when the buffer is shorter
    /// than [`Packet::encoded_len`]; on success returns the bytes written.
    pub fn encode_to_slice(&self, packet: &Packet, buf: &mut [u8]) -> Result<usize, EncodeError> {
        let len = packet.encoded_len();
        if buf.len() < len {
            return Err(EncodeError::BufferTooSmall);
        }
        let mut cursor = &mut buf[..len];
        self.encode(packet, &mut cursor)?;
        Ok(len)
    }
}

fn encode_connect(packet: &Connect, buf: &mut impl BufMut) -> Result<(), EncodeError> {
    let remaining = connect_remaining_len(packet);

    buf.put_u8(0x10);
    write_remaining_length(buf, remaining as u32)?;

    buf.put_slice(&PROTOCOL_HEADER);

    let mut connect_flags: u8 = 0;
    if packet.clean_session {
        connect_flags |= 0x02;
    }
    if let Some(will) = &packet.will {
        connect_flags |= 0x04;
        connect_flags |= (will.qos as u8) << 3;
        if will.retain {
            connect_flags |= 0x20;
        }
    }
    if packet.password.is_some() {
        connect_flags |= 0x40;
    }
    if packet.username.is_some() {
        connect_flags |= 0x80;
    }
    buf.put_u8(connect_flags);

    buf.put_u16(packet.keep_alive);

    write_string(buf, &packet.client_id)?;

    if let Some(will) = &packet.will {
        write_string(buf, &will.topic)?;
        write_binary(buf, &will.payload)?;
    }
    if let Some(username) = &packet.username {
        write_string(buf, username)?;
    }
    if let Some(password) = &packet.password {
        write_binary(buf, password)?;
    }

    Ok(())
}

fn encode_connack(packet: &ConnAck, buf: &mut impl BufMut) -> Result<(), EncodeError> {
    buf.put_u8(0x20);
    buf.put_u8(0x02);
    buf.put_u8(packet.session_present as u8);
    buf.put_u8(packet.return_code as u8);
    Ok(())
}

fn encode_publish(packet: &Publish, buf: &mut impl BufMut) -> Result<(), EncodeError> {
    let remaining = publish_remaining_len(packet);

    let mut first_byte: u8 = 0x30;
    if packet.dup {
        first_byte |= 0x08;
    }
    first_byte |= (packet.qos as u8) << 1;
    if packet.retain {
        first_byte |= 0x01;
    }
    buf.put_u8(first_byte);
    write_remaining_length(buf, remaining as u32)?;

    write_string(buf, &packet.topic)?;

    if packet.qos != QoS::AtMostOnce {
        // A QoS>0 publish always carries a packet identifier
        buf.put_u16(packet.packet_id.unwrap_or(1));
    }

    buf.put_slice(&packet.payload);

    Ok(())
}

fn encode_subscribe(packet: &Subscribe, buf: &mut impl BufMut) -> Result<(), EncodeError> {
    let remaining = 2 + packet
        .filters
        .iter()
        .map(|f| 2 + f.filter.len() + 1)
        .sum::<usize>();

    buf.put_u8(0x82); // SUBSCRIBE with mandatory flags 0010
    write_remaining_length(buf, remaining as u32)?;
    buf.put_u16(packet.packet_id);

    for request in &packet.filters {
        write_string(buf, &request.filter)?;
        buf.put_u8(request.qos as u8);
    }

    Ok(())
}

fn encode_suback(packet: &SubAck, buf: &mut impl BufMut) -> Result<(), EncodeError> {
    let remaining = 2 + packet.return_codes.len();

    buf.put_u8(0x90);
    write_remaining_length(buf, remaining as u32)?;
    buf.put_u16(packet.packet_id);

    for &code in &packet.return_codes {
        buf.put_u8(code as u8);
    }

    Ok(())
}

fn encode_unsubscribe(packet: &Unsubscribe, buf: &mut impl BufMut) -> Result<(), EncodeError> {
    let remaining = 2 + packet.filters.iter().map(|f| 2 + f.len()).sum::<usize>();

    buf.put_u8(0xA2); // UNSUBSCRIBE with mandatory flags 0010
    write_remaining_length(buf, remaining as u32)?;
    buf.put_u16(packet.packet_id);

    for filter in &packet.filters {
        write_string(buf, filter)?;
    }

    Ok(())
}

fn encode_unsuback(packet: &UnsubAck, buf: &mut impl BufMut) -> Result<(), EncodeError> {
    buf.put_u8(0xB0);
    buf.put_u8(0x02);
    buf.put_u16(packet.packet_id);
    Ok(())
}

fn encode_header_only(first_byte: u8, buf: &mut impl BufMut) -> Result<(), EncodeError> {
    buf.put_u8(first_byte);
    buf.put_u8(0x00);
    Ok(())
}
