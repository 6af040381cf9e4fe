// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! MQTT v3.1.1 control packet types and their wire encoding.
//!
//! The client also encodes a v3.1 CONNECT (protocol name `MQIsdp`, level 3)
//! for the fallback path taken when a broker rejects protocol level 4 and no
//! version was pinned in the options. Everything else on the wire is identical
//! between the two revisions.
//!
//! [`Packet::decode`] consumes complete frames from the front of a growable
//! buffer, returning `Ok(None)` while a frame is still partial, which is the
//! contract the comms pump's reader loop builds on.

use bytes::{BufMut, Bytes, BytesMut};

/// MQTT protocol revision used for the CONNECT handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// MQTT v3.1 (protocol name `MQIsdp`, level 3).
    V3_1,
    /// MQTT v3.1.1 (protocol name `MQTT`, level 4).
    V3_1_1,
}

impl ProtocolVersion {
    pub fn level(self) -> u8 {
        match self {
            ProtocolVersion::V3_1 => 3,
            ProtocolVersion::V3_1_1 => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ProtocolVersion::V3_1 => "MQIsdp",
            ProtocolVersion::V3_1_1 => "MQTT",
        }
    }

    pub fn from_level(level: u8) -> Result<Self, ProtocolError> {
        match level {
            3 => Ok(ProtocolVersion::V3_1),
            4 => Ok(ProtocolVersion::V3_1_1),
            other => Err(ProtocolError::InvalidProtocolLevel(other)),
        }
    }
}

/// Quality of Service level of a PUBLISH flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(ProtocolError::InvalidQos(other)),
        }
    }
}

/// CONNACK return code (MQTT v3.1.1 §3.2.2.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernameOrPassword = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(ConnectReturnCode::Accepted),
            1 => Ok(ConnectReturnCode::UnacceptableProtocolVersion),
            2 => Ok(ConnectReturnCode::IdentifierRejected),
            3 => Ok(ConnectReturnCode::ServerUnavailable),
            4 => Ok(ConnectReturnCode::BadUsernameOrPassword),
            5 => Ok(ConnectReturnCode::NotAuthorized),
            other => Err(ProtocolError::InvalidConnackCode(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ConnectReturnCode::Accepted => "connection accepted",
            ConnectReturnCode::UnacceptableProtocolVersion => {
                "connection refused: unacceptable protocol version"
            }
            ConnectReturnCode::IdentifierRejected => "connection refused: identifier rejected",
            ConnectReturnCode::ServerUnavailable => "connection refused: server unavailable",
            ConnectReturnCode::BadUsernameOrPassword => {
                "connection refused: bad user name or password"
            }
            ConnectReturnCode::NotAuthorized => "connection refused: not authorized",
        };
        f.write_str(text)
    }
}

/// Error raised while encoding or decoding a control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame ended before its declared length.
    Truncated,
    /// Remaining-length varint used more than four bytes.
    MalformedRemainingLength,
    InvalidPacketType(u8),
    InvalidQos(u8),
    InvalidConnackCode(u8),
    InvalidProtocolLevel(u8),
    InvalidUtf8,
    /// A topic or string field exceeds the 65535-byte wire limit.
    StringTooLong(usize),
    /// A packet that is not legal at this point of the session, such as a
    /// non-CONNACK reply to CONNECT.
    UnexpectedPacket,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Truncated => write!(f, "truncated packet"),
            ProtocolError::MalformedRemainingLength => write!(f, "malformed remaining length"),
            ProtocolError::InvalidPacketType(t) => write!(f, "invalid packet type {t}"),
            ProtocolError::InvalidQos(q) => write!(f, "invalid QoS {q}"),
            ProtocolError::InvalidConnackCode(c) => write!(f, "invalid CONNACK return code {c}"),
            ProtocolError::InvalidProtocolLevel(l) => write!(f, "invalid protocol level {l}"),
            ProtocolError::InvalidUtf8 => write!(f, "string field is not valid UTF-8"),
            ProtocolError::StringTooLong(n) => write!(f, "string field of {n} bytes exceeds 65535"),
            ProtocolError::UnexpectedPacket => write!(f, "unexpected packet for session state"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Will message carried in the CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol: ProtocolVersion,
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<LastWill>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connack {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Zero for QoS 0, where no identifier travels on the wire.
    pub packet_id: u16,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub topics: Vec<(String, QoS)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    /// One code per requested topic: granted QoS 0-2, or 0x80 for failure.
    pub return_codes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

/// An MQTT v3.1.1 control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback { packet_id: u16 },
    Pubrec { packet_id: u16 },
    Pubrel { packet_id: u16 },
    Pubcomp { packet_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback { packet_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

impl Packet {
    /// Packet identifier carried by this packet, if any.
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Packet::Publish(p) if p.qos != QoS::AtMostOnce => Some(p.packet_id),
            Packet::Puback { packet_id }
            | Packet::Pubrec { packet_id }
            | Packet::Pubrel { packet_id }
            | Packet::Pubcomp { packet_id }
            | Packet::Unsuback { packet_id } => Some(*packet_id),
            Packet::Subscribe(s) => Some(s.packet_id),
            Packet::Suback(s) => Some(s.packet_id),
            Packet::Unsubscribe(u) => Some(u.packet_id),
            _ => None,
        }
    }

    /// Appends the wire encoding of this packet to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        let first_byte = match self {
            Packet::Connect(c) => {
                write_string(&mut body, c.protocol.name())?;
                body.put_u8(c.protocol.level());
                let mut flags = 0u8;
                if c.clean_session {
                    flags |= 0x02;
                }
                if let Some(will) = &c.will {
                    flags |= 0x04;
                    flags |= (will.qos as u8) << 3;
                    if will.retain {
                        flags |= 0x20;
                    }
                }
                if c.password.is_some() {
                    flags |= 0x40;
                }
                if c.username.is_some() {
                    flags |= 0x80;
                }
                body.put_u8(flags);
                body.put_u16(c.keep_alive);
                write_string(&mut body, &c.client_id)?;
                if let Some(will) = &c.will {
                    write_string(&mut body, &will.topic)?;
                    write_bytes(&mut body, &will.payload)?;
                }
                if let Some(username) = &c.username {
                    write_string(&mut body, username)?;
                }
                if let Some(password) = &c.password {
                    write_bytes(&mut body, password)?;
                }
                0x10
            }
            Packet::Connack(ca) => {
                body.put_u8(u8::from(ca.session_present));
                body.put_u8(ca.return_code.as_u8());
                0x20
            }
            Packet::Publish(p) => {
                write_string(&mut body, &p.topic)?;
                if p.qos != QoS::AtMostOnce {
                    body.put_u16(p.packet_id);
                }
                body.extend_from_slice(&p.payload);
                let mut first = 0x30 | ((p.qos as u8) << 1);
                if p.dup {
                    first |= 0x08;
                }
                if p.retain {
                    first |= 0x01;
                }
                first
            }
            Packet::Puback { packet_id } => {
                body.put_u16(*packet_id);
                0x40
            }
            Packet::Pubrec { packet_id } => {
                body.put_u16(*packet_id);
                0x50
            }
            Packet::Pubrel { packet_id } => {
                body.put_u16(*packet_id);
                0x62
            }
            Packet::Pubcomp { packet_id } => {
                body.put_u16(*packet_id);
                0x70
            }
            Packet::Subscribe(s) => {
                body.put_u16(s.packet_id);
                for (topic, qos) in &s.topics {
                    write_string(&mut body, topic)?;
                    body.put_u8(*qos as u8);
                }
                0x82
            }
            Packet::Suback(s) => {
                body.put_u16(s.packet_id);
                for code in &s.return_codes {
                    body.put_u8(*code);
                }
                0x90
            }
            Packet::Unsubscribe(u) => {
                body.put_u16(u.packet_id);
                for topic in &u.topics {
                    write_string(&mut body, topic)?;
                }
                0xA2
            }
            Packet::Unsuback { packet_id } => {
                body.put_u16(*packet_id);
                0xB0
            }
            Packet::Pingreq => 0xC0,
            Packet::Pingresp => 0xD0,
            Packet::Disconnect => 0xE0,
        };

        buf.put_u8(first_byte);
        write_remaining_length(buf, body.len());
        buf.extend_from_slice(&body);
        Ok(())
    }

    /// Convenience wrapper returning the encoding as a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Removes and decodes one complete packet from the front of `buf`.
    /// Returns `Ok(None)` while the buffer holds only a partial frame.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
        let Some((header_len, remaining_len)) = parse_fixed_header(buf)? else {
            return Ok(None);
        };
        let total = header_len + remaining_len;
        if buf.len() < total {
            return Ok(None);
        }
        let frame = buf.split_to(total).freeze();
        Self::parse(frame, header_len).map(Some)
    }

    fn parse(frame: Bytes, header_len: usize) -> Result<Packet, ProtocolError> {
        let first = frame[0];
        let packet_type = first >> 4;
        let flags = first & 0x0F;
        let mut cursor = Cursor::new(frame.clone(), header_len);

        let packet = match packet_type {
            1 => {
                let _protocol_name = cursor.read_string()?;
                let protocol = ProtocolVersion::from_level(cursor.read_u8()?)?;
                let connect_flags = cursor.read_u8()?;
                let keep_alive = cursor.read_u16()?;
                let client_id = cursor.read_string()?;
                let will = if connect_flags & 0x04 != 0 {
                    let topic = cursor.read_string()?;
                    let payload = cursor.read_bytes()?;
                    Some(LastWill {
                        topic,
                        payload,
                        qos: QoS::from_u8((connect_flags >> 3) & 0x03)?,
                        retain: connect_flags & 0x20 != 0,
                    })
                } else {
                    None
                };
                let username = if connect_flags & 0x80 != 0 {
                    Some(cursor.read_string()?)
                } else {
                    None
                };
                let password = if connect_flags & 0x40 != 0 {
                    Some(cursor.read_bytes()?.to_vec())
                } else {
                    None
                };
                Packet::Connect(Connect {
                    protocol,
                    client_id,
                    keep_alive,
                    clean_session: connect_flags & 0x02 != 0,
                    username,
                    password,
                    will,
                })
            }
            2 => {
                let ack_flags = cursor.read_u8()?;
                let return_code = ConnectReturnCode::from_u8(cursor.read_u8()?)?;
                Packet::Connack(Connack {
                    session_present: ack_flags & 0x01 != 0,
                    return_code,
                })
            }
            3 => {
                let qos = QoS::from_u8((flags >> 1) & 0x03)?;
                let topic = cursor.read_string()?;
                let packet_id = if qos != QoS::AtMostOnce {
                    cursor.read_u16()?
                } else {
                    0
                };
                let payload = cursor.rest();
                Packet::Publish(Publish {
                    dup: flags & 0x08 != 0,
                    qos,
                    retain: flags & 0x01 != 0,
                    topic,
                    packet_id,
                    payload,
                })
            }
            4 => Packet::Puback {
                packet_id: cursor.read_u16()?,
            },
            5 => Packet::Pubrec {
                packet_id: cursor.read_u16()?,
            },
            6 => Packet::Pubrel {
                packet_id: cursor.read_u16()?,
            },
            7 => Packet::Pubcomp {
                packet_id: cursor.read_u16()?,
            },
            8 => {
                let packet_id = cursor.read_u16()?;
                let mut topics = Vec::new();
                while cursor.has_remaining() {
                    let topic = cursor.read_string()?;
                    let qos = QoS::from_u8(cursor.read_u8()?)?;
                    topics.push((topic, qos));
                }
                Packet::Subscribe(Subscribe { packet_id, topics })
            }
            9 => {
                let packet_id = cursor.read_u16()?;
                let mut return_codes = Vec::new();
                while cursor.has_remaining() {
                    return_codes.push(cursor.read_u8()?);
                }
                Packet::Suback(Suback {
                    packet_id,
                    return_codes,
                })
            }
            10 => {
                let packet_id = cursor.read_u16()?;
                let mut topics = Vec::new();
                while cursor.has_remaining() {
                    topics.push(cursor.read_string()?);
                }
                Packet::Unsubscribe(Unsubscribe { packet_id, topics })
            }
            11 => Packet::Unsuback {
                packet_id: cursor.read_u16()?,
            },
            12 => Packet::Pingreq,
            13 => Packet::Pingresp,
            14 => Packet::Disconnect,
            other => return Err(ProtocolError::InvalidPacketType(other)),
        };

        Ok(packet)
    }
}

/// Parses the fixed header at the front of `buf`, returning the header length
/// (first byte plus remaining-length varint) and the remaining length.
/// `Ok(None)` means more bytes are needed.
fn parse_fixed_header(buf: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut remaining_len = 0usize;
    let mut shift = 0u32;
    for (i, byte) in buf.iter().skip(1).enumerate() {
        if i >= 4 {
            return Err(ProtocolError::MalformedRemainingLength);
        }
        remaining_len |= ((byte & 0x7F) as usize) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(Some((i + 2, remaining_len)));
        }
    }
    Ok(None)
}

fn write_remaining_length(buf: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), ProtocolError> {
    write_bytes(buf, s.as_bytes())
}

fn write_bytes(buf: &mut BytesMut, b: &[u8]) -> Result<(), ProtocolError> {
    if b.len() > u16::MAX as usize {
        return Err(ProtocolError::StringTooLong(b.len()));
    }
    buf.put_u16(b.len() as u16);
    buf.extend_from_slice(b);
    Ok(())
}

/// Cheap cursor over one decoded frame. Slices hand out `Bytes` views into the
/// frame rather than copies.
struct Cursor {
    frame: Bytes,
    pos: usize,
}

impl Cursor {
    fn new(frame: Bytes, pos: usize) -> Self {
        Self { frame, pos }
    }

    fn has_remaining(&self) -> bool {
        self.pos < self.frame.len()
    }

    fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        if self.pos >= self.frame.len() {
            return Err(ProtocolError::Truncated);
        }
        let byte = self.frame[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        if self.pos + 2 > self.frame.len() {
            return Err(ProtocolError::Truncated);
        }
        let value = u16::from_be_bytes([self.frame[self.pos], self.frame[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    fn read_bytes(&mut self) -> Result<Bytes, ProtocolError> {
        let len = self.read_u16()? as usize;
        if self.pos + len > self.frame.len() {
            return Err(ProtocolError::Truncated);
        }
        let out = self.frame.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(out)
    }

    fn read_string(&mut self) -> Result<String, ProtocolError> {
        let bytes = self.read_bytes()?;
        std::str::from_utf8(&bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn rest(&self) -> Bytes {
        self.frame.slice(self.pos..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet) -> Packet {
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        Packet::decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn connect_carries_flags_and_payload_fields() {
        let packet = Packet::Connect(Connect {
            protocol: ProtocolVersion::V3_1_1,
            client_id: "sensor-7".into(),
            keep_alive: 30,
            clean_session: false,
            username: Some("user".into()),
            password: Some(b"secret".to_vec()),
            will: Some(LastWill {
                topic: "status/sensor-7".into(),
                payload: Bytes::from_static(b"gone"),
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
        });
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn v31_connect_uses_legacy_protocol_name() {
        let packet = Packet::Connect(Connect {
            protocol: ProtocolVersion::V3_1,
            client_id: "c".into(),
            keep_alive: 0,
            clean_session: true,
            username: None,
            password: None,
            will: None,
        });
        let bytes = packet.to_bytes().unwrap();
        // Variable header starts after the 2-byte fixed header: length-prefixed
        // protocol name then level 3.
        assert_eq!(&bytes[2..4], &[0x00, 0x06]);
        assert_eq!(&bytes[4..10], b"MQIsdp");
        assert_eq!(bytes[10], 3);
    }

    #[test]
    fn publish_qos0_omits_packet_id() {
        let packet = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "a/b".into(),
            packet_id: 0,
            payload: Bytes::from_static(b"hi"),
        });
        let bytes = packet.to_bytes().unwrap();
        // type/flags, remaining length, topic (2 + 3), payload (2)
        assert_eq!(bytes.len(), 2 + 2 + 3 + 2);
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn publish_qos2_roundtrips_dup_and_retain() {
        let packet = Packet::Publish(Publish {
            dup: true,
            qos: QoS::ExactlyOnce,
            retain: true,
            topic: "a/b".into(),
            packet_id: 42,
            payload: Bytes::from_static(b"payload"),
        });
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn subscribe_suback_roundtrip() {
        let sub = Packet::Subscribe(Subscribe {
            packet_id: 7,
            topics: vec![
                ("sensors/+/temp".into(), QoS::AtLeastOnce),
                ("alerts/#".into(), QoS::ExactlyOnce),
            ],
        });
        assert_eq!(roundtrip(sub.clone()), sub);

        let suback = Packet::Suback(Suback {
            packet_id: 7,
            return_codes: vec![1, 0x80],
        });
        assert_eq!(roundtrip(suback.clone()), suback);
    }

    #[test]
    fn acks_and_bare_packets_roundtrip() {
        for packet in [
            Packet::Puback { packet_id: 1 },
            Packet::Pubrec { packet_id: 2 },
            Packet::Pubrel { packet_id: 3 },
            Packet::Pubcomp { packet_id: 4 },
            Packet::Unsuback { packet_id: 5 },
            Packet::Unsubscribe(Unsubscribe {
                packet_id: 6,
                topics: vec!["a/b".into(), "c".into()],
            }),
            Packet::Pingreq,
            Packet::Pingresp,
            Packet::Disconnect,
            Packet::Connack(Connack {
                session_present: true,
                return_code: ConnectReturnCode::Accepted,
            }),
        ] {
            assert_eq!(roundtrip(packet.clone()), packet);
        }
    }

    #[test]
    fn decode_waits_for_complete_frame() {
        let packet = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: "t".into(),
            packet_id: 9,
            payload: Bytes::from(vec![0u8; 300]),
        });
        let bytes = packet.to_bytes().unwrap();

        let mut buf = BytesMut::new();
        for chunk in bytes.chunks(64) {
            let before = Packet::decode(&mut buf).unwrap();
            assert!(before.is_none() || buf.is_empty());
            buf.extend_from_slice(chunk);
        }
        assert_eq!(Packet::decode(&mut buf).unwrap().unwrap(), packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_two_packets_from_one_buffer() {
        let mut buf = BytesMut::new();
        Packet::Pingresp.encode(&mut buf).unwrap();
        Packet::Puback { packet_id: 3 }.encode(&mut buf).unwrap();
        assert_eq!(Packet::decode(&mut buf).unwrap().unwrap(), Packet::Pingresp);
        assert_eq!(
            Packet::decode(&mut buf).unwrap().unwrap(),
            Packet::Puback { packet_id: 3 }
        );
        assert!(Packet::decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn rejects_bad_remaining_length_and_type() {
        let mut buf = BytesMut::from(&[0x30, 0x80, 0x80, 0x80, 0x80, 0x01][..]);
        assert_eq!(
            Packet::decode(&mut buf),
            Err(ProtocolError::MalformedRemainingLength)
        );

        let mut buf = BytesMut::from(&[0x00, 0x00][..]);
        assert_eq!(Packet::decode(&mut buf), Err(ProtocolError::InvalidPacketType(0)));
    }

    #[test]
    fn rejects_unknown_connack_code() {
        let mut buf = BytesMut::from(&[0x20, 0x02, 0x00, 0x09][..]);
        assert_eq!(
            Packet::decode(&mut buf),
            Err(ProtocolError::InvalidConnackCode(9))
        );
    }
}
