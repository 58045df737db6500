//! MQTT v3.1.1 packet codec.
//!
//! Client-side subset: CONNECT/CONNACK, PUBLISH (QoS 0/1), PUBACK,
//! SUBSCRIBE/SUBACK, UNSUBSCRIBE/UNSUBACK, PINGREQ/PINGRESP, DISCONNECT.
//! The codec parses from a growable buffer so the worker can feed it raw
//! TCP reads; `try_decode` returns `None` until a whole packet is buffered.

use crate::error::{ProtocolError, Result};
use bytes::{Buf, BytesMut};

/// Quality of service for subscriptions and publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => return Err(ProtocolError::Malformed(format!("QoS {v}"))),
        })
    }
}

/// CONNECT parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub will: Option<Will>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted,
    UnacceptableProtocol,
    IdentifierRejected,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
    Unknown(u8),
}

impl ConnectReturnCode {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Accepted,
            1 => Self::UnacceptableProtocol,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadCredentials,
            5 => Self::NotAuthorized,
            other => Self::Unknown(other),
        }
    }
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Connect),
    ConnAck { session_present: bool, code: ConnectReturnCode },
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        dup: bool,
        /// Present for QoS > 0.
        packet_id: Option<u16>,
    },
    PubAck { packet_id: u16 },
    Subscribe { packet_id: u16, topics: Vec<(String, QoS)> },
    SubAck { packet_id: u16, return_codes: Vec<u8> },
    Unsubscribe { packet_id: u16, topics: Vec<String> },
    UnsubAck { packet_id: u16 },
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Serialise for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        let first_byte = match self {
            Packet::Connect(c) => {
                write_str(&mut body, "MQTT");
                body.push(0x04); // protocol level 3.1.1
                let mut flags = 0u8;
                if c.clean_session {
                    flags |= 0x02;
                }
                if let Some(will) = &c.will {
                    flags |= 0x04 | ((will.qos as u8) << 3);
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
                body.push(flags);
                body.extend_from_slice(&c.keep_alive_secs.to_be_bytes());
                write_str(&mut body, &c.client_id);
                if let Some(will) = &c.will {
                    write_str(&mut body, &will.topic);
                    write_bytes(&mut body, &will.payload);
                }
                if let Some(username) = &c.username {
                    write_str(&mut body, username);
                }
                if let Some(password) = &c.password {
                    write_str(&mut body, password);
                }
                0x10
            }
            Packet::ConnAck { session_present, code } => {
                body.push(u8::from(*session_present));
                body.push(match code {
                    ConnectReturnCode::Accepted => 0,
                    ConnectReturnCode::UnacceptableProtocol => 1,
                    ConnectReturnCode::IdentifierRejected => 2,
                    ConnectReturnCode::ServerUnavailable => 3,
                    ConnectReturnCode::BadCredentials => 4,
                    ConnectReturnCode::NotAuthorized => 5,
                    ConnectReturnCode::Unknown(v) => *v,
                });
                0x20
            }
            Packet::Publish { topic, payload, qos, retain, dup, packet_id } => {
                write_str(&mut body, topic);
                if *qos != QoS::AtMostOnce {
                    let id = packet_id.unwrap_or(1);
                    body.extend_from_slice(&id.to_be_bytes());
                }
                body.extend_from_slice(payload);
                0x30 | (u8::from(*dup) << 3) | ((*qos as u8) << 1) | u8::from(*retain)
            }
            Packet::PubAck { packet_id } => {
                body.extend_from_slice(&packet_id.to_be_bytes());
                0x40
            }
            Packet::Subscribe { packet_id, topics } => {
                body.extend_from_slice(&packet_id.to_be_bytes());
                for (topic, qos) in topics {
                    write_str(&mut body, topic);
                    body.push(*qos as u8);
                }
                0x82
            }
            Packet::SubAck { packet_id, return_codes } => {
                body.extend_from_slice(&packet_id.to_be_bytes());
                body.extend_from_slice(return_codes);
                0x90
            }
            Packet::Unsubscribe { packet_id, topics } => {
                body.extend_from_slice(&packet_id.to_be_bytes());
                for topic in topics {
                    write_str(&mut body, topic);
                }
                0xA2
            }
            Packet::UnsubAck { packet_id } => {
                body.extend_from_slice(&packet_id.to_be_bytes());
                0xB0
            }
            Packet::PingReq => 0xC0,
            Packet::PingResp => 0xD0,
            Packet::Disconnect => 0xE0,
        };

        let mut out = Vec::with_capacity(body.len() + 5);
        out.push(first_byte);
        encode_remaining_length(&mut out, body.len());
        out.extend_from_slice(&body);
        out
    }

    /// Try to decode one packet from the front of `buf`. Consumes the bytes
    /// on success; returns `Ok(None)` when more data is needed.
    pub fn try_decode(buf: &mut BytesMut) -> Result<Option<Packet>> {
        let Some((remaining_len, header_len)) = peek_remaining_length(buf)? else {
            return Ok(None);
        };
        let total = header_len + remaining_len;
        if buf.len() < total {
            return Ok(None);
        }
        let first_byte = buf[0];
        buf.advance(header_len);
        let mut body = buf.split_to(remaining_len);
        let packet = decode_body(first_byte, &mut body)?;
        Ok(Some(packet))
    }
}

fn decode_body(first_byte: u8, body: &mut BytesMut) -> Result<Packet> {
    let packet_type = first_byte >> 4;
    match packet_type {
        0x1 => {
            let protocol = read_str(body)?;
            if protocol != "MQTT" {
                return Err(ProtocolError::Malformed(format!("protocol name {protocol:?}")));
            }
            need(body, 4)?;
            let level = body.get_u8();
            if level != 0x04 {
                return Err(ProtocolError::Malformed(format!("protocol level {level:#04x}")));
            }
            let flags = body.get_u8();
            let keep_alive_secs = body.get_u16();
            let client_id = read_str(body)?;
            let will = if flags & 0x04 != 0 {
                let topic = read_str(body)?;
                need(body, 2)?;
                let len = body.get_u16() as usize;
                need(body, len)?;
                let payload = body.split_to(len).to_vec();
                Some(Will {
                    topic,
                    payload,
                    qos: QoS::from_u8((flags >> 3) & 0x03)?,
                    retain: flags & 0x20 != 0,
                })
            } else {
                None
            };
            let username = if flags & 0x80 != 0 { Some(read_str(body)?) } else { None };
            let password = if flags & 0x40 != 0 { Some(read_str(body)?) } else { None };
            Ok(Packet::Connect(Connect {
                client_id,
                keep_alive_secs,
                clean_session: flags & 0x02 != 0,
                username,
                password,
                will,
            }))
        }
        0x2 => {
            need(body, 2)?;
            let session_present = body.get_u8() & 0x01 != 0;
            let code = ConnectReturnCode::from_u8(body.get_u8());
            Ok(Packet::ConnAck { session_present, code })
        }
        0x3 => {
            let dup = first_byte & 0x08 != 0;
            let qos = QoS::from_u8((first_byte >> 1) & 0x03)?;
            let retain = first_byte & 0x01 != 0;
            let topic = read_str(body)?;
            let packet_id = if qos != QoS::AtMostOnce {
                need(body, 2)?;
                Some(body.get_u16())
            } else {
                None
            };
            let payload = body.split().to_vec();
            Ok(Packet::Publish { topic, payload, qos, retain, dup, packet_id })
        }
        0x4 => {
            need(body, 2)?;
            Ok(Packet::PubAck { packet_id: body.get_u16() })
        }
        0x8 => {
            need(body, 2)?;
            let packet_id = body.get_u16();
            let mut topics = Vec::new();
            while !body.is_empty() {
                let topic = read_str(body)?;
                need(body, 1)?;
                topics.push((topic, QoS::from_u8(body.get_u8())?));
            }
            Ok(Packet::Subscribe { packet_id, topics })
        }
        0x9 => {
            need(body, 2)?;
            let packet_id = body.get_u16();
            let return_codes = body.split().to_vec();
            Ok(Packet::SubAck { packet_id, return_codes })
        }
        0xA => {
            need(body, 2)?;
            let packet_id = body.get_u16();
            let mut topics = Vec::new();
            while !body.is_empty() {
                topics.push(read_str(body)?);
            }
            Ok(Packet::Unsubscribe { packet_id, topics })
        }
        0xB => {
            need(body, 2)?;
            Ok(Packet::UnsubAck { packet_id: body.get_u16() })
        }
        0xC => Ok(Packet::PingReq),
        0xD => Ok(Packet::PingResp),
        0xE => Ok(Packet::Disconnect),
        other => Err(ProtocolError::UnsupportedPacket(other)),
    }
}

fn encode_remaining_length(out: &mut Vec<u8>, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

/// Returns `(remaining_length, fixed_header_len)` or `None` when incomplete.
fn peek_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut len: usize = 0;
    let mut shift = 0u32;
    for (i, byte) in buf.iter().skip(1).take(4).enumerate() {
        len |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some((len, i + 2)));
        }
        shift += 7;
    }
    if buf.len() >= 5 {
        return Err(ProtocolError::Malformed("remaining length overflows 4 bytes".into()));
    }
    Ok(None)
}

fn need(body: &BytesMut, n: usize) -> Result<()> {
    if body.len() < n {
        return Err(ProtocolError::FrameTooShort { expected: n, got: body.len() });
    }
    Ok(())
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn write_bytes(out: &mut Vec<u8>, b: &[u8]) {
    out.extend_from_slice(&(b.len() as u16).to_be_bytes());
    out.extend_from_slice(b);
}

fn read_str(body: &mut BytesMut) -> Result<String> {
    need(body, 2)?;
    let len = body.get_u16() as usize;
    need(body, len)?;
    let bytes = body.split_to(len);
    String::from_utf8(bytes.to_vec())
        .map_err(|_| ProtocolError::Malformed("invalid UTF-8 string".into()))
}

/// MQTT topic-filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
