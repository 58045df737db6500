//! BACnet/IP wire codec.
//!
//! The subset the collector speaks: Who-Is / I-Am discovery, ReadProperty,
//! WriteProperty, SubscribeCOV and COV notifications, all over BVLC/IP
//! (Annex J). Segmentation is not supported; devices that require it are
//! skipped at discovery.

use crate::error::{ProtocolError, Result};
use byteorder::{BigEndian, ByteOrder};

/// BVLC type octet for BACnet/IP.
pub const BVLC_TYPE: u8 = 0x81;
/// Original-Unicast-NPDU.
pub const BVLC_UNICAST: u8 = 0x0A;
/// Original-Broadcast-NPDU.
pub const BVLC_BROADCAST: u8 = 0x0B;

const NPDU_VERSION: u8 = 0x01;

/// Property identifiers used by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PropertyId {
    ObjectList = 76,
    PresentValue = 85,
}

impl PropertyId {
    pub fn from_u32(n: u32) -> Option<Self> {
        Some(match n {
            76 => PropertyId::ObjectList,
            85 => PropertyId::PresentValue,
            _ => return None,
        })
    }
}

/// BACnet object identifier: 10-bit type, 22-bit instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    pub object_type: u16,
    pub instance: u32,
}

impl ObjectId {
    pub const DEVICE_TYPE: u16 = 8;

    pub fn device(instance: u32) -> Self {
        Self { object_type: Self::DEVICE_TYPE, instance }
    }

    pub fn encode(self) -> u32 {
        (u32::from(self.object_type) << 22) | (self.instance & 0x3F_FFFF)
    }

    pub fn decode(raw: u32) -> Self {
        Self {
            object_type: (raw >> 22) as u16,
            instance: raw & 0x3F_FFFF,
        }
    }
}

/// Application-tagged values as they appear in property payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum AppValue {
    Null,
    Bool(bool),
    Unsigned(u32),
    Signed(i32),
    Real(f32),
    Double(f64),
    CharString(String),
    Enumerated(u32),
    ObjectId(ObjectId),
}

/// Confirmed service choices.
pub mod confirmed {
    pub const SUBSCRIBE_COV: u8 = 5;
    pub const COV_NOTIFICATION: u8 = 1;
    pub const READ_PROPERTY: u8 = 12;
    pub const WRITE_PROPERTY: u8 = 15;
}

/// Unconfirmed service choices.
pub mod unconfirmed {
    pub const I_AM: u8 = 0;
    pub const COV_NOTIFICATION: u8 = 2;
    pub const WHO_IS: u8 = 8;
}

// ============================================================================
// BVLC / NPDU framing
// ============================================================================

/// Wrap an APDU for transmission.
pub fn encode_bvlc(broadcast: bool, apdu: &[u8]) -> Vec<u8> {
    // NPDU: version + control. Broadcasts never expect a reply.
    let control = if broadcast { 0x00 } else { 0x04 };
    let npdu = [NPDU_VERSION, control];
    let total = 4 + npdu.len() + apdu.len();
    let mut frame = Vec::with_capacity(total);
    frame.push(BVLC_TYPE);
    frame.push(if broadcast { BVLC_BROADCAST } else { BVLC_UNICAST });
    frame.extend_from_slice(&(total as u16).to_be_bytes());
    frame.extend_from_slice(&npdu);
    frame.extend_from_slice(apdu);
    frame
}

/// Strip BVLC + NPDU, returning the APDU slice.
pub fn decode_bvlc(frame: &[u8]) -> Result<&[u8]> {
    if frame.len() < 6 {
        return Err(ProtocolError::FrameTooShort { expected: 6, got: frame.len() });
    }
    if frame[0] != BVLC_TYPE {
        return Err(ProtocolError::FrameError(format!("not BACnet/IP: {:#04x}", frame[0])));
    }
    let declared = BigEndian::read_u16(&frame[2..4]) as usize;
    if declared != frame.len() {
        return Err(ProtocolError::FrameError(format!(
            "BVLC length {declared} != datagram {}",
            frame.len()
        )));
    }
    let mut idx = 4;
    if frame[idx] != NPDU_VERSION {
        return Err(ProtocolError::FrameError(format!("NPDU version {:#04x}", frame[idx])));
    }
    let control = frame[idx + 1];
    idx += 2;
    // Skip DNET/DLEN/DADR and SNET/SLEN/SADR if routed.
    if control & 0x20 != 0 {
        let dlen = *frame.get(idx + 2).ok_or(ProtocolError::FrameTooShort { expected: idx + 3, got: frame.len() })? as usize;
        idx += 3 + dlen;
    }
    if control & 0x08 != 0 {
        let slen = *frame.get(idx + 2).ok_or(ProtocolError::FrameTooShort { expected: idx + 3, got: frame.len() })? as usize;
        idx += 3 + slen;
    }
    if control & 0x20 != 0 {
        idx += 1; // hop count
    }
    frame
        .get(idx..)
        .filter(|apdu| !apdu.is_empty())
        .ok_or(ProtocolError::FrameTooShort { expected: idx + 1, got: frame.len() })
}

// ============================================================================
// Tag primitives
// ============================================================================

fn write_tag(buf: &mut Vec<u8>, tag_number: u8, context: bool, len: usize) {
    let class = if context { 0x08 } else { 0x00 };
    let tag_part = if tag_number < 15 {
        tag_number << 4
    } else {
        0xF0
    };
    let lvt = if len < 5 { len as u8 } else { 5 };
    buf.push(tag_part | class | lvt);
    if tag_number >= 15 {
        buf.push(tag_number);
    }
    if len >= 5 {
        // Only u8 extended lengths occur in this subset.
        buf.push(len as u8);
    }
}

fn unsigned_len(v: u32) -> usize {
    match v {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}

fn write_unsigned_content(buf: &mut Vec<u8>, v: u32) {
    let len = unsigned_len(v);
    buf.extend_from_slice(&v.to_be_bytes()[4 - len..]);
}

fn write_context_unsigned(buf: &mut Vec<u8>, tag: u8, v: u32) {
    write_tag(buf, tag, true, unsigned_len(v));
    write_unsigned_content(buf, v);
}

fn write_context_object_id(buf: &mut Vec<u8>, tag: u8, id: ObjectId) {
    write_tag(buf, tag, true, 4);
    buf.extend_from_slice(&id.encode().to_be_bytes());
}

fn write_opening(buf: &mut Vec<u8>, tag: u8) {
    buf.push((tag << 4) | 0x08 | 0x06);
}

fn write_closing(buf: &mut Vec<u8>, tag: u8) {
    buf.push((tag << 4) | 0x08 | 0x07);
}

/// Write an application-tagged value.
pub fn write_app_value(buf: &mut Vec<u8>, value: &AppValue) {
    match value {
        AppValue::Null => write_tag(buf, 0, false, 0),
        AppValue::Bool(b) => {
            // Boolean encodes its value in the LVT field.
            buf.push((1 << 4) | u8::from(*b));
        }
        AppValue::Unsigned(v) => {
            write_tag(buf, 2, false, unsigned_len(*v));
            write_unsigned_content(buf, *v);
        }
        AppValue::Signed(v) => {
            let bytes = v.to_be_bytes();
            let sign_ext: u8 = if *v < 0 { 0xFF } else { 0x00 };
            let mut skip = 0;
            // Drop redundant sign bytes, keeping one when the next byte would
            // flip the decoded sign.
            while skip < 3 && bytes[skip] == sign_ext && (bytes[skip + 1] & 0x80) == (sign_ext & 0x80) {
                skip += 1;
            }
            write_tag(buf, 3, false, 4 - skip);
            buf.extend_from_slice(&bytes[skip..]);
        }
        AppValue::Real(v) => {
            write_tag(buf, 4, false, 4);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        AppValue::Double(v) => {
            write_tag(buf, 5, false, 8);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        AppValue::CharString(s) => {
            write_tag(buf, 7, false, s.len() + 1);
            buf.push(0x00); // UTF-8 charset
            buf.extend_from_slice(s.as_bytes());
        }
        AppValue::Enumerated(v) => {
            write_tag(buf, 9, false, unsigned_len(*v));
            write_unsigned_content(buf, *v);
        }
        AppValue::ObjectId(id) => {
            write_tag(buf, 12, false, 4);
            buf.extend_from_slice(&id.encode().to_be_bytes());
        }
    }
}

/// Sequential tag reader over an APDU payload.
pub struct TagReader<'a> {
    data: &'a [u8],
    pos: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagHeader {
    pub number: u8,
    pub context: bool,
    pub opening: bool,
    pub closing: bool,
    pub len: usize,
    /// LVT for boolean application tags.
    pub lvt: u8,
}

impl<'a> TagReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or(ProtocolError::FrameTooShort { expected: self.pos + 1, got: self.data.len() })?;
        self.pos += 1;
        Ok(b)
    }

    /// Read a tag header without consuming its content.
    pub fn read_header(&mut self) -> Result<TagHeader> {
        let octet = self.byte()?;
        let mut number = octet >> 4;
        let context = octet & 0x08 != 0;
        let lvt = octet & 0x07;
        if number == 0x0F {
            number = self.byte()?;
        }
        let (opening, closing, len) = match lvt {
            6 => (true, false, 0),
            7 => (false, true, 0),
            5 => {
                let ext = self.byte()? as usize;
                (false, false, ext)
            }
            n => (false, false, n as usize),
        };
        Ok(TagHeader { number, context, opening, closing, len, lvt })
    }

    fn content(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or(ProtocolError::FrameTooShort { expected: end, got: self.data.len() })?;
        self.pos = end;
        Ok(slice)
    }

    fn read_unsigned_content(&mut self, len: usize) -> Result<u32> {
        if len == 0 || len > 4 {
            return Err(ProtocolError::Malformed(format!("unsigned length {len}")));
        }
        let bytes = self.content(len)?;
        let mut v: u32 = 0;
        for b in bytes {
            v = (v << 8) | u32::from(*b);
        }
        Ok(v)
    }

    /// Expect a context-tagged unsigned with the given tag number.
    pub fn expect_context_unsigned(&mut self, tag: u8) -> Result<u32> {
        let header = self.read_header()?;
        if !header.context || header.number != tag {
            return Err(ProtocolError::Malformed(format!(
                "expected context tag {tag}, got {:?}",
                header
            )));
        }
        self.read_unsigned_content(header.len)
    }

    /// Expect a context-tagged object id.
    pub fn expect_context_object_id(&mut self, tag: u8) -> Result<ObjectId> {
        let header = self.read_header()?;
        if !header.context || header.number != tag || header.len != 4 {
            return Err(ProtocolError::Malformed(format!(
                "expected context object id {tag}, got {:?}",
                header
            )));
        }
        let raw = BigEndian::read_u32(self.content(4)?);
        Ok(ObjectId::decode(raw))
    }

    /// Expect an opening context tag.
    pub fn expect_opening(&mut self, tag: u8) -> Result<()> {
        let header = self.read_header()?;
        if !header.opening || header.number != tag {
            return Err(ProtocolError::Malformed(format!(
                "expected opening tag {tag}, got {:?}",
                header
            )));
        }
        Ok(())
    }

    /// True (and consumes) when the next tag closes `tag`.
    pub fn consume_closing(&mut self, tag: u8) -> Result<bool> {
        let saved = self.pos;
        let header = self.read_header()?;
        if header.closing && header.number == tag {
            return Ok(true);
        }
        self.pos = saved;
        Ok(false)
    }

    /// Read one application-tagged value.
    pub fn read_app_value(&mut self) -> Result<AppValue> {
        let header = self.read_header()?;
        if header.context {
            return Err(ProtocolError::Malformed(format!(
                "expected application tag, got context {}",
                header.number
            )));
        }
        Ok(match header.number {
            0 => AppValue::Null,
            1 => AppValue::Bool(header.lvt != 0),
            2 => AppValue::Unsigned(self.read_unsigned_content(header.len)?),
            3 => {
                let bytes = self.content(header.len)?;
                let mut v: i32 = if bytes.first().is_some_and(|b| b & 0x80 != 0) { -1 } else { 0 };
                for b in bytes {
                    v = (v << 8) | i32::from(*b);
                }
                AppValue::Signed(v)
            }
            4 => {
                if header.len != 4 {
                    return Err(ProtocolError::Malformed("real length".into()));
                }
                AppValue::Real(f32::from_be_bytes(self.content(4)?.try_into().unwrap_or([0; 4])))
            }
            5 => {
                if header.len != 8 {
                    return Err(ProtocolError::Malformed("double length".into()));
                }
                AppValue::Double(f64::from_be_bytes(self.content(8)?.try_into().unwrap_or([0; 8])))
            }
            7 => {
                let bytes = self.content(header.len)?;
                let text = bytes
                    .split_first()
                    .map(|(_, rest)| String::from_utf8_lossy(rest).into_owned())
                    .unwrap_or_default();
                AppValue::CharString(text)
            }
            9 => AppValue::Enumerated(self.read_unsigned_content(header.len)?),
            12 => {
                if header.len != 4 {
                    return Err(ProtocolError::Malformed("object id length".into()));
                }
                AppValue::ObjectId(ObjectId::decode(BigEndian::read_u32(self.content(4)?)))
            }
            n => return Err(ProtocolError::UnsupportedPacket(n)),
        })
    }
}

// ============================================================================
// Services
// ============================================================================

/// Who-Is, optionally bounded to an instance range.
pub fn encode_who_is(range: Option<(u32, u32)>) -> Vec<u8> {
    let mut apdu = vec![0x10, unconfirmed::WHO_IS];
    if let Some((lo, hi)) = range {
        write_context_unsigned(&mut apdu, 0, lo);
        write_context_unsigned(&mut apdu, 1, hi);
    }
    apdu
}

/// Decoded I-Am announcement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IAm {
    pub device: ObjectId,
    pub max_apdu: u32,
    /// 0 = both, 1 = transmit, 2 = receive, 3 = none.
    pub segmentation: u32,
    pub vendor_id: u32,
}

/// Encode an I-Am (used by the loopback test device).
pub fn encode_i_am(iam: &IAm) -> Vec<u8> {
    let mut apdu = vec![0x10, unconfirmed::I_AM];
    write_app_value(&mut apdu, &AppValue::ObjectId(iam.device));
    write_app_value(&mut apdu, &AppValue::Unsigned(iam.max_apdu));
    write_app_value(&mut apdu, &AppValue::Enumerated(iam.segmentation));
    write_app_value(&mut apdu, &AppValue::Unsigned(iam.vendor_id));
    apdu
}

pub fn decode_i_am(apdu: &[u8]) -> Result<IAm> {
    if apdu.len() < 2 || apdu[0] >> 4 != 0x1 || apdu[1] != unconfirmed::I_AM {
        return Err(ProtocolError::Malformed("not an I-Am".into()));
    }
    let mut reader = TagReader::new(&apdu[2..]);
    let device = match reader.read_app_value()? {
        AppValue::ObjectId(id) => id,
        other => return Err(ProtocolError::Malformed(format!("I-Am object id: {other:?}"))),
    };
    let max_apdu = match reader.read_app_value()? {
        AppValue::Unsigned(v) => v,
        other => return Err(ProtocolError::Malformed(format!("I-Am max APDU: {other:?}"))),
    };
    let segmentation = match reader.read_app_value()? {
        AppValue::Enumerated(v) => v,
        other => return Err(ProtocolError::Malformed(format!("I-Am segmentation: {other:?}"))),
    };
    let vendor_id = match reader.read_app_value()? {
        AppValue::Unsigned(v) => v,
        other => return Err(ProtocolError::Malformed(format!("I-Am vendor: {other:?}"))),
    };
    Ok(IAm { device, max_apdu, segmentation, vendor_id })
}

/// ReadProperty request.
pub fn encode_read_property(invoke_id: u8, object: ObjectId, property: PropertyId) -> Vec<u8> {
    // Confirmed request, max APDU 1476 (code 5), unsegmented.
    let mut apdu = vec![0x00, 0x05, invoke_id, confirmed::READ_PROPERTY];
    write_context_object_id(&mut apdu, 0, object);
    write_context_unsigned(&mut apdu, 1, property as u32);
    apdu
}

/// Decoded ReadProperty-ACK.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadPropertyAck {
    pub invoke_id: u8,
    pub object: ObjectId,
    pub property: u32,
    pub values: Vec<AppValue>,
}

/// WriteProperty request. `priority` follows the BACnet command priority
/// array (1..=16), absent for plain writes.
pub fn encode_write_property(
    invoke_id: u8,
    object: ObjectId,
    property: PropertyId,
    value: &AppValue,
    priority: Option<u8>,
) -> Vec<u8> {
    let mut apdu = vec![0x00, 0x05, invoke_id, confirmed::WRITE_PROPERTY];
    write_context_object_id(&mut apdu, 0, object);
    write_context_unsigned(&mut apdu, 1, property as u32);
    write_opening(&mut apdu, 3);
    write_app_value(&mut apdu, value);
    write_closing(&mut apdu, 3);
    if let Some(p) = priority {
        write_context_unsigned(&mut apdu, 4, u32::from(p));
    }
    apdu
}

/// SubscribeCOV request.
pub fn encode_subscribe_cov(
    invoke_id: u8,
    process_id: u32,
    object: ObjectId,
    confirmed_notifications: bool,
    lifetime_secs: u32,
) -> Vec<u8> {
    let mut apdu = vec![0x00, 0x05, invoke_id, confirmed::SUBSCRIBE_COV];
    write_context_unsigned(&mut apdu, 0, process_id);
    write_context_object_id(&mut apdu, 1, object);
    // Boolean as context tag: one content byte.
    write_tag(&mut apdu, 2, true, 1);
    apdu.push(u8::from(confirmed_notifications));
    write_context_unsigned(&mut apdu, 3, lifetime_secs);
    apdu
}

/// What arrived in one APDU.
#[derive(Debug, Clone, PartialEq)]
pub enum Apdu {
    IAm(IAm),
    ReadPropertyAck(ReadPropertyAck),
    SimpleAck { invoke_id: u8, service: u8 },
    Error { invoke_id: u8, service: u8, class: u32, code: u32 },
    CovNotification(CovNotification),
    /// Anything the subset does not handle; carried for logging.
    Other { pdu_type: u8 },
}

/// Decoded COV notification (confirmed or unconfirmed).
#[derive(Debug, Clone, PartialEq)]
pub struct CovNotification {
    /// Present only for confirmed notifications (needs a SimpleAck).
    pub invoke_id: Option<u8>,
    pub process_id: u32,
    pub device: ObjectId,
    pub object: ObjectId,
    pub time_remaining: u32,
    /// (property id, value) pairs.
    pub values: Vec<(u32, AppValue)>,
}

/// Classify and decode an incoming APDU.
pub fn decode_apdu(apdu: &[u8]) -> Result<Apdu> {
    if apdu.is_empty() {
        return Err(ProtocolError::FrameTooShort { expected: 1, got: 0 });
    }
    let pdu_type = apdu[0] >> 4;
    match pdu_type {
        // Unconfirmed request
        0x1 => {
            let service = *apdu.get(1).ok_or(ProtocolError::FrameTooShort { expected: 2, got: 1 })?;
            match service {
                unconfirmed::I_AM => Ok(Apdu::IAm(decode_i_am(apdu)?)),
                unconfirmed::COV_NOTIFICATION => {
                    Ok(Apdu::CovNotification(decode_cov_body(None, &apdu[2..])?))
                }
                _ => Ok(Apdu::Other { pdu_type }),
            }
        }
        // Confirmed request: only COV notifications arrive inbound.
        0x0 => {
            if apdu.len() < 4 {
                return Err(ProtocolError::FrameTooShort { expected: 4, got: apdu.len() });
            }
            let invoke_id = apdu[2];
            let service = apdu[3];
            if service == confirmed::COV_NOTIFICATION {
                Ok(Apdu::CovNotification(decode_cov_body(Some(invoke_id), &apdu[4..])?))
            } else {
                Ok(Apdu::Other { pdu_type })
            }
        }
        // Simple ack
        0x2 => {
            if apdu.len() < 3 {
                return Err(ProtocolError::FrameTooShort { expected: 3, got: apdu.len() });
            }
            Ok(Apdu::SimpleAck { invoke_id: apdu[1], service: apdu[2] })
        }
        // Complex ack
        0x3 => {
            if apdu.len() < 3 {
                return Err(ProtocolError::FrameTooShort { expected: 3, got: apdu.len() });
            }
            let invoke_id = apdu[1];
            let service = apdu[2];
            if service != confirmed::READ_PROPERTY {
                return Ok(Apdu::Other { pdu_type });
            }
            let mut reader = TagReader::new(&apdu[3..]);
            let object = reader.expect_context_object_id(0)?;
            let property = reader.expect_context_unsigned(1)?;
            reader.expect_opening(3)?;
            let mut values = Vec::new();
            while !reader.consume_closing(3)? {
                values.push(reader.read_app_value()?);
            }
            Ok(Apdu::ReadPropertyAck(ReadPropertyAck { invoke_id, object, property, values }))
        }
        // Error
        0x5 => {
            if apdu.len() < 3 {
                return Err(ProtocolError::FrameTooShort { expected: 3, got: apdu.len() });
            }
            let mut reader = TagReader::new(&apdu[3..]);
            let class = match reader.read_app_value()? {
                AppValue::Enumerated(v) => v,
                _ => 0,
            };
            let code = match reader.read_app_value()? {
                AppValue::Enumerated(v) => v,
                _ => 0,
            };
            Ok(Apdu::Error { invoke_id: apdu[1], service: apdu[2], class, code })
        }
        _ => Ok(Apdu::Other { pdu_type }),
    }
}

fn decode_cov_body(invoke_id: Option<u8>, body: &[u8]) -> Result<CovNotification> {
    let mut reader = TagReader::new(body);
    let process_id = reader.expect_context_unsigned(0)?;
    let device = reader.expect_context_object_id(1)?;
    let object = reader.expect_context_object_id(2)?;
    let time_remaining = reader.expect_context_unsigned(3)?;
    reader.expect_opening(4)?;
    let mut values = Vec::new();
    while !reader.consume_closing(4)? {
        let property = reader.expect_context_unsigned(0)?;
        reader.expect_opening(2)?;
        let value = reader.read_app_value()?;
        if !reader.consume_closing(2)? {
            return Err(ProtocolError::Malformed("unclosed property value".into()));
        }
        values.push((property, value));
    }
    Ok(CovNotification { invoke_id, process_id, device, object, time_remaining, values })
}

/// Encode a COV notification body (used by the loopback test device).
pub fn encode_cov_notification(n: &CovNotification) -> Vec<u8> {
    let mut apdu = match n.invoke_id {
        Some(id) => vec![0x00, 0x05, id, confirmed::COV_NOTIFICATION],
        None => vec![0x10, unconfirmed::COV_NOTIFICATION],
    };
    write_context_unsigned(&mut apdu, 0, n.process_id);
    write_context_object_id(&mut apdu, 1, n.device);
    write_context_object_id(&mut apdu, 2, n.object);
    write_context_unsigned(&mut apdu, 3, n.time_remaining);
    write_opening(&mut apdu, 4);
    for (property, value) in &n.values {
        write_context_unsigned(&mut apdu, 0, *property);
        write_opening(&mut apdu, 2);
        write_app_value(&mut apdu, value);
        write_closing(&mut apdu, 2);
    }
    write_closing(&mut apdu, 4);
    apdu
}

/// Encode a ReadProperty-ACK (used by the loopback test device).
pub fn encode_read_property_ack(ack: &ReadPropertyAck) -> Vec<u8> {
    let mut apdu = vec![0x30, ack.invoke_id, confirmed::READ_PROPERTY];
    write_context_object_id(&mut apdu, 0, ack.object);
    write_context_unsigned(&mut apdu, 1, ack.property);
    write_opening(&mut apdu, 3);
    for value in &ack.values {
        write_app_value(&mut apdu, value);
    }
    write_closing(&mut apdu, 3);
    apdu
}

/// Encode a SimpleAck for a confirmed service.
pub fn encode_simple_ack(invoke_id: u8, service: u8) -> Vec<u8> {
    vec![0x20, invoke_id, service]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_packing() {
        let id = ObjectId { object_type: 8, instance: 1234 };
        assert_eq!(ObjectId::decode(id.encode()), id);
        // Device type 8 in the top ten bits.
        assert_eq!(id.encode() >> 22, 8);
    }

    #[test]
    fn who_is_with_range() {
        let apdu = encode_who_is(Some((0, 4_194_303)));
        assert_eq!(apdu[0], 0x10);
        assert_eq!(apdu[1], unconfirmed::WHO_IS);
        // Context tag 0, then 1.
        assert_eq!(apdu[2] >> 4, 0);
        assert!(apdu[2] & 0x08 != 0);
    }

    #[test]
    fn i_am_roundtrip() {
        let iam = IAm {
            device: ObjectId::device(99),
            max_apdu: 1476,
            segmentation: 3,
            vendor_id: 260,
        };
        let apdu = encode_i_am(&iam);
        assert_eq!(decode_i_am(&apdu).unwrap(), iam);
        match decode_apdu(&apdu).unwrap() {
            Apdu::IAm(got) => assert_eq!(got, iam),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn read_property_ack_roundtrip() {
        let ack = ReadPropertyAck {
            invoke_id: 7,
            object: ObjectId { object_type: 0, instance: 5 },
            property: PropertyId::PresentValue as u32,
            values: vec![AppValue::Real(21.5)],
        };
        let apdu = encode_read_property_ack(&ack);
        match decode_apdu(&apdu).unwrap() {
            Apdu::ReadPropertyAck(got) => assert_eq!(got, ack),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn object_list_ack_with_many_ids() {
        let ack = ReadPropertyAck {
            invoke_id: 1,
            object: ObjectId::device(9),
            property: PropertyId::ObjectList as u32,
            values: vec![
                AppValue::ObjectId(ObjectId::device(9)),
                AppValue::ObjectId(ObjectId { object_type: 0, instance: 1 }),
                AppValue::ObjectId(ObjectId { object_type: 3, instance: 2 }),
            ],
        };
        let apdu = encode_read_property_ack(&ack);
        match decode_apdu(&apdu).unwrap() {
            Apdu::ReadPropertyAck(got) => assert_eq!(got.values.len(), 3),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn cov_notification_roundtrip() {
        let n = CovNotification {
            invoke_id: None,
            process_id: 12,
            device: ObjectId::device(99),
            object: ObjectId { object_type: 0, instance: 5 },
            time_remaining: 540,
            values: vec![
                (PropertyId::PresentValue as u32, AppValue::Real(3.25)),
            ],
        };
        let apdu = encode_cov_notification(&n);
        match decode_apdu(&apdu).unwrap() {
            Apdu::CovNotification(got) => assert_eq!(got, n),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn bvlc_roundtrip() {
        let apdu = encode_who_is(None);
        let frame = encode_bvlc(true, &apdu);
        assert_eq!(frame[0], BVLC_TYPE);
        assert_eq!(frame[1], BVLC_BROADCAST);
        assert_eq!(decode_bvlc(&frame).unwrap(), &apdu[..]);
    }

    #[test]
    fn bvlc_rejects_length_lies() {
        let apdu = encode_who_is(None);
        let mut frame = encode_bvlc(true, &apdu);
        frame[3] = frame[3].wrapping_add(1);
        assert!(decode_bvlc(&frame).is_err());
    }
}
