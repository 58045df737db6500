//! Modbus wire codec.
//!
//! Request/response PDUs for function codes 1, 2, 3, 4, 5, 6, 15, 16, plus
//! the two framings: MBAP (TCP) and RTU (CRC16 over serial). The codec is
//! transport-free; workers own the sockets.
//!
//! Wire layout, big endian throughout:
//! ```text
//! TCP:  [TID:2][PID:2][LEN:2][UNIT:1][PDU...]
//! RTU:  [SLAVE:1][PDU...][CRC:2 little endian]
//! ```

use crate::error::{ModbusExceptionKind, ProtocolError, Result};
use byteorder::{BigEndian, ByteOrder};

/// MBAP header size.
pub const MBAP_HEADER_LEN: usize = 7;
/// Largest PDU we will emit or accept.
pub const MAX_PDU_LEN: usize = 253;
/// Protocol identifier field for Modbus (always zero).
pub const MODBUS_PROTOCOL_ID: u16 = 0;

/// Modbus function codes the collector speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => FunctionCode::ReadCoils,
            0x02 => FunctionCode::ReadDiscreteInputs,
            0x03 => FunctionCode::ReadHoldingRegisters,
            0x04 => FunctionCode::ReadInputRegisters,
            0x05 => FunctionCode::WriteSingleCoil,
            0x06 => FunctionCode::WriteSingleRegister,
            0x0F => FunctionCode::WriteMultipleCoils,
            0x10 => FunctionCode::WriteMultipleRegisters,
            _ => return None,
        })
    }
}

/// A decoded request PDU (function + payload, no framing).
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    ReadCoils { address: u16, count: u16 },
    ReadDiscreteInputs { address: u16, count: u16 },
    ReadHoldingRegisters { address: u16, count: u16 },
    ReadInputRegisters { address: u16, count: u16 },
    WriteSingleCoil { address: u16, on: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
}

impl Request {
    pub fn function(&self) -> FunctionCode {
        match self {
            Request::ReadCoils { .. } => FunctionCode::ReadCoils,
            Request::ReadDiscreteInputs { .. } => FunctionCode::ReadDiscreteInputs,
            Request::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Request::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            Request::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Request::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Request::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils,
            Request::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    /// Encode the bare PDU.
    pub fn encode_pdu(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(8);
        pdu.push(self.function() as u8);
        match self {
            Request::ReadCoils { address, count }
            | Request::ReadDiscreteInputs { address, count }
            | Request::ReadHoldingRegisters { address, count }
            | Request::ReadInputRegisters { address, count } => {
                push_u16(&mut pdu, *address);
                push_u16(&mut pdu, *count);
            }
            Request::WriteSingleCoil { address, on } => {
                push_u16(&mut pdu, *address);
                push_u16(&mut pdu, if *on { 0xFF00 } else { 0x0000 });
            }
            Request::WriteSingleRegister { address, value } => {
                push_u16(&mut pdu, *address);
                push_u16(&mut pdu, *value);
            }
            Request::WriteMultipleCoils { address, values } => {
                push_u16(&mut pdu, *address);
                push_u16(&mut pdu, values.len() as u16);
                let byte_count = values.len().div_ceil(8);
                pdu.push(byte_count as u8);
                let mut packed = vec![0u8; byte_count];
                for (i, on) in values.iter().enumerate() {
                    if *on {
                        packed[i / 8] |= 1 << (i % 8);
                    }
                }
                pdu.extend_from_slice(&packed);
            }
            Request::WriteMultipleRegisters { address, values } => {
                push_u16(&mut pdu, *address);
                push_u16(&mut pdu, values.len() as u16);
                pdu.push((values.len() * 2) as u8);
                for v in values {
                    push_u16(&mut pdu, *v);
                }
            }
        }
        pdu
    }
}

/// A decoded response PDU.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// FC 1/2: unpacked bit values, trimmed to the requested count by the caller.
    Bits(Vec<bool>),
    /// FC 3/4: 16-bit register values.
    Registers(Vec<u16>),
    /// FC 5/6/15/16 echo: address plus value-or-count.
    WriteAck { address: u16, value: u16 },
}

/// Decode a response PDU against the request's function code.
///
/// Exception responses (function | 0x80) map into the exception taxonomy.
pub fn decode_response_pdu(sent: FunctionCode, slave: u8, pdu: &[u8]) -> Result<Response> {
    if pdu.is_empty() {
        return Err(ProtocolError::FrameTooShort { expected: 2, got: 0 });
    }
    let function = pdu[0];
    if function == sent as u8 | 0x80 {
        let code = *pdu.get(1).ok_or(ProtocolError::FrameTooShort { expected: 2, got: 1 })?;
        return Err(ProtocolError::ModbusException {
            slave,
            exception: ModbusExceptionKind::from_code(code),
        });
    }
    if function != sent as u8 {
        return Err(ProtocolError::FunctionMismatch { sent: sent as u8, got: function });
    }

    match sent {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            let byte_count = *pdu.get(1).ok_or(ProtocolError::FrameTooShort { expected: 2, got: 1 })? as usize;
            let data = pdu
                .get(2..2 + byte_count)
                .ok_or(ProtocolError::FrameTooShort { expected: 2 + byte_count, got: pdu.len() })?;
            let mut bits = Vec::with_capacity(byte_count * 8);
            for byte in data {
                for bit in 0..8 {
                    bits.push(byte & (1 << bit) != 0);
                }
            }
            Ok(Response::Bits(bits))
        }
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            let byte_count = *pdu.get(1).ok_or(ProtocolError::FrameTooShort { expected: 2, got: 1 })? as usize;
            if byte_count % 2 != 0 {
                return Err(ProtocolError::FrameError(format!(
                    "odd register byte count {byte_count}"
                )));
            }
            let data = pdu
                .get(2..2 + byte_count)
                .ok_or(ProtocolError::FrameTooShort { expected: 2 + byte_count, got: pdu.len() })?;
            let registers = data.chunks_exact(2).map(BigEndian::read_u16).collect();
            Ok(Response::Registers(registers))
        }
        FunctionCode::WriteSingleCoil
        | FunctionCode::WriteSingleRegister
        | FunctionCode::WriteMultipleCoils
        | FunctionCode::WriteMultipleRegisters => {
            if pdu.len() < 5 {
                return Err(ProtocolError::FrameTooShort { expected: 5, got: pdu.len() });
            }
            Ok(Response::WriteAck {
                address: BigEndian::read_u16(&pdu[1..3]),
                value: BigEndian::read_u16(&pdu[3..5]),
            })
        }
    }
}

// ============================================================================
// MBAP (TCP) framing
// ============================================================================

/// Wrap a PDU in an MBAP frame.
pub fn encode_tcp_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    let mut header = [0u8; MBAP_HEADER_LEN];
    BigEndian::write_u16(&mut header[0..2], transaction_id);
    BigEndian::write_u16(&mut header[2..4], MODBUS_PROTOCOL_ID);
    BigEndian::write_u16(&mut header[4..6], (pdu.len() + 1) as u16);
    header[6] = unit_id;
    frame.extend_from_slice(&header);
    frame.extend_from_slice(pdu);
    frame
}

/// A parsed MBAP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub unit_id: u8,
    /// PDU length (header length field minus the unit byte).
    pub pdu_len: usize,
}

/// Parse the 7-byte MBAP header; the PDU follows on the stream.
pub fn decode_tcp_header(header: &[u8]) -> Result<MbapHeader> {
    if header.len() < MBAP_HEADER_LEN {
        return Err(ProtocolError::FrameTooShort { expected: MBAP_HEADER_LEN, got: header.len() });
    }
    let protocol_id = BigEndian::read_u16(&header[2..4]);
    if protocol_id != MODBUS_PROTOCOL_ID {
        return Err(ProtocolError::FrameError(format!(
            "unexpected protocol id {protocol_id}"
        )));
    }
    let len = BigEndian::read_u16(&header[4..6]) as usize;
    if len < 2 || len > MAX_PDU_LEN + 1 {
        return Err(ProtocolError::FrameError(format!("implausible MBAP length {len}")));
    }
    Ok(MbapHeader {
        transaction_id: BigEndian::read_u16(&header[0..2]),
        unit_id: header[6],
        pdu_len: len - 1,
    })
}

// ============================================================================
// RTU framing
// ============================================================================

/// CRC-16/MODBUS (poly 0xA001, init 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Frame a PDU for the serial bus: slave + PDU + CRC (low byte first).
pub fn encode_rtu_frame(slave: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pdu.len() + 3);
    frame.push(slave);
    frame.extend_from_slice(pdu);
    let crc = crc16(&frame);
    frame.push((crc & 0xFF) as u8);
    frame.push((crc >> 8) as u8);
    frame
}

/// Validate an RTU frame and strip framing; returns `(slave, pdu)`.
pub fn decode_rtu_frame(frame: &[u8]) -> Result<(u8, &[u8])> {
    if frame.len() < 4 {
        return Err(ProtocolError::FrameTooShort { expected: 4, got: frame.len() });
    }
    let (body, crc_bytes) = frame.split_at(frame.len() - 2);
    let received = u16::from(crc_bytes[0]) | (u16::from(crc_bytes[1]) << 8);
    let computed = crc16(body);
    if received != computed {
        return Err(ProtocolError::CrcMismatch { computed, received });
    }
    Ok((body[0], &body[1..]))
}

/// Expected response PDU length for a request, used by the RTU reader to know
/// how many bytes to pull off the wire before the CRC.
pub fn expected_response_pdu_len(request: &Request) -> usize {
    match request {
        Request::ReadCoils { count, .. } | Request::ReadDiscreteInputs { count, .. } => {
            2 + (*count as usize).div_ceil(8)
        }
        Request::ReadHoldingRegisters { count, .. } | Request::ReadInputRegisters { count, .. } => {
            2 + *count as usize * 2
        }
        Request::WriteSingleCoil { .. }
        | Request::WriteSingleRegister { .. }
        | Request::WriteMultipleCoils { .. }
        | Request::WriteMultipleRegisters { .. } => 5,
    }
}

fn push_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}
