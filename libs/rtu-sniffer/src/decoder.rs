//! Modbus RTU frame decoding
//!
//! Request and response share a function code but not a layout, and the
//! bytes alone cannot tell which one a frame is. The decoder therefore
//! tries both layouts and keeps every interpretation whose length is
//! exactly consistent ([`FrameShapes`]). The correlator picks one later.
//!
//! Decoding never fails. Unknown function codes keep their raw bytes and
//! an empty payload; CRC failures are decoded anyway and flagged.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::assembler::CandidateFrame;
use crate::constants::{CRC_LEN, EXCEPTION_FLAG};
use crate::crc;

// ============================================================================
// Function and exception codes
// ============================================================================

/// Function codes the decoder understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FunctionCode {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    WriteMultipleCoils,
    WriteMultipleRegisters,
    ReadWriteMultipleRegisters,
    Other(u8),
}

impl FunctionCode {
    /// Classify a raw function code; the exception bit is ignored
    pub fn from_u8(code: u8) -> Self {
        match code & !EXCEPTION_FLAG {
            0x01 => FunctionCode::ReadCoils,
            0x02 => FunctionCode::ReadDiscreteInputs,
            0x03 => FunctionCode::ReadHoldingRegisters,
            0x04 => FunctionCode::ReadInputRegisters,
            0x05 => FunctionCode::WriteSingleCoil,
            0x06 => FunctionCode::WriteSingleRegister,
            0x0F => FunctionCode::WriteMultipleCoils,
            0x10 => FunctionCode::WriteMultipleRegisters,
            0x17 => FunctionCode::ReadWriteMultipleRegisters,
            other => FunctionCode::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            FunctionCode::ReadCoils => 0x01,
            FunctionCode::ReadDiscreteInputs => 0x02,
            FunctionCode::ReadHoldingRegisters => 0x03,
            FunctionCode::ReadInputRegisters => 0x04,
            FunctionCode::WriteSingleCoil => 0x05,
            FunctionCode::WriteSingleRegister => 0x06,
            FunctionCode::WriteMultipleCoils => 0x0F,
            FunctionCode::WriteMultipleRegisters => 0x10,
            FunctionCode::ReadWriteMultipleRegisters => 0x17,
            FunctionCode::Other(code) => code,
        }
    }

    pub fn is_known(self) -> bool {
        !matches!(self, FunctionCode::Other(_))
    }

    pub fn name(self) -> &'static str {
        match self {
            FunctionCode::ReadCoils => "Read Coils",
            FunctionCode::ReadDiscreteInputs => "Read Discrete Inputs",
            FunctionCode::ReadHoldingRegisters => "Read Holding Registers",
            FunctionCode::ReadInputRegisters => "Read Input Registers",
            FunctionCode::WriteSingleCoil => "Write Single Coil",
            FunctionCode::WriteSingleRegister => "Write Single Register",
            FunctionCode::WriteMultipleCoils => "Write Multiple Coils",
            FunctionCode::WriteMultipleRegisters => "Write Multiple Registers",
            FunctionCode::ReadWriteMultipleRegisters => "Read/Write Multiple Registers",
            FunctionCode::Other(_) => "Unknown",
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.code())
    }
}

/// Exception codes carried by exception responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    Acknowledge,
    SlaveDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailedToRespond,
    Other(u8),
}

impl ExceptionCode {
    pub fn from_u8(code: u8) -> Self {
        match code {
            0x01 => ExceptionCode::IllegalFunction,
            0x02 => ExceptionCode::IllegalDataAddress,
            0x03 => ExceptionCode::IllegalDataValue,
            0x04 => ExceptionCode::SlaveDeviceFailure,
            0x05 => ExceptionCode::Acknowledge,
            0x06 => ExceptionCode::SlaveDeviceBusy,
            0x08 => ExceptionCode::MemoryParityError,
            0x0A => ExceptionCode::GatewayPathUnavailable,
            0x0B => ExceptionCode::GatewayTargetFailedToRespond,
            other => ExceptionCode::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            ExceptionCode::IllegalFunction => 0x01,
            ExceptionCode::IllegalDataAddress => 0x02,
            ExceptionCode::IllegalDataValue => 0x03,
            ExceptionCode::SlaveDeviceFailure => 0x04,
            ExceptionCode::Acknowledge => 0x05,
            ExceptionCode::SlaveDeviceBusy => 0x06,
            ExceptionCode::MemoryParityError => 0x08,
            ExceptionCode::GatewayPathUnavailable => 0x0A,
            ExceptionCode::GatewayTargetFailedToRespond => 0x0B,
            ExceptionCode::Other(code) => code,
        }
    }

    /// Get exception code description
    pub fn description(self) -> &'static str {
        match self {
            ExceptionCode::IllegalFunction => "Illegal Function",
            ExceptionCode::IllegalDataAddress => "Illegal Data Address",
            ExceptionCode::IllegalDataValue => "Illegal Data Value",
            ExceptionCode::SlaveDeviceFailure => "Slave Device Failure",
            ExceptionCode::Acknowledge => "Acknowledge",
            ExceptionCode::SlaveDeviceBusy => "Slave Device Busy",
            ExceptionCode::MemoryParityError => "Memory Parity Error",
            ExceptionCode::GatewayPathUnavailable => "Gateway Path Unavailable",
            ExceptionCode::GatewayTargetFailedToRespond => "Gateway Target Device Failed to Respond",
            ExceptionCode::Other(_) => "Unknown Exception",
        }
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Values carried by a multiple-write request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteValues {
    /// FC15, one entry per coil in the request quantity
    Coils(Vec<bool>),
    /// FC16
    Registers(Vec<u16>),
}

/// Decoded fields of one interpretation of a frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FramePayload {
    /// FC1-4 request
    ReadRequest { start: u16, quantity: u16 },
    /// FC1/2 response; padding bits of the last byte included
    ReadBitsResponse { byte_count: u8, bits: Vec<bool> },
    /// FC3/4/23 response
    ReadRegistersResponse { byte_count: u8, registers: Vec<u16> },
    /// FC5/6 request, and the identical echo
    WriteSingle { address: u16, value: u16 },
    /// FC15/16 request
    WriteMultipleRequest {
        start: u16,
        quantity: u16,
        byte_count: u8,
        values: WriteValues,
    },
    /// FC15/16 response
    WriteMultipleResponse { start: u16, quantity: u16 },
    /// FC23 request
    ReadWriteRequest {
        read_start: u16,
        read_quantity: u16,
        write_start: u16,
        write_quantity: u16,
        byte_count: u8,
        values: Vec<u16>,
    },
    /// Exception response
    Exception { function: u8, code: ExceptionCode },
    Empty,
}

static EMPTY_PAYLOAD: FramePayload = FramePayload::Empty;

/// Every interpretation consistent with a frame's length
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FrameShapes {
    pub request: Option<FramePayload>,
    pub response: Option<FramePayload>,
}

impl FrameShapes {
    pub fn is_empty(&self) -> bool {
        self.request.is_none() && self.response.is_none()
    }

    /// Only a response layout fits
    pub fn is_response_only(&self) -> bool {
        self.request.is_none() && self.response.is_some()
    }
}

/// Role of a frame in its transaction
///
/// Assigned by the correlator; a fresh frame is `RoleUnknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum FrameRole {
    #[default]
    RoleUnknown,
    Request,
    Response,
}

// ============================================================================
// Decoded frame
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    /// 0 is broadcast
    pub slave_address: u8,
    /// Raw function code, exception bit included
    pub function_code: u8,
    pub raw_bytes: Vec<u8>,
    pub crc_valid: bool,
    /// Arrival of the first byte
    pub timestamp: Instant,
    /// Arrival of the last byte
    pub ended_at: Instant,
    /// Wall clock time of `timestamp`
    pub wall_time: DateTime<Utc>,
    pub shapes: FrameShapes,
    pub role: FrameRole,
}

impl DecodedFrame {
    pub fn function(&self) -> FunctionCode {
        FunctionCode::from_u8(self.function_code)
    }

    pub fn is_exception(&self) -> bool {
        self.function_code & EXCEPTION_FLAG != 0
    }

    pub fn is_broadcast(&self) -> bool {
        self.slave_address == crate::constants::BROADCAST_ADDRESS
    }

    /// Exception code of an exception response
    pub fn exception_code(&self) -> Option<ExceptionCode> {
        match &self.shapes.response {
            Some(FramePayload::Exception { code, .. }) => Some(*code),
            _ => None,
        }
    }

    /// Interpretation matching the frame's role
    ///
    /// While the role is unresolved the payload is only returned if one
    /// layout fits, or both layouts agree (a single write and its echo).
    pub fn payload(&self) -> &FramePayload {
        let chosen = match self.role {
            FrameRole::Request => self.shapes.request.as_ref(),
            FrameRole::Response => self.shapes.response.as_ref(),
            FrameRole::RoleUnknown => match (&self.shapes.request, &self.shapes.response) {
                (Some(request), Some(response)) if request == response => Some(request),
                (Some(request), None) => Some(request),
                (None, Some(response)) => Some(response),
                _ => None,
            },
        };
        chosen.unwrap_or(&EMPTY_PAYLOAD)
    }

    /// Function code and data, without address and CRC
    pub fn pdu(&self) -> &[u8] {
        if self.raw_bytes.len() < 1 + CRC_LEN {
            return &[];
        }
        &self.raw_bytes[1..self.raw_bytes.len() - CRC_LEN]
    }

    /// Bytes between function code and CRC
    pub fn data(&self) -> &[u8] {
        self.pdu().get(1..).unwrap_or(&[])
    }

    pub fn raw_hex(&self) -> String {
        common::hex::encode_spaced(&self.raw_bytes)
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Maps monotonic capture instants to wall clock time
#[derive(Debug, Clone, Copy)]
pub struct CaptureClock {
    origin: Instant,
    origin_wall: DateTime<Utc>,
}

impl CaptureClock {
    /// Anchor the clock at the current instant
    pub fn start() -> Self {
        Self::anchored(Instant::now(), Utc::now())
    }

    pub fn anchored(origin: Instant, origin_wall: DateTime<Utc>) -> Self {
        Self {
            origin,
            origin_wall,
        }
    }

    pub fn wall_time(&self, at: Instant) -> DateTime<Utc> {
        let offset = |d| chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero());
        if at >= self.origin {
            self.origin_wall + offset(at - self.origin)
        } else {
            self.origin_wall - offset(self.origin - at)
        }
    }
}

impl Default for CaptureClock {
    fn default() -> Self {
        Self::start()
    }
}

// ============================================================================
// Decoder
// ============================================================================

/// Stateless frame decoder
#[derive(Debug, Clone, Default)]
pub struct FrameDecoder {
    clock: CaptureClock,
}

impl FrameDecoder {
    pub fn new(clock: CaptureClock) -> Self {
        Self { clock }
    }

    pub fn clock(&self) -> &CaptureClock {
        &self.clock
    }

    pub fn decode(&self, frame: CandidateFrame) -> DecodedFrame {
        let check = crc::check(&frame.bytes);
        let slave_address = frame.bytes.first().copied().unwrap_or_default();
        let function_code = frame.bytes.get(1).copied().unwrap_or_default();

        let shapes = if frame.bytes.len() >= 2 + CRC_LEN {
            let data = &frame.bytes[2..frame.bytes.len() - CRC_LEN];
            decode_shapes(function_code, data)
        } else {
            FrameShapes::default()
        };

        let decoded = DecodedFrame {
            slave_address,
            function_code,
            crc_valid: check.valid,
            timestamp: frame.started_at,
            ended_at: frame.last_byte_at,
            wall_time: self.clock.wall_time(frame.started_at),
            shapes,
            role: FrameRole::RoleUnknown,
            raw_bytes: frame.bytes,
        };

        debug!(
            "RX frame: addr={} FC={:02X} len={} crc_ok={} [{}]",
            decoded.slave_address,
            decoded.function_code,
            decoded.raw_bytes.len(),
            decoded.crc_valid,
            decoded.raw_hex()
        );
        if !check.valid {
            warn!(
                "CRC mismatch (bus corruption): addr={} FC={:02X} expected 0x{:04X}, got 0x{:04X}",
                decoded.slave_address, decoded.function_code, check.computed, check.received
            );
        }

        decoded
    }
}

/// Decode every layout consistent with `data` for a function code
pub fn decode_shapes(function_code: u8, data: &[u8]) -> FrameShapes {
    if function_code & EXCEPTION_FLAG != 0 {
        let response = match data {
            [code] => Some(FramePayload::Exception {
                function: function_code & !EXCEPTION_FLAG,
                code: ExceptionCode::from_u8(*code),
            }),
            _ => None,
        };
        return FrameShapes {
            request: None,
            response,
        };
    }

    match FunctionCode::from_u8(function_code) {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => FrameShapes {
            request: read_request(data),
            response: counted_block(data).map(|block| FramePayload::ReadBitsResponse {
                byte_count: data[0],
                bits: unpack_bits(block, block.len() * 8),
            }),
        },
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => FrameShapes {
            request: read_request(data),
            response: register_response(data),
        },
        FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => {
            let shape = word_pair(data).map(|(address, value)| FramePayload::WriteSingle {
                address,
                value,
            });
            FrameShapes {
                request: shape.clone(),
                response: shape,
            }
        },
        FunctionCode::WriteMultipleCoils => FrameShapes {
            request: write_multiple_request(data, false),
            response: write_multiple_response(data),
        },
        FunctionCode::WriteMultipleRegisters => FrameShapes {
            request: write_multiple_request(data, true),
            response: write_multiple_response(data),
        },
        FunctionCode::ReadWriteMultipleRegisters => FrameShapes {
            request: read_write_request(data),
            response: register_response(data),
        },
        FunctionCode::Other(_) => FrameShapes::default(),
    }
}

fn word(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

/// Exactly two big-endian words
fn word_pair(data: &[u8]) -> Option<(u16, u16)> {
    (data.len() == 4).then(|| (word(data, 0), word(data, 2)))
}

/// Byte count followed by exactly that many bytes
fn counted_block(data: &[u8]) -> Option<&[u8]> {
    let (&count, block) = data.split_first()?;
    (block.len() == usize::from(count)).then_some(block)
}

fn registers(block: &[u8]) -> Vec<u16> {
    block
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

/// Unpack coil bits, LSB of the first byte first
fn unpack_bits(block: &[u8], count: usize) -> Vec<bool> {
    (0..count.min(block.len() * 8))
        .map(|i| block[i / 8] & (1 << (i % 8)) != 0)
        .collect()
}

fn read_request(data: &[u8]) -> Option<FramePayload> {
    word_pair(data).map(|(start, quantity)| FramePayload::ReadRequest { start, quantity })
}

fn register_response(data: &[u8]) -> Option<FramePayload> {
    let block = counted_block(data)?;
    (block.len() % 2 == 0).then(|| FramePayload::ReadRegistersResponse {
        byte_count: data[0],
        registers: registers(block),
    })
}

fn write_multiple_response(data: &[u8]) -> Option<FramePayload> {
    word_pair(data).map(|(start, quantity)| FramePayload::WriteMultipleResponse { start, quantity })
}

fn write_multiple_request(data: &[u8], registers_block: bool) -> Option<FramePayload> {
    if data.len() < 5 {
        return None;
    }
    let start = word(data, 0);
    let quantity = word(data, 2);
    let block = counted_block(&data[4..])?;
    let byte_count = data[4];

    let values = if registers_block {
        if block.len() != usize::from(quantity) * 2 {
            return None;
        }
        WriteValues::Registers(registers(block))
    } else {
        if block.len() != usize::from(quantity).div_ceil(8) {
            return None;
        }
        WriteValues::Coils(unpack_bits(block, usize::from(quantity)))
    };

    Some(FramePayload::WriteMultipleRequest {
        start,
        quantity,
        byte_count,
        values,
    })
}

fn read_write_request(data: &[u8]) -> Option<FramePayload> {
    if data.len() < 9 {
        return None;
    }
    let write_quantity = word(data, 6);
    let block = counted_block(&data[8..])?;
    if block.len() != usize::from(write_quantity) * 2 {
        return None;
    }
    Some(FramePayload::ReadWriteRequest {
        read_start: word(data, 0),
        read_quantity: word(data, 2),
        write_start: word(data, 4),
        write_quantity,
        byte_count: data[8],
        values: registers(block),
    })
}
