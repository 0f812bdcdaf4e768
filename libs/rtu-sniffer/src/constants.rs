//! Modbus RTU constants
//!
//! Frame limits follow Modbus over Serial Line:
//! - RS485 ADU is at most 256 bytes
//! - Address (1) + Function (1) + CRC (2) is the smallest frame that can
//!   carry meaning

use std::time::Duration;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Smallest candidate frame the assembler forwards
/// Format: Address(1) + Function(1) + CRC(2) = 4 bytes
pub const MIN_FRAME_LEN: usize = 4;

/// Maximum RTU ADU size on a serial line
/// Address(1) + PDU(253) + CRC(2) = 256 bytes
pub const MAX_ADU_SIZE: usize = 256;

/// Maximum PDU (function code + data) size
pub const MAX_PDU_SIZE: usize = 253;

/// CRC trailer length
pub const CRC_LEN: usize = 2;

/// Broadcast slave address (never answered)
pub const BROADCAST_ADDRESS: u8 = 0;

/// Highest assignable slave address
pub const MAX_SLAVE_ADDRESS: u8 = 247;

/// Bit set in the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// CRC-16 (Modbus)
// ============================================================================

/// Reflected polynomial of CRC-16/MODBUS
pub const CRC16_POLY: u16 = 0xA001;

/// Initial CRC register value
pub const CRC16_INIT: u16 = 0xFFFF;

// ============================================================================
// Timing Constants
// ============================================================================

/// Data bits per RTU character (fixed by the protocol)
pub const RTU_DATA_BITS: u8 = 8;

/// Inter-frame silence, in character times, below 19200 baud
///
/// Calibrated against the documented default: 9600 baud, even parity,
/// 1 stop bit gives 11 bits/char and 3 × 11 / 9600 s = 3.4375 ms.
pub const INTER_FRAME_CHARS: u64 = 3;

/// Baud rate from which the fixed silence applies
pub const HIGH_BAUD_THRESHOLD: u32 = 19_200;

/// Fixed inter-frame silence for fast links
pub const HIGH_BAUD_INTER_FRAME: Duration = Duration::from_micros(1_750);

/// Default transaction window, in multiples of the inter-frame silence
pub const DEFAULT_RESPONSE_TIMEOUT_FACTOR: u32 = 10;

/// Upper bound for any configured timeout
pub const MAX_CONFIG_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound for `response_timeout_factor`
pub const MAX_RESPONSE_TIMEOUT_FACTOR: u32 = 10_000;

/// Lower bound for the periodic timeout sweep
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

// ============================================================================
// Channel Sizing
// ============================================================================

/// Default capacity of the transport → pipeline byte channel
///
/// Roughly one second of traffic at 9600 baud.
pub const DEFAULT_BYTE_CHANNEL_CAPACITY: usize = 1024;

/// Default per-consumer event queue capacity
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Serial read chunk size
pub const SERIAL_READ_CHUNK: usize = 256;

/// Calculate full RTU frame size for a PDU length
///
/// # Example
/// ```
/// use rtu_sniffer::constants::rtu_frame_size;
/// assert_eq!(rtu_frame_size(5), 8); // address + 5-byte PDU + CRC
/// ```
#[inline]
pub const fn rtu_frame_size(pdu_len: usize) -> usize {
    1 + pdu_len + CRC_LEN
}
