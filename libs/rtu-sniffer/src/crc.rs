//! Modbus RTU CRC-16
//!
//! Validation never fails: a bad checksum is reported in [`CrcCheck`] and
//! the frame keeps flowing.

use crate::constants::{CRC16_INIT, CRC16_POLY, CRC_LEN};

/// Calculate CRC16 checksum (Modbus RTU standard)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = CRC16_INIT;

    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc >>= 1;
                crc ^= CRC16_POLY;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}

/// Append the CRC of `frame` to it, low byte first
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Outcome of a CRC check on one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrcCheck {
    /// CRC computed over everything but the trailer
    pub computed: u16,
    /// Trailer as transmitted (low byte first on the wire)
    pub received: u16,
    pub valid: bool,
}

/// Check the trailing CRC of a complete RTU frame
///
/// Frames too short to hold a trailer come back invalid.
pub fn check(frame: &[u8]) -> CrcCheck {
    if frame.len() < CRC_LEN {
        return CrcCheck {
            computed: crc16(frame),
            received: 0,
            valid: false,
        };
    }

    let body_len = frame.len() - CRC_LEN;
    let computed = crc16(&frame[..body_len]);
    let received = u16::from_le_bytes([frame[body_len], frame[body_len + 1]]);

    CrcCheck {
        computed,
        received,
        valid: computed == received,
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_crc16_calculation() {
        let data = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        // Transmitted as 84 0A
        assert_eq!(crc16(&data), 0x0A84);
    }

    #[test]
    fn test_crc16_empty_data() {
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_primer_read_request() {
        let frame = [0x01, 0x03, 0x00, 0x6B, 0x00, 0x03, 0x76, 0x87];
        let result = check(&frame);
        assert!(result.valid);
        assert_eq!(result.computed, 0x8776);
        assert_eq!(result.received, 0x8776);
    }

    #[test]
    fn test_corrupted_trailer_reports_both_values() {
        let frame = [0x01, 0x03, 0x00, 0x6B, 0x00, 0x03, 0x76, 0x88];
        let result = check(&frame);
        assert!(!result.valid);
        assert_eq!(result.computed, 0x8776);
        assert_eq!(result.received, 0x8876);
    }

    // ========================================================================
    // Round trip and corruption
    // ========================================================================

    #[test]
    fn test_append_then_check_is_valid() {
        let samples: [&[u8]; 4] = [
            &[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03],
            &[0x01, 0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02],
            &[0xF7, 0x05, 0x00, 0xAC, 0xFF, 0x00],
            &[0x00, 0x83],
        ];
        for sample in samples {
            let mut frame = sample.to_vec();
            append_crc(&mut frame);
            assert_eq!(frame.len(), sample.len() + CRC_LEN);
            assert!(check(&frame).valid, "frame {frame:02X?}");
        }
    }

    #[test]
    fn test_every_single_bit_flip_is_detected() {
        let mut frame = vec![0x01, 0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02];
        append_crc(&mut frame);
        let body_len = frame.len() - CRC_LEN;

        for index in 0..body_len {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[index] ^= 1 << bit;
                assert!(
                    !check(&corrupted).valid,
                    "flip of bit {bit} in byte {index} went unnoticed"
                );
            }
        }
    }

    #[test]
    fn test_too_short_frames_are_invalid() {
        assert!(!check(&[]).valid);
        assert!(!check(&[0x01]).valid);
    }
}
