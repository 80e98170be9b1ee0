//! Heart Rate Measurement characteristic codec
//!
//! Decodes the standard GATT Heart Rate Measurement payload (0x2A37) into
//! a BPM value. Malformed input degrades to a 0 reading; downstream treats
//! 0 as "no valid sample", never as a stream error.

use uuid::Uuid;

/// GATT Heart Rate service (0x180D).
pub const HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);

/// GATT Heart Rate Measurement characteristic (0x2A37).
pub const HEART_RATE_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

/// Decode a Heart Rate Measurement payload into a BPM value.
///
/// Byte 0 carries the flags; bit 0 selects the value width. Bit 0 set means
/// a 16-bit little-endian value at bytes 1-2, clear means an 8-bit value at
/// byte 1. Truncated or empty payloads decode to 0.
pub fn decode_heart_rate(data: &[u8]) -> u16 {
    let Some(&flags) = data.first() else {
        return 0;
    };

    if flags & 0x01 != 0 {
        if data.len() >= 3 {
            u16::from_le_bytes([data[1], data[2]])
        } else {
            0
        }
    } else {
        if data.len() >= 2 {
            data[1] as u16
        } else {
            0
        }
    }
}

/// Encode a BPM value as a Heart Rate Measurement payload.
///
/// Values up to 255 use the 8-bit format, larger ones the 16-bit format.
/// Used by the simulated transport; real straps produce their own frames.
pub fn encode_heart_rate(bpm: u16) -> Vec<u8> {
    if bpm <= u8::MAX as u16 {
        vec![0x00, bpm as u8]
    } else {
        let bytes = bpm.to_le_bytes();
        vec![0x01, bytes[0], bytes[1]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_payload() {
        assert_eq!(decode_heart_rate(&[]), 0);
    }

    #[test]
    fn test_8bit_value() {
        assert_eq!(decode_heart_rate(&[0x00, 72]), 72);
        assert_eq!(decode_heart_rate(&[0x00, 255]), 255);
    }

    #[test]
    fn test_16bit_value() {
        assert_eq!(decode_heart_rate(&[0x01, 0x48, 0x00]), 72);
        assert_eq!(decode_heart_rate(&[0x01, 0x2C, 0x01]), 300);
    }

    #[test]
    fn test_truncated_16bit() {
        assert_eq!(decode_heart_rate(&[0x01, 0x48]), 0);
        assert_eq!(decode_heart_rate(&[0x01]), 0);
    }

    #[test]
    fn test_truncated_8bit() {
        assert_eq!(decode_heart_rate(&[0x00]), 0);
    }

    #[test]
    fn test_other_flag_bits_ignored() {
        // Sensor-contact and energy-expended flags don't affect the value width.
        assert_eq!(decode_heart_rate(&[0x16, 68]), 68);
        assert_eq!(decode_heart_rate(&[0x17, 0x44, 0x00]), 68);
    }

    #[test]
    fn test_encode_round_trip() {
        assert_eq!(decode_heart_rate(&encode_heart_rate(72)), 72);
        assert_eq!(decode_heart_rate(&encode_heart_rate(300)), 300);
        assert_eq!(decode_heart_rate(&encode_heart_rate(0)), 0);
    }
}
