use crate::device::types::BatteryLevel;

/// Encode a command code as the 2 byte big-endian payload the firmware expects.
pub fn encode_command(code: u16) -> [u8; 2] {
    [((code >> 8) & 0xFF) as u8, (code & 0xFF) as u8]
}

/// Decode the battery level from the first byte of a notification. Returns `None` for an empty payload.
pub fn decode_battery(payload: &[u8]) -> Option<BatteryLevel> {
    payload.first().map(|byte| BatteryLevel(*byte))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_big_endian() {
        assert_eq!(encode_command(0x0001), [0x00, 0x01]);
        assert_eq!(encode_command(0x0002), [0x00, 0x02]);
        assert_eq!(encode_command(0xABCD), [0xAB, 0xCD]);
    }

    #[test]
    fn encodes_every_code() {
        for code in 0..=u16::MAX {
            let bytes = encode_command(code);
            assert_eq!(bytes, [(code >> 8) as u8, (code & 0xFF) as u8]);
            assert_eq!(u16::from_be_bytes(bytes), code);
        }
    }

    #[test]
    fn decodes_battery_from_first_byte() {
        assert_eq!(decode_battery(&[0x4B]), Some(BatteryLevel(75)));
        assert_eq!(decode_battery(&[0x64, 0x01, 0x02]), Some(BatteryLevel(100)));
        assert_eq!(decode_battery(&[0xFF]), Some(BatteryLevel(255)));
    }

    #[test]
    fn empty_payload_has_no_battery() {
        assert_eq!(decode_battery(&[]), None);
    }
}
