use uuid::Uuid;

/**
 * How long (milliseconds) to wait after a matching advertisement before connecting.
 * Some devices do not accept a connection right after they start advertising.
 */
pub const CONNECT_DELAY: u64 = 3000;

/**
 * How long (milliseconds) a write to a characteristic may take.
 */
pub const WRITE_DEADLINE: u64 = 2000;

/**
 * How long (milliseconds) releasing the bluetooth adapter may take before the remaining links are abandoned.
 */
pub const RELEASE_DEADLINE: u64 = 2000;

/**
 * Advertised names containing this (case-insensitive) are considered the target device.
 */
pub const TARGET_NAME_FILTER: &str = "ao";

/**
 * The UUID of the Bluetooth BLE service exposed by the massager firmware.
 */
pub const MASSAGER_SERVICE: &str = "0000FFE5-0000-1000-8000-00805f9b34fb";

/**
 * The UUID of the Bluetooth BLE remote GATT characteristic to send commands to.
 */
pub const MASSAGER_WRITE_CHARACTERISTIC: &str = "0000FFE9-0000-1000-8000-00805f9b34fb";

/**
 * The UUID of the characteristic that notifies the battery level.
 */
pub const MASSAGER_NOTIFY_CHARACTERISTIC: &str = "0000FFE2-0000-1000-8000-00805f9b34fb";

pub const COMMAND_ONE: u16 = 0x0001;
pub const COMMAND_TWO: u16 = 0x0002;

pub const fn make_massager_service_uuid() -> Uuid {
    Uuid::from_u128(0x0000FFE5_0000_1000_8000_00805f9b34fb)
}

pub const fn make_massager_write_uuid() -> Uuid {
    Uuid::from_u128(0x0000FFE9_0000_1000_8000_00805f9b34fb)
}

pub const fn make_massager_notify_uuid() -> Uuid {
    Uuid::from_u128(0x0000FFE2_0000_1000_8000_00805f9b34fb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuids_match_their_string_form() {
        assert_eq!(make_massager_service_uuid(), Uuid::parse_str(MASSAGER_SERVICE).unwrap());
        assert_eq!(make_massager_write_uuid(), Uuid::parse_str(MASSAGER_WRITE_CHARACTERISTIC).unwrap());
        assert_eq!(make_massager_notify_uuid(), Uuid::parse_str(MASSAGER_NOTIFY_CHARACTERISTIC).unwrap());
    }
}
