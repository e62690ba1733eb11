use std::fmt;
use btleplug::api::CharPropFlags;
use uuid::Uuid;

/// Connection state as seen by consumers of the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Scanning, waiting for the settle delay, or GATT connected but not yet ready.
    Connecting,
    /// Write and notify characteristics are resolved.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
        };

        write!(f, "{}", result)
    }
}

/// Battery percentage as reported by the device (domain values 0-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryLevel(pub u8);

impl fmt::Display for BatteryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// A peripheral seen in an advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    /// Transport specific key used to find the peripheral again.
    pub id: u64,
    pub name: Option<String>,
    pub address: String,
}

/// A GATT session opened by the transport. Every connect attempt gets a fresh `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub id: u64,
    pub device: DeviceHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicRef {
    pub uuid: Uuid,
    pub properties: CharPropFlags,
}

impl CharacteristicRef {
    pub fn is_writable(&self) -> bool {
        self.properties.contains(CharPropFlags::WRITE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicRefs {
    pub write: CharacteristicRef,
    pub notify: CharacteristicRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicRef>,
}

/// Callbacks from the transport, delivered to the state machine through the session queue.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Advertisement(DeviceHandle),
    ScanFailed(String),
    GattStateChanged {
        connection: ConnectionHandle,
        connected: bool,
    },
    ServicesDiscovered {
        connection: ConnectionHandle,
        services: Vec<ServiceDescriptor>,
    },
    /// A notification or the result of a read.
    CharacteristicValue {
        connection: ConnectionHandle,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    WriteCompleted {
        characteristic: Uuid,
        result: Result<(), String>,
    },
}

/// Published by the state store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    StateChange(ConnectionState),
    Battery(BatteryLevel),
    /// The last battery level was forgotten.
    BatteryUnknown,
}
