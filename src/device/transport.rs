use tokio::task::JoinHandle;

use crate::device::types::{CharacteristicRef, ConnectionHandle, DeviceHandle};
use crate::error::DeviceError;

/// The platform BLE primitives driven by the state machine.
///
/// Every method only issues a request and returns; results arrive later as
/// [`TransportEvent`](crate::device::types::TransportEvent)s on the session queue. An `Err`
/// means the request could not be issued at all.
pub trait Transport {
    fn start_scan(&mut self) -> Result<(), DeviceError>;

    fn stop_scan(&mut self) -> Result<(), DeviceError>;

    /// Open a GATT session. The returned handle identifies this attempt in later events.
    fn connect(&mut self, device: &DeviceHandle) -> Result<ConnectionHandle, DeviceError>;

    fn disconnect(&mut self, connection: &ConnectionHandle) -> Result<(), DeviceError>;

    fn discover_services(&mut self, connection: &ConnectionHandle) -> Result<(), DeviceError>;

    fn enable_notifications(&mut self, connection: &ConnectionHandle, characteristic: &CharacteristicRef) -> Result<(), DeviceError>;

    fn read_characteristic(&mut self, connection: &ConnectionHandle, characteristic: &CharacteristicRef) -> Result<(), DeviceError>;

    fn write_characteristic(&mut self, connection: &ConnectionHandle, characteristic: &CharacteristicRef, data: &[u8]) -> Result<(), DeviceError>;

    /// Drop every resource held on behalf of the state machine. Called once, on shutdown.
    ///
    /// Returns the task finishing the teardown, if any of it happens in the background.
    fn release(&mut self) -> Option<JoinHandle<()>>;
}
