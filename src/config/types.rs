use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::constants::{
    make_massager_notify_uuid, make_massager_service_uuid, make_massager_write_uuid, CONNECT_DELAY,
    TARGET_NAME_FILTER,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceConfig {
    pub name_filter: String,
    pub service_uuid: Uuid,
    pub write_characteristic_uuid: Uuid,
    pub notify_characteristic_uuid: Uuid,
    pub connect_delay_ms: u64,
    /// Forget the last battery level when the device disconnects.
    pub reset_battery_on_disconnect: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            name_filter: TARGET_NAME_FILTER.to_string(),
            service_uuid: make_massager_service_uuid(),
            write_characteristic_uuid: make_massager_write_uuid(),
            notify_characteristic_uuid: make_massager_notify_uuid(),
            connect_delay_ms: CONNECT_DELAY,
            reset_battery_on_disconnect: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub device: DeviceConfig,
}
