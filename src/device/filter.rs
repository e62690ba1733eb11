use crate::device::types::DeviceHandle;

/// Selects the advertisement of the device to connect to.
#[derive(Debug, Clone)]
pub struct DeviceFilter {
    needle: String,
}

impl DeviceFilter {
    pub fn new(needle: &str) -> Self {
        DeviceFilter { needle: needle.to_lowercase() }
    }

    pub fn matches_name(&self, name: Option<&str>) -> bool {
        match name {
            Some(name) if !name.is_empty() => name.to_lowercase().contains(&self.needle),
            _ => false,
        }
    }

    pub fn matches(&self, device: &DeviceHandle) -> bool {
        self.matches_name(device.name.as_deref())
    }
}
