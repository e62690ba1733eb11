use std::sync::{Arc, Mutex};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};

use crate::device::types::{BatteryLevel, ConnectionState, DeviceEvent};

struct StoreInner {
    state: ConnectionState,
    battery: Option<BatteryLevel>,
    subscribers: Vec<UnboundedSender<DeviceEvent>>,
}

impl StoreInner {
    fn publish(&mut self, event: DeviceEvent) {
        // drop subscribers whose receiver is gone
        self.subscribers.retain(|subscriber| subscriber.unbounded_send(event.clone()).is_ok());
    }
}

/// The only piece of device state readable from outside the session.
///
/// Updates are pushed to subscribers synchronously, while the state machine holds the lock, so
/// every subscriber observes them in the order they were made.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        let inner = StoreInner {
            state: ConnectionState::Disconnected,
            battery: None,
            subscribers: Vec::new(),
        };
        StateStore { inner: Arc::new(Mutex::new(inner)) }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lock().expect("Failed to lock StateStore inner").state
    }

    pub fn battery_level(&self) -> Option<BatteryLevel> {
        self.inner.lock().expect("Failed to lock StateStore inner").battery
    }

    /// The receiver first yields the current state (and battery level, if known), then every
    /// later change.
    pub fn subscribe(&self) -> UnboundedReceiver<DeviceEvent> {
        let mut inner = self.inner.lock().expect("Failed to lock StateStore inner");
        let (tx, rx) = unbounded();

        let _ = tx.unbounded_send(DeviceEvent::StateChange(inner.state));
        if let Some(battery) = inner.battery {
            let _ = tx.unbounded_send(DeviceEvent::Battery(battery));
        }

        inner.subscribers.push(tx);
        rx
    }

    /// Returns true if the state changed.
    pub(crate) fn set_state(&self, state: ConnectionState) -> bool {
        let mut inner = self.inner.lock().expect("Failed to lock StateStore inner");
        if inner.state == state {
            return false;
        }

        inner.state = state;
        inner.publish(DeviceEvent::StateChange(state));
        true
    }

    pub(crate) fn set_battery(&self, battery: BatteryLevel) {
        let mut inner = self.inner.lock().expect("Failed to lock StateStore inner");
        inner.battery = Some(battery);
        inner.publish(DeviceEvent::Battery(battery));
    }

    pub(crate) fn reset_battery(&self) {
        let mut inner = self.inner.lock().expect("Failed to lock StateStore inner");
        if inner.battery.take().is_some() {
            inner.publish(DeviceEvent::BatteryUnknown);
        }
    }
}
