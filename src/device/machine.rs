use std::mem;
use std::time::Duration;
use futures::channel::mpsc::Sender;
use futures::SinkExt;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

use crate::config::types::DeviceConfig;
use crate::device::codec::{decode_battery, encode_command};
use crate::device::filter::DeviceFilter;
use crate::device::store::StateStore;
use crate::device::transport::Transport;
use crate::device::types::{
    CharacteristicRefs, ConnectionHandle, ConnectionState, DeviceHandle, ServiceDescriptor, TransportEvent,
};
use crate::error::{CommandError, DeviceError};

/// Identifies one scheduled connect. Expiries of anything but the current attempt are discarded.
pub type ConnectAttempt = u64;

/// A connect attempt waiting for the settle delay. Dropping it cancels the timer.
struct DeferredConnect {
    attempt: ConnectAttempt,
    _guard: DropGuard,
}

impl DeferredConnect {
    fn schedule(parent: &CancellationToken, attempt: ConnectAttempt, delay: Duration, mut sender: Sender<ConnectAttempt>) -> Self {
        let cancel = parent.child_token();
        let task_cancel = cancel.clone();

        spawn(async move {
            tokio::select! {
                _ = task_cancel.cancelled() => {
                    debug!("Connect attempt {} cancelled", attempt);
                },
                _ = sleep(delay) => {
                    if sender.send(attempt).await.is_err() {
                        debug!("Session is gone; Dropping connect attempt {}", attempt);
                    }
                },
            }
        });

        DeferredConnect { attempt, _guard: cancel.drop_guard() }
    }
}

enum Phase {
    Idle,
    Scanning,
    Settling {
        device: DeviceHandle,
        pending: DeferredConnect,
    },
    Opening {
        connection: ConnectionHandle,
    },
    Discovering {
        connection: ConnectionHandle,
    },
    Ready {
        connection: ConnectionHandle,
        characteristics: CharacteristicRefs,
    },
}

impl Phase {
    fn connection_state(&self) -> ConnectionState {
        match self {
            Phase::Idle => ConnectionState::Disconnected,
            Phase::Scanning | Phase::Settling { .. } | Phase::Opening { .. } | Phase::Discovering { .. } => {
                ConnectionState::Connecting
            },
            Phase::Ready { .. } => ConnectionState::Connected,
        }
    }

    fn connection(&self) -> Option<&ConnectionHandle> {
        match self {
            Phase::Opening { connection } | Phase::Discovering { connection } | Phase::Ready { connection, .. } => {
                Some(connection)
            },
            _ => None,
        }
    }
}

/// Find the massager service and both of its characteristics.
pub fn resolve_characteristics(config: &DeviceConfig, services: &[ServiceDescriptor]) -> Result<CharacteristicRefs, DeviceError> {
    let service = services
        .iter()
        .find(|service| service.uuid == config.service_uuid)
        .ok_or(DeviceError::MissingService { uuid: config.service_uuid })?;

    let find = |uuid: Uuid| {
        service.characteristics
            .iter()
            .find(|characteristic| characteristic.uuid == uuid)
            .cloned()
            .ok_or(DeviceError::MissingCharacteristic { uuid })
    };

    Ok(CharacteristicRefs {
        write: find(config.write_characteristic_uuid)?,
        notify: find(config.notify_characteristic_uuid)?,
    })
}

/// Owns the connection to the massager: scan, settle, connect, discover, subscribe, ready.
///
/// Not synchronized; every call must come from the single session task (see
/// [`spawn_session`](crate::device::session::spawn_session)).
pub struct ConnectionMachine<T: Transport> {
    config: DeviceConfig,
    filter: DeviceFilter,
    transport: T,
    store: StateStore,
    timer: Sender<ConnectAttempt>,
    cancel: CancellationToken,
    phase: Phase,
    last_attempt: ConnectAttempt,
    released: bool,
    teardown: Option<JoinHandle<()>>,
}

impl<T: Transport> ConnectionMachine<T> {
    pub fn new(config: DeviceConfig, transport: T, store: StateStore, timer: Sender<ConnectAttempt>, cancel: CancellationToken) -> Self {
        let filter = DeviceFilter::new(&config.name_filter);

        ConnectionMachine {
            config,
            filter,
            transport,
            store,
            timer,
            cancel,
            phase: Phase::Idle,
            last_attempt: 0,
            released: false,
            teardown: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.phase.connection_state()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.phase.connection()
    }

    pub fn characteristics(&self) -> Option<&CharacteristicRefs> {
        match &self.phase {
            Phase::Ready { characteristics, .. } => Some(characteristics),
            _ => None,
        }
    }

    pub fn pending_attempt(&self) -> Option<ConnectAttempt> {
        match &self.phase {
            Phase::Settling { pending, .. } => Some(pending.attempt),
            _ => None,
        }
    }

    fn transition(&mut self, phase: Phase) {
        self.phase = phase;

        let state = self.phase.connection_state();
        if self.store.set_state(state) {
            info!("Connection state: {}", state);
        }
    }

    fn drop_to_disconnected(&mut self) {
        self.transition(Phase::Idle);

        if self.config.reset_battery_on_disconnect {
            self.store.reset_battery();
        }
    }

    /// Close a GATT session that will not become ready.
    fn abandon(&mut self, connection: ConnectionHandle) {
        if let Err(err) = self.transport.disconnect(&connection) {
            warn!("Failed to disconnect from peripheral: {:?}", err);
        }
        self.drop_to_disconnected();
    }

    pub fn start_scan(&mut self) {
        if self.released {
            warn!("Device session has been shut down; Ignoring scan request");
            return;
        }

        if !matches!(self.phase, Phase::Idle) {
            debug!("Already {}; Ignoring scan request", self.state());
            return;
        }

        info!("Scanning for peripherals matching {:?}...", self.config.name_filter);
        match self.transport.start_scan() {
            Ok(()) => self.transition(Phase::Scanning),
            Err(err) => {
                warn!("Scanning failed {:?}", err);
                self.drop_to_disconnected();
            },
        }
    }

    /// Only cancels the scan phase; an open GATT session is left alone.
    pub fn stop_scan(&mut self) {
        match &self.phase {
            Phase::Scanning => {
                info!("Stopping scan");
                if let Err(err) = self.transport.stop_scan() {
                    warn!("Failed to stop scanning: {:?}", err);
                }
                self.drop_to_disconnected();
            },
            Phase::Settling { .. } => {
                info!("Cancelling pending connect");
                self.drop_to_disconnected();
            },
            Phase::Idle => debug!("Not scanning"),
            _ => debug!("GATT session already open; Not stopping anything"),
        }
    }

    pub fn on_advertisement(&mut self, device: DeviceHandle) {
        if !matches!(self.phase, Phase::Scanning) {
            debug!("Not scanning; Ignoring advertisement from {}", device.address);
            return;
        }

        if !self.filter.matches(&device) {
            return;
        }

        info!(
            "Using peripheral {} {}",
            device.address,
            device.name.as_deref().unwrap_or("NONE"),
        );

        if let Err(err) = self.transport.stop_scan() {
            warn!("Failed to stop scanning: {:?}", err);
        }

        self.last_attempt += 1;
        let pending = DeferredConnect::schedule(
            &self.cancel,
            self.last_attempt,
            Duration::from_millis(self.config.connect_delay_ms),
            self.timer.clone(),
        );
        self.transition(Phase::Settling { device, pending });
    }

    /// The settle delay of `attempt` has elapsed.
    pub fn on_connect_due(&mut self, attempt: ConnectAttempt) {
        let device = match &self.phase {
            Phase::Settling { device, pending } if pending.attempt == attempt => device.clone(),
            _ => {
                debug!("Discarding stale connect attempt {}", attempt);
                return;
            },
        };

        info!("Connecting to peripheral {}...", device.address);
        match self.transport.connect(&device) {
            Ok(connection) => self.transition(Phase::Opening { connection }),
            Err(err) => self.on_connect_attempt_failed(err),
        }
    }

    /// The only automatic retry: go back to scanning without leaving `Connecting`.
    pub fn on_connect_attempt_failed(&mut self, err: DeviceError) {
        warn!("Connecting to peripheral failed: {:?}", err);

        // not published, the scan below keeps the state at Connecting
        self.phase = Phase::Idle;
        self.start_scan();
    }

    pub fn on_gatt_state_changed(&mut self, connection: ConnectionHandle, connected: bool) {
        if self.phase.connection() != Some(&connection) {
            debug!("Ignoring GATT state change of stale connection {}", connection.id);
            return;
        }

        if !connected {
            warn!("Connection lost");
            self.drop_to_disconnected();
            return;
        }

        match mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Opening { connection } => {
                info!("Connected; Discovering services...");
                match self.transport.discover_services(&connection) {
                    Ok(()) => self.transition(Phase::Discovering { connection }),
                    Err(err) => {
                        warn!("Failed to discover services: {:?}", err);
                        self.abandon(connection);
                    },
                }
            },
            phase => {
                debug!("Already connected");
                self.phase = phase;
            },
        }
    }

    pub fn on_services_discovered(&mut self, connection: ConnectionHandle, services: Vec<ServiceDescriptor>) {
        let connection = match mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Discovering { connection: current } if current == connection => current,
            phase => {
                debug!("Ignoring services of connection {}", connection.id);
                self.phase = phase;
                return;
            },
        };

        let characteristics = match resolve_characteristics(&self.config, &services) {
            Ok(characteristics) => characteristics,
            Err(err) => {
                warn!("Peripheral is not compatible: {}", err);
                self.abandon(connection);
                return;
            },
        };

        info!("Subscribing to characteristic {}", characteristics.notify.uuid);
        if let Err(err) = self.transport.enable_notifications(&connection, &characteristics.notify) {
            warn!("Failed to subscribe to notifications: {:?}", err);
            self.abandon(connection);
            return;
        }

        if let Err(err) = self.transport.read_characteristic(&connection, &characteristics.notify) {
            warn!("Failed to request initial battery level: {:?}", err);
        }

        info!("Peripheral ready");
        self.transition(Phase::Ready { connection, characteristics });
    }

    /// Returns once the write is issued; completion is only logged.
    pub fn send_command(&mut self, code: u16) -> Result<(), CommandError> {
        let (connection, characteristics) = match &self.phase {
            Phase::Ready { connection, characteristics } => (connection, characteristics),
            _ => return Err(CommandError::NotConnected),
        };

        if !characteristics.write.is_writable() {
            warn!("Characteristic {} does not support writes", characteristics.write.uuid);
            return Err(CommandError::CharacteristicNotWritable);
        }

        debug!("Sending command {:#06x}", code);
        self.transport
            .write_characteristic(connection, &characteristics.write, &encode_command(code))
            .map_err(|source| CommandError::WriteFailed { source })
    }

    pub fn on_notification(&mut self, connection: ConnectionHandle, characteristic: Uuid, payload: &[u8]) {
        let notify_uuid = match &self.phase {
            Phase::Ready { connection: current, characteristics } if *current == connection => characteristics.notify.uuid,
            _ => {
                debug!("Ignoring value of {} outside of a ready connection", characteristic);
                return;
            },
        };

        if characteristic != notify_uuid {
            debug!("Ignoring value of characteristic {}", characteristic);
            return;
        }

        match decode_battery(payload) {
            Some(battery) => {
                debug!("Battery level {}", battery);
                self.store.set_battery(battery);
            },
            None => debug!("Ignoring empty notification"),
        }
    }

    pub fn on_scan_failed(&mut self, reason: &str) {
        if matches!(self.phase, Phase::Scanning) {
            warn!("Scanning failed {}", reason);
            self.drop_to_disconnected();
        }
    }

    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Advertisement(device) => self.on_advertisement(device),
            TransportEvent::ScanFailed(reason) => self.on_scan_failed(&reason),
            TransportEvent::GattStateChanged { connection, connected } => {
                self.on_gatt_state_changed(connection, connected)
            },
            TransportEvent::ServicesDiscovered { connection, services } => {
                self.on_services_discovered(connection, services)
            },
            TransportEvent::CharacteristicValue { connection, characteristic, value } => {
                self.on_notification(connection, characteristic, &value)
            },
            TransportEvent::WriteCompleted { characteristic, result } => match result {
                Ok(()) => info!("Command written to {}", characteristic),
                Err(err) => warn!("Failed to send to characteristic {}: {}", characteristic, err),
            },
        }
    }

    /// Stop scanning, close the GATT session and release the transport. Safe to call in any state.
    pub fn shutdown(&mut self) {
        if self.released {
            return;
        }

        info!("Shutting down device session");
        match mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Scanning => {
                if let Err(err) = self.transport.stop_scan() {
                    warn!("Failed to stop scanning: {:?}", err);
                }
            },
            Phase::Opening { connection } | Phase::Discovering { connection } | Phase::Ready { connection, .. } => {
                if let Err(err) = self.transport.disconnect(&connection) {
                    warn!("Failed to disconnect from peripheral: {:?}", err);
                }
            },
            Phase::Settling { .. } | Phase::Idle => {},
        }

        self.teardown = self.transport.release();
        self.released = true;
        self.drop_to_disconnected();
    }

    /// The background part of [`shutdown`](Self::shutdown), handed out once.
    pub fn take_teardown(&mut self) -> Option<JoinHandle<()>> {
        self.teardown.take()
    }
}

impl<T: Transport> Drop for ConnectionMachine<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
