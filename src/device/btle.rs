use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::channel::mpsc::Sender;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::constants::{RELEASE_DEADLINE, WRITE_DEADLINE};
use crate::device::transport::Transport;
use crate::device::types::{
    CharacteristicRef, ConnectionHandle, DeviceHandle, ServiceDescriptor, TransportEvent,
};
use crate::error::{readable_join_error, DeviceError};

struct LiveConnection<K, P> {
    handle: ConnectionHandle,
    key: K,
    peripheral: P,
    cancel: CancellationToken,
}

/// How a pending `connect()` ended, judged against the registry.
#[derive(Debug, PartialEq, Eq)]
enum ConnectOutcome {
    Connected,
    Failed,
    /// The link came up after the connection was closed; nobody owns it.
    Orphaned,
}

/// Bookkeeping of discovered peripherals and open links, keyed by the platform peripheral id `K`.
struct Registry<K, P> {
    scanning: bool,
    next_device_id: u64,
    device_ids: HashMap<K, u64>,
    peripherals: HashMap<u64, P>,
    connections: HashMap<u64, LiveConnection<K, P>>,
}

impl<K, P> Default for Registry<K, P> {
    fn default() -> Self {
        Registry {
            scanning: false,
            next_device_id: 0,
            device_ids: HashMap::new(),
            peripherals: HashMap::new(),
            connections: HashMap::new(),
        }
    }
}

impl<K: Clone + Eq + Hash, P: Clone> Registry<K, P> {
    fn register(&mut self, key: K, peripheral: P) -> u64 {
        let id = match self.device_ids.get(&key) {
            Some(id) => *id,
            None => {
                self.next_device_id += 1;
                self.device_ids.insert(key, self.next_device_id);
                self.next_device_id
            },
        };

        self.peripherals.insert(id, peripheral);
        id
    }

    /// Forget the advertisers of earlier scans. Peripherals with an open link stay known.
    fn forget_discovered(&mut self) {
        let connected: Vec<K> = self.connections.values().map(|live| live.key.clone()).collect();
        self.device_ids.retain(|key, _| connected.contains(key));

        let kept: Vec<u64> = self.device_ids.values().copied().collect();
        self.peripherals.retain(|id, _| kept.contains(id));
    }

    fn open(&mut self, handle: ConnectionHandle, key: K, peripheral: P, cancel: CancellationToken) {
        self.connections.insert(handle.id, LiveConnection { handle, key, peripheral, cancel });
    }

    fn close(&mut self, id: u64) -> Option<LiveConnection<K, P>> {
        let live = self.connections.remove(&id)?;
        live.cancel.cancel();
        Some(live)
    }

    fn finish_connect(&mut self, id: u64, succeeded: bool) -> ConnectOutcome {
        if !succeeded {
            self.close(id);
            return ConnectOutcome::Failed;
        }

        if self.connections.contains_key(&id) {
            ConnectOutcome::Connected
        } else {
            ConnectOutcome::Orphaned
        }
    }

    /// Forget every connection to `key`, returning their handles.
    fn remove_connections_of(&mut self, key: &K) -> Vec<ConnectionHandle> {
        let ids: Vec<u64> = self.connections
            .iter()
            .filter(|(_, live)| live.key == *key)
            .map(|(id, _)| *id)
            .collect();

        ids.into_iter()
            .filter_map(|id| self.close(id))
            .map(|live| live.handle)
            .collect()
    }

    /// Clear everything, returning the links that are still open.
    fn drain(&mut self) -> Vec<LiveConnection<K, P>> {
        self.scanning = false;
        self.peripherals.clear();
        self.device_ids.clear();
        self.connections.drain().map(|(_, live)| live).collect()
    }
}

type SharedRegistry = Arc<Mutex<Registry<PeripheralId, Peripheral>>>;

fn lock(registry: &SharedRegistry) -> std::sync::MutexGuard<'_, Registry<PeripheralId, Peripheral>> {
    registry.lock().expect("Failed to lock BtleTransport registry")
}

/// [`Transport`] on top of the platform bluetooth stack.
pub struct BtleTransport {
    _manager: Manager,
    adapter: Adapter,
    events: Sender<TransportEvent>,
    cancel: CancellationToken,
    registry: SharedRegistry,
    next_connection_id: u64,
    link_tasks: Vec<JoinHandle<()>>,
}

impl BtleTransport {
    /// Open the first bluetooth adapter. Results of requests are sent to `events`.
    pub async fn new(events: Sender<TransportEvent>, cancel: CancellationToken) -> Result<Self, DeviceError> {
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?
            .into_iter()
            .next()
            .ok_or(DeviceError::NoAdapter)?;

        info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));

        let central_events = adapter.events().await?;
        let registry = SharedRegistry::default();

        spawn(central_events_task(
            central_events,
            adapter.clone(),
            registry.clone(),
            events.clone(),
            cancel.clone(),
        ));

        Ok(BtleTransport {
            _manager: manager,
            adapter,
            events,
            cancel,
            registry,
            next_connection_id: 0,
            link_tasks: vec![],
        })
    }

    fn live(&self, connection: &ConnectionHandle) -> Result<(Peripheral, CancellationToken), DeviceError> {
        lock(&self.registry)
            .connections
            .get(&connection.id)
            .map(|live| (live.peripheral.clone(), live.cancel.clone()))
            .ok_or(DeviceError::UnknownConnection)
    }

    /// Keep `task` around so that [`Transport::release`] can wait for the link to settle.
    fn track_link_task(&mut self, task: JoinHandle<()>) {
        self.link_tasks.retain(|task| !task.is_finished());
        self.link_tasks.push(task);
    }
}

async fn describe_peripheral(adapter: &Adapter, registry: &SharedRegistry, id: &PeripheralId) -> Result<Option<DeviceHandle>, DeviceError> {
    let peripheral = adapter.peripheral(id).await?;

    let properties = match peripheral.properties().await? {
        Some(properties) => properties,
        None => {
            debug!("Peripheral has no properties");
            return Ok(None);
        },
    };

    let device_id = lock(registry).register(peripheral.id(), peripheral);

    Ok(Some(DeviceHandle {
        id: device_id,
        name: properties.local_name,
        address: properties.address.to_string(),
    }))
}

async fn central_events_task(
    mut central_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    adapter: Adapter,
    registry: SharedRegistry,
    mut events: Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    'mainloop: loop {
        let central_event = tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            central_event = central_events.next() => match central_event {
                Some(central_event) => central_event,
                None => break 'mainloop,
            },
        };

        let event = match central_event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if !lock(&registry).scanning {
                    continue;
                }

                match describe_peripheral(&adapter, &registry, &id).await {
                    Ok(Some(device)) => TransportEvent::Advertisement(device),
                    Ok(None) => continue,
                    Err(err) => {
                        warn!("Could not query peripheral for properties: {:?}", err);
                        continue;
                    },
                }
            },
            CentralEvent::DeviceDisconnected(id) => {
                let lost = lock(&registry).remove_connections_of(&id);
                for connection in lost {
                    let event = TransportEvent::GattStateChanged { connection, connected: false };
                    if events.send(event).await.is_err() {
                        break 'mainloop;
                    }
                }
                continue;
            },
            _ => continue,
        };

        if events.send(event).await.is_err() {
            break 'mainloop;
        }
    }

    debug!("Central events task stopped");
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic, DeviceError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|characteristic| characteristic.uuid == uuid)
        .ok_or(DeviceError::MissingCharacteristic { uuid })
}

fn describe_services(peripheral: &Peripheral) -> Vec<ServiceDescriptor> {
    peripheral
        .services()
        .into_iter()
        .map(|service| ServiceDescriptor {
            uuid: service.uuid,
            characteristics: service.characteristics
                .into_iter()
                .map(|characteristic| CharacteristicRef {
                    uuid: characteristic.uuid,
                    properties: characteristic.properties,
                })
                .collect(),
        })
        .collect()
}

impl Transport for BtleTransport {
    fn start_scan(&mut self) -> Result<(), DeviceError> {
        {
            let mut registry = lock(&self.registry);
            registry.forget_discovered();
            registry.scanning = true;
        }

        let adapter = self.adapter.clone();
        let registry = self.registry.clone();
        let mut events = self.events.clone();

        spawn(async move {
            if let Err(err) = adapter.start_scan(ScanFilter::default()).await {
                if let btleplug::Error::PermissionDenied = err {
                    warn!("Bluetooth permission denied");
                }
                lock(&registry).scanning = false;
                let _ = events.send(TransportEvent::ScanFailed(err.to_string())).await;
            }
        });

        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), DeviceError> {
        lock(&self.registry).scanning = false;

        let adapter = self.adapter.clone();
        spawn(async move {
            if let Err(err) = adapter.stop_scan().await {
                warn!("Failed to stop scanning: {:?}", err);
            }
        });

        Ok(())
    }

    fn connect(&mut self, device: &DeviceHandle) -> Result<ConnectionHandle, DeviceError> {
        let peripheral = lock(&self.registry)
            .peripherals
            .get(&device.id)
            .cloned()
            .ok_or(DeviceError::UnknownDevice)?;

        self.next_connection_id += 1;
        let connection = ConnectionHandle { id: self.next_connection_id, device: device.clone() };

        lock(&self.registry).open(connection.clone(), peripheral.id(), peripheral.clone(), self.cancel.child_token());

        let registry = self.registry.clone();
        let mut events = self.events.clone();
        let event_connection = connection.clone();

        let task = spawn(async move {
            let result = peripheral.connect().await;
            if let Err(err) = &result {
                warn!("Connecting to peripheral failed: {:?}", err);
            }

            let outcome = lock(&registry).finish_connect(event_connection.id, result.is_ok());
            let connected = match outcome {
                ConnectOutcome::Connected => true,
                ConnectOutcome::Failed => false,
                ConnectOutcome::Orphaned => {
                    info!("Connection {} was closed while connecting, disconnecting", event_connection.id);
                    if let Err(err) = peripheral.disconnect().await {
                        warn!("Failed to disconnect from peripheral: {:?}", err);
                    }
                    return;
                },
            };

            let _ = events.send(TransportEvent::GattStateChanged { connection: event_connection, connected }).await;
        });
        self.track_link_task(task);

        Ok(connection)
    }

    fn disconnect(&mut self, connection: &ConnectionHandle) -> Result<(), DeviceError> {
        let live = lock(&self.registry)
            .close(connection.id)
            .ok_or(DeviceError::UnknownConnection)?;

        let task = spawn(async move {
            if let Err(err) = live.peripheral.disconnect().await {
                warn!("Failed to disconnect from peripheral: {:?}", err);
            }
        });
        self.track_link_task(task);

        Ok(())
    }

    fn discover_services(&mut self, connection: &ConnectionHandle) -> Result<(), DeviceError> {
        let (peripheral, _) = self.live(connection)?;
        let mut events = self.events.clone();
        let connection = connection.clone();

        spawn(async move {
            let services = match peripheral.discover_services().await {
                Ok(()) => describe_services(&peripheral),
                Err(err) => {
                    warn!("Discovering services failed: {:?}", err);
                    vec![]
                },
            };

            let _ = events.send(TransportEvent::ServicesDiscovered { connection, services }).await;
        });

        Ok(())
    }

    fn enable_notifications(&mut self, connection: &ConnectionHandle, characteristic: &CharacteristicRef) -> Result<(), DeviceError> {
        let (peripheral, cancel) = self.live(connection)?;
        let characteristic = find_characteristic(&peripheral, characteristic.uuid)?;
        let mut events = self.events.clone();
        let connection = connection.clone();

        spawn(async move {
            if let Err(err) = peripheral.subscribe(&characteristic).await {
                warn!("Failed to subscribe to characteristic {}: {:?}", characteristic.uuid, err);
                return;
            }

            let mut notification_stream = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("Failed to open notification stream: {:?}", err);
                    return;
                },
            };

            'mainloop: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break 'mainloop;
                    },
                    data = notification_stream.next() => {
                        let Some(data) = data else {
                            break 'mainloop;
                        };

                        let event = TransportEvent::CharacteristicValue {
                            connection: connection.clone(),
                            characteristic: data.uuid,
                            value: data.value,
                        };
                        if events.send(event).await.is_err() {
                            break 'mainloop;
                        }
                    },
                }
            }

            debug!("Notification task of connection {} stopped", connection.id);
        });

        Ok(())
    }

    fn read_characteristic(&mut self, connection: &ConnectionHandle, characteristic: &CharacteristicRef) -> Result<(), DeviceError> {
        let (peripheral, _) = self.live(connection)?;
        let characteristic = find_characteristic(&peripheral, characteristic.uuid)?;
        let mut events = self.events.clone();
        let connection = connection.clone();

        spawn(async move {
            match peripheral.read(&characteristic).await {
                Ok(value) => {
                    let event = TransportEvent::CharacteristicValue {
                        connection,
                        characteristic: characteristic.uuid,
                        value,
                    };
                    let _ = events.send(event).await;
                },
                Err(err) => warn!("Failed to read characteristic {}: {:?}", characteristic.uuid, err),
            }
        });

        Ok(())
    }

    fn write_characteristic(&mut self, connection: &ConnectionHandle, characteristic: &CharacteristicRef, data: &[u8]) -> Result<(), DeviceError> {
        let (peripheral, _) = self.live(connection)?;
        let characteristic = find_characteristic(&peripheral, characteristic.uuid)?;
        let mut events = self.events.clone();
        let data = data.to_vec();

        spawn(async move {
            let fut = peripheral.write(&characteristic, &data, WriteType::WithResponse);

            let result = tokio::select! {
                _ = sleep(Duration::from_millis(WRITE_DEADLINE)) => {
                    Err("write took too long".to_string())
                }
                result = fut => result.map_err(|err| err.to_string()),
            };

            let _ = events.send(TransportEvent::WriteCompleted { characteristic: characteristic.uuid, result }).await;
        });

        Ok(())
    }

    fn release(&mut self) -> Option<JoinHandle<()>> {
        info!("Releasing bluetooth adapter");
        self.cancel.cancel();

        let (was_scanning, connections) = {
            let mut registry = lock(&self.registry);
            let was_scanning = registry.scanning;
            (was_scanning, registry.drain())
        };

        let adapter = self.adapter.clone();
        let link_tasks = std::mem::take(&mut self.link_tasks);

        Some(spawn(async move {
            let teardown = async {
                if was_scanning {
                    if let Err(err) = adapter.stop_scan().await {
                        warn!("Failed to stop scanning: {:?}", err);
                    }
                }

                for live in connections {
                    if let Err(err) = live.peripheral.disconnect().await {
                        warn!("Failed to disconnect from peripheral: {:?}", err);
                    }
                }

                for task in link_tasks {
                    if let Err(err) = task.await {
                        warn!("Bluetooth link task failed: {}", readable_join_error(err));
                    }
                }
            };

            match timeout(Duration::from_millis(RELEASE_DEADLINE), teardown).await {
                Ok(()) => debug!("Bluetooth adapter released"),
                Err(_) => warn!("Releasing bluetooth adapter took too long, giving up"),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_link() -> (Registry<&'static str, ()>, ConnectionHandle) {
        let mut registry = Registry::default();
        let id = registry.register("massager", ());
        let connection = ConnectionHandle {
            id: 1,
            device: DeviceHandle { id, name: Some("AoMassager".to_string()), address: "C0:FF:EE:00:00:01".to_string() },
        };
        registry.open(connection.clone(), "massager", (), CancellationToken::new());
        (registry, connection)
    }

    #[test]
    fn register_keeps_device_id_per_peripheral() {
        let mut registry: Registry<&str, ()> = Registry::default();

        let first = registry.register("a", ());
        let second = registry.register("b", ());
        assert_ne!(first, second);
        assert_eq!(registry.register("a", ()), first);
        assert_eq!(registry.peripherals.len(), 2);
    }

    #[test]
    fn connect_finishing_after_close_is_orphaned() {
        let (mut registry, connection) = registry_with_link();
        let cancel = registry.connections[&connection.id].cancel.clone();

        let live = registry.close(connection.id).unwrap();
        assert_eq!(live.handle, connection);
        assert!(cancel.is_cancelled());

        assert_eq!(registry.finish_connect(connection.id, true), ConnectOutcome::Orphaned);
    }

    #[test]
    fn connect_outcome_follows_result() {
        let (mut registry, connection) = registry_with_link();
        assert_eq!(registry.finish_connect(connection.id, true), ConnectOutcome::Connected);
        assert!(registry.connections.contains_key(&connection.id));

        let (mut registry, connection) = registry_with_link();
        let cancel = registry.connections[&connection.id].cancel.clone();
        assert_eq!(registry.finish_connect(connection.id, false), ConnectOutcome::Failed);
        assert!(registry.connections.is_empty());
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn new_scan_forgets_unconnected_advertisers() {
        let (mut registry, connection) = registry_with_link();
        let stale = registry.register("headphones", ());

        registry.forget_discovered();

        assert!(registry.peripherals.contains_key(&connection.device.id));
        assert!(!registry.peripherals.contains_key(&stale));
        assert_eq!(registry.device_ids.len(), 1);

        let again = registry.register("headphones", ());
        assert_ne!(again, stale);
    }

    #[test]
    fn lost_peripheral_closes_its_connections() {
        let (mut registry, connection) = registry_with_link();
        registry.register("headphones", ());

        assert!(registry.remove_connections_of(&"headphones").is_empty());
        assert_eq!(registry.remove_connections_of(&"massager"), vec![connection]);
        assert!(registry.connections.is_empty());
    }

    #[test]
    fn drain_returns_open_links() {
        let (mut registry, connection) = registry_with_link();
        registry.scanning = true;

        let links = registry.drain();

        assert_eq!(links.len(), 1);
        assert_eq!(links[0].handle, connection);
        assert!(!registry.scanning);
        assert!(registry.peripherals.is_empty());
        assert!(registry.device_ids.is_empty());
    }
}
