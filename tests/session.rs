//! Drives a full session against a simulated massager.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use btleplug::api::CharPropFlags;
use futures::channel::mpsc::{channel, Sender, UnboundedReceiver};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ao_remote::config::types::DeviceConfig;
use ao_remote::device::constants::{
    make_massager_notify_uuid, make_massager_service_uuid, make_massager_write_uuid, CONNECT_DELAY,
};
use ao_remote::device::session::spawn_session;
use ao_remote::device::transport::Transport;
use ao_remote::device::types::{
    BatteryLevel, CharacteristicRef, ConnectionHandle, ConnectionState, DeviceEvent, DeviceHandle,
    ServiceDescriptor, TransportEvent,
};
use ao_remote::error::{CommandError, DeviceError};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    StartScan,
    StopScan,
    Connect,
    Disconnect,
    Write(Vec<u8>),
    Release,
    Released,
}

/// Answers every request right away, the way a cooperative massager would.
struct SimulatedMassager {
    events: Sender<TransportEvent>,
    calls: Arc<Mutex<Vec<Call>>>,
    battery: u8,
}

impl SimulatedMassager {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn emit(&mut self, event: TransportEvent) {
        self.events.try_send(event).expect("event queue full");
    }
}

impl Transport for SimulatedMassager {
    fn start_scan(&mut self) -> Result<(), DeviceError> {
        self.record(Call::StartScan);
        self.emit(TransportEvent::Advertisement(DeviceHandle {
            id: 1,
            name: Some("Headphones".to_string()),
            address: "11:11:11:11:11:11".to_string(),
        }));
        self.emit(TransportEvent::Advertisement(DeviceHandle {
            id: 2,
            name: Some("AoMassager".to_string()),
            address: "22:22:22:22:22:22".to_string(),
        }));
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), DeviceError> {
        self.record(Call::StopScan);
        Ok(())
    }

    fn connect(&mut self, device: &DeviceHandle) -> Result<ConnectionHandle, DeviceError> {
        self.record(Call::Connect);
        let connection = ConnectionHandle { id: 1, device: device.clone() };
        self.emit(TransportEvent::GattStateChanged { connection: connection.clone(), connected: true });
        Ok(connection)
    }

    fn disconnect(&mut self, _: &ConnectionHandle) -> Result<(), DeviceError> {
        self.record(Call::Disconnect);
        Ok(())
    }

    fn discover_services(&mut self, connection: &ConnectionHandle) -> Result<(), DeviceError> {
        let services = vec![ServiceDescriptor {
            uuid: make_massager_service_uuid(),
            characteristics: vec![
                CharacteristicRef { uuid: make_massager_write_uuid(), properties: CharPropFlags::WRITE },
                CharacteristicRef {
                    uuid: make_massager_notify_uuid(),
                    properties: CharPropFlags::READ | CharPropFlags::NOTIFY,
                },
            ],
        }];
        self.emit(TransportEvent::ServicesDiscovered { connection: connection.clone(), services });
        Ok(())
    }

    fn enable_notifications(&mut self, _: &ConnectionHandle, _: &CharacteristicRef) -> Result<(), DeviceError> {
        Ok(())
    }

    fn read_characteristic(&mut self, connection: &ConnectionHandle, characteristic: &CharacteristicRef) -> Result<(), DeviceError> {
        let value = vec![self.battery];
        self.emit(TransportEvent::CharacteristicValue {
            connection: connection.clone(),
            characteristic: characteristic.uuid,
            value,
        });
        Ok(())
    }

    fn write_characteristic(&mut self, _: &ConnectionHandle, characteristic: &CharacteristicRef, data: &[u8]) -> Result<(), DeviceError> {
        self.record(Call::Write(data.to_vec()));
        self.emit(TransportEvent::WriteCompleted { characteristic: characteristic.uuid, result: Ok(()) });
        Ok(())
    }

    fn release(&mut self) -> Option<JoinHandle<()>> {
        self.record(Call::Release);

        let calls = self.calls.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            calls.lock().unwrap().push(Call::Released);
        }))
    }
}

fn simulated_massager(battery: u8) -> (SimulatedMassager, futures::channel::mpsc::Receiver<TransportEvent>, Arc<Mutex<Vec<Call>>>) {
    let (events, events_rx) = channel(64);
    let calls = Arc::new(Mutex::new(vec![]));
    let transport = SimulatedMassager { events, calls: calls.clone(), battery };
    (transport, events_rx, calls)
}

async fn wait_for(device_events: &mut UnboundedReceiver<DeviceEvent>, expected: DeviceEvent) {
    while let Some(event) = device_events.next().await {
        if event == expected {
            return;
        }
    }
    panic!("store stopped publishing before {:?}", expected);
}

#[tokio::test(start_paused = true)]
async fn scan_connect_command_and_shutdown() {
    let (transport, events_rx, calls) = simulated_massager(0x4B);
    let cancel = CancellationToken::new();
    let (mut session, task) = spawn_session(DeviceConfig::default(), transport, events_rx, cancel);
    let mut device_events = session.store().subscribe();

    assert!(matches!(session.send_command(0x0001).await, Err(CommandError::NotConnected)));

    session.start_scan().await.unwrap();
    wait_for(&mut device_events, DeviceEvent::StateChange(ConnectionState::Connected)).await;
    wait_for(&mut device_events, DeviceEvent::Battery(BatteryLevel(75))).await;
    assert_eq!(session.store().battery_level(), Some(BatteryLevel(75)));

    session.send_command(0x0002).await.unwrap();

    session.shutdown();
    task.await.unwrap();

    assert_eq!(session.store().connection_state(), ConnectionState::Disconnected);
    assert_eq!(*calls.lock().unwrap(), vec![
        Call::StartScan,
        Call::StopScan,
        Call::Connect,
        Call::Write(vec![0x00, 0x02]),
        Call::Disconnect,
        Call::Release,
        Call::Released,
    ]);

    assert!(matches!(session.send_command(0x0001).await, Err(CommandError::SessionClosed)));
    assert!(matches!(session.start_scan().await, Err(DeviceError::SessionClosed)));
}

#[tokio::test(start_paused = true)]
async fn connect_waits_for_settle_delay() {
    let (transport, events_rx, calls) = simulated_massager(10);
    let (mut session, _task) = spawn_session(DeviceConfig::default(), transport, events_rx, CancellationToken::new());

    session.start_scan().await.unwrap();
    tokio::time::sleep(Duration::from_millis(CONNECT_DELAY - 100)).await;

    assert_eq!(session.store().connection_state(), ConnectionState::Connecting);
    assert!(!calls.lock().unwrap().contains(&Call::Connect));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(session.store().connection_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_settle_delay_cancels_connect() {
    let (transport, events_rx, calls) = simulated_massager(10);
    let (mut session, task) = spawn_session(DeviceConfig::default(), transport, events_rx, CancellationToken::new());

    session.start_scan().await.unwrap();
    tokio::time::sleep(Duration::from_millis(CONNECT_DELAY / 2)).await;
    session.shutdown();
    task.await.unwrap();

    tokio::time::sleep(Duration::from_millis(CONNECT_DELAY * 2)).await;

    assert_eq!(*calls.lock().unwrap(), vec![Call::StartScan, Call::StopScan, Call::Release, Call::Released]);
    assert_eq!(session.store().connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn stop_scan_then_scan_again() {
    let (transport, events_rx, calls) = simulated_massager(10);
    let (mut session, _task) = spawn_session(DeviceConfig::default(), transport, events_rx, CancellationToken::new());
    let mut device_events = session.store().subscribe();

    session.start_scan().await.unwrap();
    session.stop_scan().await.unwrap();
    wait_for(&mut device_events, DeviceEvent::StateChange(ConnectionState::Connecting)).await;
    wait_for(&mut device_events, DeviceEvent::StateChange(ConnectionState::Disconnected)).await;

    session.start_scan().await.unwrap();
    wait_for(&mut device_events, DeviceEvent::StateChange(ConnectionState::Connected)).await;

    assert_eq!(calls.lock().unwrap().iter().filter(|call| **call == Call::Connect).count(), 1);
}
