use futures::channel::mpsc::{channel, Receiver, Sender};
use futures::{SinkExt, StreamExt};
use log::{error, info};
use tokio::spawn;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::types::DeviceConfig;
use crate::device::machine::{ConnectAttempt, ConnectionMachine};
use crate::device::store::StateStore;
use crate::device::transport::Transport;
use crate::device::types::TransportEvent;
use crate::error::{readable_join_error, CommandError, DeviceError};

#[derive(Debug)]
pub enum SessionRequest {
    StartScan,
    StopScan,
    SendCommand {
        code: u16,
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
}

/// The UI facing side of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    requests: Sender<SessionRequest>,
    store: StateStore,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub async fn start_scan(&mut self) -> Result<(), DeviceError> {
        self.requests.send(SessionRequest::StartScan).await.map_err(|_| DeviceError::SessionClosed)
    }

    pub async fn stop_scan(&mut self) -> Result<(), DeviceError> {
        self.requests.send(SessionRequest::StopScan).await.map_err(|_| DeviceError::SessionClosed)
    }

    /// Resolves once the write has been issued, not when the device acknowledged it.
    pub async fn send_command(&mut self, code: u16) -> Result<(), CommandError> {
        let (reply, reply_rx) = oneshot::channel();

        self.requests
            .send(SessionRequest::SendCommand { code, reply })
            .await
            .map_err(|_| CommandError::SessionClosed)?;

        reply_rx.await.map_err(|_| CommandError::SessionClosed)?
    }

    /// Tear the session down; the session task ends once the transport is fully released.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

fn handle_request<T: Transport>(machine: &mut ConnectionMachine<T>, request: SessionRequest) {
    match request {
        SessionRequest::StartScan => machine.start_scan(),
        SessionRequest::StopScan => machine.stop_scan(),
        SessionRequest::SendCommand { code, reply } => {
            // the caller may have given up waiting
            let _ = reply.send(machine.send_command(code));
        },
    }
}

/// Run the state machine on its own task. Requests, transport events and connect timers are all
/// funnelled through this one task, so the machine is never re-entered.
pub fn spawn_session<T>(
    config: DeviceConfig,
    transport: T,
    mut events: Receiver<TransportEvent>,
    cancel: CancellationToken,
) -> (SessionHandle, JoinHandle<()>)
where
    T: Transport + Send + 'static,
{
    let (request_tx, mut request_rx) = channel::<SessionRequest>(16);
    let (timer_tx, mut timer_rx) = channel::<ConnectAttempt>(4);
    let store = StateStore::new();

    let mut machine = ConnectionMachine::new(config, transport, store.clone(), timer_tx, cancel.child_token());
    let session_cancel = cancel.clone();

    let handle = spawn(async move {
        'mainloop: loop {
            tokio::select! {
                _ = session_cancel.cancelled() => {
                    break 'mainloop;
                },
                Some(request) = request_rx.next() => {
                    handle_request(&mut machine, request);
                },
                Some(event) = events.next() => {
                    machine.handle_event(event);
                },
                Some(attempt) = timer_rx.next() => {
                    machine.on_connect_due(attempt);
                },
            }
        }

        machine.shutdown();
        if let Some(teardown) = machine.take_teardown() {
            if let Err(err) = teardown.await {
                error!("Releasing the transport failed: {}", readable_join_error(err));
            }
        }
        info!("Device session stopped");
    });

    (SessionHandle { requests: request_tx, store, cancel }, handle)
}
