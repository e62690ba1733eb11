use std::path::PathBuf;
use futures::channel::mpsc::{channel, UnboundedReceiver};
use futures::StreamExt;
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::spawn;
use tokio_util::sync::CancellationToken;

use crate::cli::types::{parse_user_command, UserCommand, HELP};
use crate::config::io::ConfigIO;
use crate::device::btle::BtleTransport;
use crate::device::session::{spawn_session, SessionHandle};
use crate::device::types::{DeviceEvent, TransportEvent};
use crate::error::{readable_join_error, AppRunError};

#[derive(Debug, Clone, Default)]
pub struct ApplicationOptions {
    pub config_path: Option<PathBuf>,
    pub scan_on_start: bool,
}

async fn print_device_events(mut device_events: UnboundedReceiver<DeviceEvent>, cancel: CancellationToken) {
    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            event = device_events.next() => match event {
                Some(DeviceEvent::StateChange(state)) => println!("Device: {}", state),
                Some(DeviceEvent::Battery(battery)) => println!("Battery: {}", battery),
                Some(DeviceEvent::BatteryUnknown) => println!("Battery: unknown"),
                None => break 'mainloop,
            },
        }
    }
}

fn print_status(session: &SessionHandle) {
    let store = session.store();
    let battery = store.battery_level()
        .map(|battery| battery.to_string())
        .unwrap_or("unknown".to_string());

    println!("Device: {}, Battery: {}", store.connection_state(), battery);
}

async fn handle_user_command(session: &mut SessionHandle, command: UserCommand) -> Result<bool, AppRunError> {
    match command {
        UserCommand::Scan => session.start_scan().await?,
        UserCommand::Stop => session.stop_scan().await?,
        UserCommand::Send(code) => match session.send_command(code).await {
            Ok(()) => println!("Sent command {:#06x}", code),
            Err(err) => println!("Command {:#06x} failed: {}", code, err),
        },
        UserCommand::Status => print_status(session),
        UserCommand::Quit => return Ok(false),
    }

    Ok(true)
}

pub async fn run_application(options: ApplicationOptions) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new(options.config_path)?;
    info!("Using config file {}", config_io.path().display());
    let config = config_io.read().await?;

    // this token is cancelled upon exit
    let app_cancel = CancellationToken::new();

    let (events_tx, events_rx) = channel::<TransportEvent>(64);
    let transport = BtleTransport::new(events_tx, app_cancel.child_token()).await?;
    let (mut session, session_task) = spawn_session(config.device, transport, events_rx, app_cancel.clone());

    let printer_task = spawn(print_device_events(session.store().subscribe(), app_cancel.clone()));

    if options.scan_on_start {
        session.start_scan().await?;
    }

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut result = Ok(());

    while let Some(line) = lines.next_line().await? {
        match parse_user_command(&line) {
            Ok(command) => match handle_user_command(&mut session, command).await {
                Ok(true) => {},
                Ok(false) => break,
                Err(err) => {
                    result = Err(err);
                    break;
                },
            },
            Err(message) => println!("{}", message),
        }
    }

    info!("Shutting down");
    session.shutdown();

    if let Err(err) = session_task.await {
        warn!("Device session task failed: {}", readable_join_error(err));
    }
    if let Err(err) = printer_task.await {
        warn!("Event printer task failed: {}", readable_join_error(err));
    }

    result
}
