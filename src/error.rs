use std::any::Any;
use std::io;
use thiserror::Error;
use uuid::Uuid;
use btleplug;
use serde_json;
use tokio::task::JoinError;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to read config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No bluetooth adapter is available")]
    NoAdapter,

    #[error("The device is no longer known to the bluetooth adapter")]
    UnknownDevice,

    #[error("The connection is no longer known to the bluetooth adapter")]
    UnknownConnection,

    #[error("The required bluetooth service {uuid} is not available")]
    MissingService { uuid: Uuid },

    #[error("The required bluetooth characteristic {uuid} is not available")]
    MissingCharacteristic { uuid: Uuid },

    #[error("The device session has stopped")]
    SessionClosed,
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("The device is not connected")]
    NotConnected,

    #[error("The write characteristic does not support writes")]
    CharacteristicNotWritable,

    #[error("Failed to issue write to device: {source}")]
    WriteFailed { source: DeviceError },

    #[error("The device session has stopped")]
    SessionClosed,
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (device): {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Failed to read user input: {source}")]
    IOError { #[from] source: io::Error },
}

pub fn readable_panic_error(error: &Box<dyn Any + Send + 'static>) -> String {
    let mut stringified = String::from("???");

    if let Some(s) = error.downcast_ref::<&str>() {
        stringified = s.to_string();
    }
    else if let Some(s) = error.downcast_ref::<String>() {
        stringified = s.clone();
    }

    format!("panic from task: [{}]", stringified)
}

pub fn readable_join_error(error: JoinError) -> String {
    if error.is_panic() {
        readable_panic_error(&error.into_panic())
    } else {
        error.to_string()
    }
}
