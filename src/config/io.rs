use std::path::PathBuf;
use directories_next::ProjectDirs;
use log::info;
use serde_json;

use crate::config::types::Config;
use crate::error::ConfigError;

// creates a path to ao-remote.json in an os dependent standard directory, such as %AppData% on
// windows.
fn get_local_config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "weiran", "ao-remote").map(|dirs| {
        dirs.config_dir().join("ao-remote.json")
    })
}

#[derive(Debug, Clone)]
pub struct ConfigIO {
    path: PathBuf,
}

impl ConfigIO {
    /// Use `path` if given, the platform config directory otherwise.
    pub fn new(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path,
            None => get_local_config_path().ok_or(ConfigError::NoConfigPath)?,
        };

        Ok(ConfigIO { path })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// A missing file is not an error, the defaults are used instead.
    pub async fn read(&self) -> Result<Config, ConfigError> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(source) => {
                let err = ConfigError::IOError { source };
                if err.is_file_not_found_error() {
                    info!("Config file does not exist; Using defaults");
                    return Ok(Config::default());
                }
                return Err(err);
            },
        };

        if content.is_empty() {
            return Ok(Config::default());
        }

        Ok(serde_json::from_slice(&content)?)
    }
}
