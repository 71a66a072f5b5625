// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration for components that issue image sagas

use crate::options::ImageOptions;
use camino::{Utf8Path, Utf8PathBuf};
use dropshot::ConfigLogging;
use serde::{Deserialize, Serialize};
use slog::Logger;
use thiserror::Error;

/// Number of metadata keys requested per page when copying metadata
pub const DEFAULT_METADATA_PAGE_SIZE: usize = 64;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub log: ConfigLogging,
    #[serde(default)]
    pub clone: CloneConfig,
}

/// Tunables for the clone saga
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloneConfig {
    #[serde(default = "default_metadata_page_size")]
    pub metadata_page_size: usize,
    /// Options applied when the caller leaves them unset
    #[serde(default)]
    pub default_options: ImageOptions,
}

fn default_metadata_page_size() -> usize {
    DEFAULT_METADATA_PAGE_SIZE
}

impl Default for CloneConfig {
    fn default() -> Self {
        CloneConfig {
            metadata_page_size: DEFAULT_METADATA_PAGE_SIZE,
            default_options: ImageOptions::default(),
        }
    }
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file<P: AsRef<Utf8Path>>(
        path: P,
    ) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|error| {
            ConfigError::Io { error, path: path.to_owned() }
        })?;
        let config: Config =
            toml::from_str(&data).map_err(|error| ConfigError::Parse {
                error,
                path: path.to_owned(),
            })?;
        if config.clone.metadata_page_size == 0 {
            return Err(ConfigError::Invalid {
                path: path.to_owned(),
                message: "clone.metadata_page_size must be non-zero"
                    .to_string(),
            });
        }
        Ok(config)
    }

    /// Build the root logger described by this config
    pub fn to_logger(&self, name: &str) -> Result<Logger, ConfigError> {
        self.log.to_logger(name).map_err(|error| ConfigError::Logger { error })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {path}")]
    Io {
        #[source]
        error: std::io::Error,
        path: Utf8PathBuf,
    },
    #[error("Failed to parse config file: {path}")]
    Parse {
        #[source]
        error: toml::de::Error,
        path: Utf8PathBuf,
    },
    #[error("Invalid config file {path}: {message}")]
    Invalid { path: Utf8PathBuf, message: String },
    #[error("Failed to initialize logger")]
    Logger {
        #[source]
        error: std::io::Error,
    },
}
