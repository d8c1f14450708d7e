// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Driver host configuration loaded from TOML

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

/// Worker threads for the driver dispatcher.
pub const DEFAULT_DISPATCHER_THREADS: usize = 2;
/// Work items run per event-waiter wake.
pub const DEFAULT_WORK_ITEMS_PER_WAKE: usize = 10;
/// Log level used when none is configured.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Offending path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for this configuration.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
    /// The configuration parsed but holds unusable values.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Driver host settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverHostConfig {
    /// Worker threads for the driver dispatcher. Must be at least one.
    pub dispatcher_threads: usize,
    /// Work items run per wake; zero runs everything queued.
    pub work_items_per_wake: usize,
    /// Directory scanned for driver manifests.
    pub driver_dir: Option<PathBuf>,
    /// Log level filter (`off`, `error`, `warn`, `info`, `debug`, `trace`).
    pub log_level: String,
}

impl Default for DriverHostConfig {
    fn default() -> Self {
        Self {
            dispatcher_threads: DEFAULT_DISPATCHER_THREADS,
            work_items_per_wake: DEFAULT_WORK_ITEMS_PER_WAKE,
            driver_dir: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl DriverHostConfig {
    /// Reads and validates the configuration stored at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::parse(&text, path)
    }

    /// Parses and validates configuration text. `path` is used in errors only.
    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatcher_threads == 0 {
            return Err(ConfigError::Invalid("dispatcher_threads must be at least 1".into()));
        }
        self.level_filter()?;
        Ok(())
    }

    /// Parsed `log_level`.
    pub fn level_filter(&self) -> Result<log::LevelFilter, ConfigError> {
        log::LevelFilter::from_str(&self.log_level)
            .map_err(|_| ConfigError::Invalid(format!("unknown log level '{}'", self.log_level)))
    }
}
