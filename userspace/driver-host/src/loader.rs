// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Driver discovery and manifest loading
//!
//! A driver is described by a TOML manifest:
//!
//! ```toml
//! name = "ahci"
//! vendor = "nexus"
//! version = "0.2.0"
//! bind_rules = ["protocol == 0x70"]
//! flags = 0
//! ```
//!
//! Discovery walks a directory in sorted order on its own thread because it
//! performs blocking I/O. Manifests that fail to load are logged and skipped.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, warn};
use serde::Deserialize;
use thiserror::Error;

/// Errors raised while discovering or loading drivers.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// The driver directory does not exist.
    #[error("driver directory not found: {0}")]
    MissingDir(PathBuf),
    /// A file or directory could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Offending path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A manifest is not valid TOML for a driver record.
    #[error("failed to parse driver manifest {path}: {source}")]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
    /// A manifest parsed but describes an unusable driver.
    #[error("invalid driver manifest {path}: {reason}")]
    Invalid {
        /// Offending path.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },
    /// The discovery thread could not be started.
    #[error("failed to start driver discovery: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Discovery metadata exposed by a driver module.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriverRecord {
    /// Driver name.
    pub name: String,
    /// Vendor string.
    pub vendor: String,
    /// Version string.
    pub version: String,
    /// Binding rules evaluated by the coordinator.
    #[serde(default)]
    pub bind_rules: Vec<String>,
    /// Driver flags.
    #[serde(default)]
    pub flags: u32,
}

/// A loaded driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Driver {
    record: DriverRecord,
    path: PathBuf,
}

impl Driver {
    /// Creates a driver from its record and origin.
    pub fn new(record: DriverRecord, path: PathBuf) -> Self {
        Self { record, path }
    }

    /// Discovery metadata.
    pub fn record(&self) -> &DriverRecord {
        &self.record
    }

    /// Driver name.
    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// Where the driver was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Loads a driver from a path.
pub trait DriverLoader: Send + Sync {
    /// Loads the driver stored at `path`.
    fn load(&self, path: &Path) -> Result<Driver, LoaderError>;

    /// Returns `true` if `path` looks like something this loader handles.
    fn accepts(&self, path: &Path) -> bool {
        path.is_file()
    }
}

/// Loads drivers from TOML manifests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestLoader;

impl ManifestLoader {
    /// Parses a manifest held in memory. `path` is used in errors only.
    pub fn parse(text: &str, path: &Path) -> Result<DriverRecord, LoaderError> {
        let record: DriverRecord = toml::from_str(text)
            .map_err(|source| LoaderError::Parse { path: path.to_path_buf(), source })?;
        if record.name.trim().is_empty() {
            return Err(LoaderError::Invalid {
                path: path.to_path_buf(),
                reason: "driver name is empty".to_string(),
            });
        }
        Ok(record)
    }
}

impl DriverLoader for ManifestLoader {
    fn load(&self, path: &Path) -> Result<Driver, LoaderError> {
        let text = fs::read_to_string(path)
            .map_err(|source| LoaderError::Read { path: path.to_path_buf(), source })?;
        let record = Self::parse(&text, path)?;
        Ok(Driver::new(record, path.to_path_buf()))
    }

    fn accepts(&self, path: &Path) -> bool {
        path.is_file() && path.extension().and_then(|ext| ext.to_str()) == Some("toml")
    }
}

/// Scans `dir` on a new thread, calling `callback` for each driver that loads.
///
/// The thread returns the number of drivers reported.
pub fn find_drivers<F>(
    dir: impl Into<PathBuf>,
    loader: Arc<dyn DriverLoader>,
    mut callback: F,
) -> Result<JoinHandle<Result<usize, LoaderError>>, LoaderError>
where
    F: FnMut(Driver) + Send + 'static,
{
    let dir = dir.into();
    thread::Builder::new()
        .name("driver-loader".to_string())
        .spawn(move || -> Result<usize, LoaderError> {
            let paths = sorted_entries(&dir)?;
            let mut found = 0;
            for path in paths.into_iter().filter(|path| loader.accepts(path)) {
                match loader.load(&path) {
                    Ok(driver) => {
                        debug!("driver_host: found driver {} at {}", driver.name(), path.display());
                        callback(driver);
                        found += 1;
                    }
                    Err(err) => warn!("driver_host: skipping {}: {err}", path.display()),
                }
            }
            Ok(found)
        })
        .map_err(LoaderError::Spawn)
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, LoaderError> {
    if !dir.exists() {
        return Err(LoaderError::MissingDir(dir.to_path_buf()));
    }
    let read = |source: std::io::Error| LoaderError::Read { path: dir.to_path_buf(), source };
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(read)? {
        paths.push(entry.map_err(read)?.path());
    }
    paths.sort();
    Ok(paths)
}
