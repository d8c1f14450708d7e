// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Root host pool configuration
//!
//! ```toml
//! io = [{ base = 0x1000, size = 0xf000 }]
//! mmio32 = [{ base = 0xe000_0000, size = 0x1000_0000 }]
//! mmio64 = [{ base = 0x40_0000_0000, size = 0x40_0000_0000 }]
//! mcfg = [{ address = 0xb000_0000, segment = 0, start_bus = 0, end_bus = 255 }]
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::McfgAllocation;

/// Exclusive upper bound of the I/O port space.
pub const IO_SPACE_LIMIT: u64 = 0x1_0000;
/// Exclusive upper bound of 32-bit MMIO space.
pub const MMIO32_SPACE_LIMIT: u64 = 0x1_0000_0000;

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

/// One address range contributed to a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeConfig {
    /// First address.
    pub base: u64,
    /// Length.
    pub size: u64,
}

/// One MCFG table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct McfgConfig {
    /// ECAM base address.
    pub address: u64,
    /// PCI segment group.
    pub segment: u16,
    /// First decoded bus.
    pub start_bus: u8,
    /// Last decoded bus.
    pub end_bus: u8,
}

impl From<McfgConfig> for McfgAllocation {
    fn from(entry: McfgConfig) -> Self {
        McfgAllocation {
            address: entry.address,
            pci_segment: entry.segment,
            start_bus_number: entry.start_bus,
            end_bus_number: entry.end_bus,
        }
    }
}

/// Address-space pools and firmware tables handed to the root host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RootHostConfig {
    /// I/O port ranges.
    pub io: Vec<RangeConfig>,
    /// MMIO ranges below 4 GiB.
    pub mmio32: Vec<RangeConfig>,
    /// MMIO ranges anywhere in the 64-bit space.
    pub mmio64: Vec<RangeConfig>,
    /// MCFG entries.
    pub mcfg: Vec<McfgConfig>,
}

impl RootHostConfig {
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

    /// Checks every range and MCFG entry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_ranges("io", &self.io, Some(IO_SPACE_LIMIT))?;
        check_ranges("mmio32", &self.mmio32, Some(MMIO32_SPACE_LIMIT))?;
        check_ranges("mmio64", &self.mmio64, None)?;
        for entry in &self.mcfg {
            if entry.start_bus > entry.end_bus {
                return Err(ConfigError::Invalid(format!(
                    "mcfg segment {}: start_bus {} is after end_bus {}",
                    entry.segment, entry.start_bus, entry.end_bus
                )));
            }
        }
        Ok(())
    }
}

fn check_ranges(pool: &str, ranges: &[RangeConfig], limit: Option<u64>) -> Result<(), ConfigError> {
    for range in ranges {
        let end = range.base.checked_add(range.size);
        match end {
            _ if range.size == 0 => {
                return Err(ConfigError::Invalid(format!("{pool}: empty range at {:#x}", range.base)));
            }
            None => {
                return Err(ConfigError::Invalid(format!(
                    "{pool}: range {:#x}+{:#x} overflows",
                    range.base, range.size
                )));
            }
            Some(end) if limit.is_some_and(|limit| end > limit) => {
                return Err(ConfigError::Invalid(format!(
                    "{pool}: range {:#x}-{end:#x} exceeds the address space",
                    range.base
                )));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parses_pools_and_mcfg() {
        let text = "mmio32 = [{ base = 0x1000, size = 0x10000 }]\n\
                    mcfg = [{ address = 0xb0000000, segment = 1, start_bus = 0, end_bus = 31 }]\n";
        let config = RootHostConfig::parse(text, Path::new("root.toml")).unwrap();
        assert_eq!(config.mmio32, vec![RangeConfig { base: 0x1000, size: 0x10000 }]);
        assert!(config.io.is_empty());
        let entry = McfgAllocation::from(config.mcfg[0]);
        assert_eq!(entry.pci_segment, 1);
        assert_eq!(entry.end_bus_number, 31);
    }

    #[test]
    fn rejects_ranges_outside_their_space() {
        let err = RootHostConfig::parse("io = [{ base = 0xff00, size = 0x200 }]", Path::new("r"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = RootHostConfig::parse(
            "mmio32 = [{ base = 0xffff0000, size = 0x20000 }]",
            Path::new("r"),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = RootHostConfig::parse("mmio64 = [{ base = 1, size = 0 }]", Path::new("r"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_inverted_bus_range() {
        let text = "mcfg = [{ address = 0, segment = 0, start_bus = 9, end_bus = 1 }]";
        let err = RootHostConfig::parse(text, Path::new("r")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "mmio32 = 3").unwrap();
        match RootHostConfig::load(file.path()).unwrap_err() {
            ConfigError::Parse { path, .. } => assert_eq!(path, file.path()),
            other => panic!("unexpected error: {other}"),
        }
    }
}
