// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Combined daemon configuration file
//!
//! ```toml
//! [host]
//! dispatcher_threads = 2
//! driver_dir = "/etc/drivers"
//!
//! [root_host]
//! mmio32 = [{ base = 0xe000_0000, size = 0x1000_0000 }]
//! ```

use std::fs;
use std::path::Path;

use nexus_driver_host::DriverHostConfig;
use nexus_pci_root::RootHostConfig;
use serde::Deserialize;

use crate::DaemonError;

/// Everything `driverhostd` reads at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Work runner, dispatcher and discovery settings.
    pub host: DriverHostConfig,
    /// PCI root host pools. With no ranges configured no root host is started.
    pub root_host: RootHostConfig,
}

impl DaemonConfig {
    /// Reads and validates the file at `path`.
    pub fn load(path: &Path) -> Result<Self, DaemonError> {
        let text = fs::read_to_string(path)
            .map_err(|source| DaemonError::Read { path: path.to_path_buf(), source })?;
        Self::parse(&text, path)
    }

    /// Parses and validates configuration text. `path` is used in errors only.
    pub fn parse(text: &str, path: &Path) -> Result<Self, DaemonError> {
        let config: Self = toml::from_str(text)
            .map_err(|source| DaemonError::Parse { path: path.to_path_buf(), source })?;
        config.host.validate()?;
        config.root_host.validate()?;
        Ok(config)
    }

    /// Returns `true` if any root host pool has a range.
    pub fn wants_root_host(&self) -> bool {
        let pools = &self.root_host;
        !(pools.io.is_empty() && pools.mmio32.is_empty() && pools.mmio64.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_tables_are_optional() {
        let config = DaemonConfig::parse("", Path::new("d.toml")).unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert!(!config.wants_root_host());
    }

    #[test]
    fn nested_validation_errors_surface() {
        let err = DaemonConfig::parse("[host]\ndispatcher_threads = 0\n", Path::new("d")).unwrap_err();
        assert!(matches!(err, DaemonError::HostConfig(_)));
        let err = DaemonConfig::parse("[root_host]\nio = [{ base = 0, size = 0 }]\n", Path::new("d"))
            .unwrap_err();
        assert!(matches!(err, DaemonError::RootHostConfig(_)));
    }

    #[test]
    fn unknown_tables_are_rejected() {
        let err = DaemonConfig::parse("[devmgr]\n", Path::new("d")).unwrap_err();
        assert!(matches!(err, DaemonError::Parse { .. }));
    }

    #[test]
    fn root_host_pools_enable_root_host() {
        let text = "[root_host]\nmmio64 = [{ base = 0x40_0000_0000, size = 0x1000 }]\n";
        assert!(DaemonConfig::parse(text, Path::new("d")).unwrap().wants_root_host());
    }
}
