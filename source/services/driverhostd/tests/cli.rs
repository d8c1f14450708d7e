// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: driverhostd CLI and daemon tests
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 4 tests
//!
//! TEST_SCOPE:
//!   - One-shot run binding every manifest in the driver directory
//!   - Control channel service on the driver dispatcher
//!   - Root host started from the `[root_host]` table
//!
//! TEST_SCENARIOS:
//!   - once_binds_discovered_drivers()
//!   - missing_config_file_is_reported()
//!   - control_messages_reach_the_host()
//!   - root_host_windows_from_config()
//!
//! DEPENDENCIES:
//!   - driverhostd::execute / Daemon
//!   - tempfile: config files and driver directories
//!
//! ADR: docs/adr/0003-ipc-runtime-architecture.md

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use driverhostd::{execute, Daemon, DaemonConfig, DaemonError};
use nexus_driver_runtime::Arena;
use tempfile::TempDir;

fn write_manifest(dir: &Path, file: &str, name: &str) {
    let text = format!("name = \"{name}\"\nvendor = \"nexus\"\nversion = \"1.0\"\n");
    fs::write(dir.join(file), text).unwrap();
}

fn config_with_drivers(root: &TempDir, extra: &str) -> std::path::PathBuf {
    let drivers = root.path().join("drivers");
    fs::create_dir(&drivers).unwrap();
    write_manifest(&drivers, "10-ahci.toml", "ahci");
    write_manifest(&drivers, "20-xhci.toml", "xhci");
    fs::write(drivers.join("README"), "not a manifest").unwrap();
    fs::write(drivers.join("30-broken.toml"), "name = ").unwrap();

    let config = root.path().join("driverhost.toml");
    let text = format!(
        "[host]\ndispatcher_threads = 1\nwork_items_per_wake = 1\ndriver_dir = \"{}\"\n{extra}",
        drivers.display()
    );
    fs::write(&config, text).unwrap();
    config
}

#[test]
fn once_binds_discovered_drivers() {
    let root = TempDir::new().unwrap();
    let config = config_with_drivers(&root, "");
    let path = config.to_str().unwrap();
    let output = execute(&["--config", path, "--once"]).unwrap();
    assert!(output.contains("bound 2 drivers: ahci, xhci"), "{output}");
}

#[test]
fn missing_config_file_is_reported() {
    let root = TempDir::new().unwrap();
    let path = root.path().join("absent.toml");
    let err = execute(&["--config", path.to_str().unwrap(), "--once"]).unwrap_err();
    assert!(matches!(err, DaemonError::Read { .. }));
}

#[test]
fn control_messages_reach_the_host() {
    let root = TempDir::new().unwrap();
    let config = DaemonConfig::load(&config_with_drivers(&root, "")).unwrap();
    let daemon = Daemon::start(config).unwrap();
    assert_eq!(daemon.discover().unwrap(), 2);
    daemon.run_once();
    assert_eq!(daemon.bound_drivers(), vec!["ahci".to_string(), "xhci".to_string()]);

    let visible = daemon.with_bound("ahci", |bound| bound.device().is_visible()).unwrap();
    assert!(visible);
    daemon
        .with_bound("ahci", |bound| {
            let arena = Arena::create("ctl");
            for byte in 0..3u8 {
                let data = arena.alloc_copy(&[byte]);
                bound.control().write(Some(&arena), Some(data), Vec::new()).unwrap();
            }
        })
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        daemon.dispatcher().wait_until_idle();
        let received = daemon.with_bound("ahci", |bound| bound.messages_received()).unwrap();
        if received == 3 {
            break;
        }
        assert!(Instant::now() < deadline, "host consumed {received} of 3 messages");
        std::thread::sleep(Duration::from_millis(5));
    }
    daemon.shutdown();
}

#[test]
fn root_host_windows_from_config() {
    let root = TempDir::new().unwrap();
    let extra = "[root_host]\nio = [{ base = 0x1000, size = 0x1000 }]\n\
                 mcfg = [{ address = 0xb0000000, segment = 0, start_bus = 0, end_bus = 255 }]\n";
    let config = DaemonConfig::load(&config_with_drivers(&root, extra)).unwrap();
    let daemon = Daemon::start(config).unwrap();
    let root_host = daemon.root_host().expect("root host configured");
    let (resource, _token) = root_host.allocate_io_window(0, 0x100).unwrap();
    assert_eq!(resource.base(), 0x1000);
    assert_eq!(root_host.get_segment_mcfg_allocation(0).unwrap().address, 0xb000_0000);
}
