// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Command line entry points for the driver host daemon.

use std::path::PathBuf;

use env_logger::Env;
use log::{info, LevelFilter};

use crate::{Daemon, DaemonConfig, DaemonError};

/// Parsed command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    /// Configuration file; defaults apply when absent.
    pub config: Option<PathBuf>,
    /// Drain queued work once and exit.
    pub once: bool,
    /// Print usage and exit.
    pub help: bool,
}

/// Returns the CLI usage string.
pub fn help() -> &'static str {
    "driverhostd hosts device drivers. Usage: driverhostd [--help] [--config <path>] [--once]"
}

/// Parses daemon arguments.
pub fn parse_args(args: &[&str]) -> Result<Options, DaemonError> {
    let mut options = Options::default();
    let mut args = args.iter();
    while let Some(arg) = args.next() {
        match *arg {
            "--help" | "-h" => options.help = true,
            "--once" => options.once = true,
            "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| DaemonError::Usage("--config needs a path".to_string()))?;
                options.config = Some(PathBuf::from(path));
            }
            other => return Err(DaemonError::Usage(format!("unknown argument {other}"))),
        }
    }
    Ok(options)
}

/// Executes the daemon with the given arguments.
///
/// With `--once` the discovered drivers are bound and a summary is returned;
/// otherwise this blocks running the host loop.
pub fn execute(args: &[&str]) -> Result<String, DaemonError> {
    let options = parse_args(args)?;
    if options.help {
        return Ok(help().to_string());
    }
    let config = match &options.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };
    init_logging(config.host.level_filter()?);
    match &options.config {
        Some(path) => info!("driver_host: config {}", path.display()),
        None => info!("driver_host: using default config"),
    }

    let daemon = Daemon::start(config)?;
    daemon.discover()?;
    if options.once {
        daemon.run_once();
        daemon.dispatcher().wait_until_idle();
        let bound = daemon.bound_drivers();
        return Ok(format!("driverhostd bound {} drivers: {}", bound.len(), bound.join(", ")));
    }
    daemon.run();
    Ok("driverhostd stopped".to_string())
}

/// Parses `std::env::args`, runs the daemon and returns the exit code.
pub fn run() -> i32 {
    let owned: Vec<String> = std::env::args().skip(1).collect();
    let refs: Vec<&str> = owned.iter().map(|s| s.as_str()).collect();
    match execute(&refs) {
        Ok(output) => {
            println!("{output}");
            0
        }
        Err(err) => {
            eprintln!("driverhostd: {err}");
            1
        }
    }
}

fn init_logging(level: LevelFilter) {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(level.as_str()));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}
