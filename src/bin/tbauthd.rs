// Thunderbolt/USB4 device authorization daemon
//
// Copyright (C) 2023, Intel Corporation
// Author: Mika Westerberg <mika.westerberg@linux.intel.com>

use std::process;

use clap::Parser;

use tbauthd::ipc::LoggingSink;
use tbauthd::store::JsonStore;
use tbauthd::Manager;

#[derive(Parser, Debug)]
#[command(version)]
#[command(about = "Thunderbolt/USB4 device authorization daemon", long_about = None)]
struct Args {
    /// Directory holding persisted device records
    #[arg(long, default_value = "/var/lib/tbauthd")]
    store_dir: String,
    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Decrease log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    quiet: u8,
}

fn log_level(args: &Args) -> log::LevelFilter {
    let level = 2 + i8::try_from(args.verbose).unwrap_or(i8::MAX)
        - i8::try_from(args.quiet).unwrap_or(i8::MAX);

    match level {
        i8::MIN..=0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(log_level(&args))
        .init();

    let store = match JsonStore::open(&args.store_dir) {
        Ok(store) => Box::new(store),
        Err(err) => {
            log::error!("failed to open store at '{}': {err}", args.store_dir);
            process::exit(1);
        }
    };

    let monitor = match tbauthd::monitor::Monitor::open() {
        Ok(monitor) => monitor,
        Err(err) => {
            log::error!("failed to subscribe to thunderbolt hotplug events: {err}");
            process::exit(1);
        }
    };

    let kernel_monitor = match tbauthd::monitor::KernelMonitor::open() {
        Ok(monitor) => Some(monitor),
        Err(err) => {
            log::warn!("failed to subscribe to diagnostic kernel hotplug stream: {err}");
            None
        }
    };

    let sink = Box::new(LoggingSink::default());
    let manager = Manager::new(store, sink);

    if let Err(err) = manager.run(monitor, kernel_monitor) {
        log::error!("fatal: {err}");
        process::exit(1);
    }
}
