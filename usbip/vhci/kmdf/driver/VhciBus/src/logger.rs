// Copyright (c) Microsoft Corporation.
// License: MIT OR Apache-2.0

//! Sends `log` records from the core to the kernel debugger.

use log::{LevelFilter, Log, Metadata, Record};
use wdk::println;

struct DbgPrintLogger;

static LOGGER: DbgPrintLogger = DbgPrintLogger;

impl Log for DbgPrintLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            println!("usbip_vhci: {}: {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Installs the logger. Later calls are ignored.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        });
    }
}
