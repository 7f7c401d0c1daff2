//! Session management for the GroovTube breath sensor peripheral: device
//! selection, connection upkeep with automatic reconnection, breath
//! polling, dead-zone conditioning and calibration, on top of a pluggable
//! wireless transport.

use std::env;

pub mod cancel;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod ticker;
pub mod transport;

pub use crate::config::SessionConfig;
pub use crate::device::session::BreathSession;
pub use crate::device::types::ReadyState;
pub use crate::error::SessionError;

pub fn init_logging() {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(
            fern::log_file(log_file).expect("Failed to open LOG_FILE")
        );
    }

    dispatch.apply().expect("Failed to initialize logger");
}
