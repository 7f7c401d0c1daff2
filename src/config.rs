use serde::{Deserialize, Serialize};

use crate::device::constants::{
    CALIBRATION_SAMPLES, DEFAULT_DEAD_ZONE, DISCONNECT_DEADLINE, INIT_DEADLINE, RETRY_DELAY,
    TICK_INTERVAL, WRITE_DEADLINE,
};

/// Tunable timing and conditioning options for a session.
///
/// The defaults match the GroovTube peripheral; every field can be
/// overridden from JSON, with omitted fields falling back to the default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Milliseconds between tick starts (connection upkeep + breath polling).
    pub tick_interval: u64,

    /// Minimum milliseconds between two connection attempts.
    pub retry_delay: u64,

    /// Deadline in milliseconds for the whole connect/discover/subscribe sequence.
    pub init_deadline: u64,

    /// Deadline in milliseconds for a single characteristic write.
    pub write_deadline: u64,

    /// Deadline in milliseconds for a transport-level disconnect.
    pub disconnect_deadline: u64,

    /// Fraction of the breath range around neutral reported as exactly 0.
    pub dead_zone: f64,

    /// Raw samples collected by one calibration.
    pub calibration_samples: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            tick_interval: TICK_INTERVAL,
            retry_delay: RETRY_DELAY,
            init_deadline: INIT_DEADLINE,
            write_deadline: WRITE_DEADLINE,
            disconnect_deadline: DISCONNECT_DEADLINE,
            dead_zone: DEFAULT_DEAD_ZONE,
            calibration_samples: CALIBRATION_SAMPLES,
        }
    }
}
