use uuid::Uuid;

/**
 * How often (milliseconds) to poll for new breath values / check for the connection status.
 */
pub const TICK_INTERVAL: u64 = 10;

/**
 * How often (milliseconds) to attempt to (re)connect.
 */
pub const RETRY_DELAY: u64 = 1000;

/**
 * How long (milliseconds) the whole connect / discover / subscribe sequence may take.
 */
pub const INIT_DEADLINE: u64 = 10_000;

/**
 * How long (milliseconds) a write to a characteristic may take.
 */
pub const WRITE_DEADLINE: u64 = 2000;

/**
 * How long (milliseconds) a transport-level disconnect may take before it is abandoned.
 */
pub const DISCONNECT_DEADLINE: u64 = 2000;

/**
 * How long (milliseconds) checking if the peripheral is still connected may take
 */
pub const IS_CONNECTED_DEADLINE: u64 = 2000;

/**
 * The UUID of the Bluetooth BLE service for Melody Smart
 */
pub const MELODY_SMART_SERVICE: &str = "bc2f4cc6-aaef-4351-9034-d66268e328f0";

/**
 * The UUID of the Bluetooth BLE remote GATT characteristic to send data commands to.
 */
pub const MELODY_SMART_DATA_CHARACTERISTIC: &str = "06d1e5e7-79ad-4a71-8faa-373789f7d93c";

pub const COMMAND_REQUEST_BREATH: [u8; 2] = [0x3F, 0x62]; // ?b

/**
 * The range of the breath value received from the device.
 * - around BREATH_RANGE is neutral
 * - towards 0 represents strength of sipping
 * - towards BREATH_RANGE*2 represents strength of puffing.
 * Note that this value is normalized in most of the code by subtracting 2048 (so that 0 is neutral)
 */
pub const BREATH_RANGE: i16 = 2048;

/**
 * Fraction of BREATH_RANGE around the neutral value that is reported as exactly neutral.
 */
pub const DEFAULT_DEAD_ZONE: f64 = 0.025;

/**
 * How many raw samples one calibration collects before the neutral offset is recomputed.
 */
pub const CALIBRATION_SAMPLES: usize = 50;

pub fn make_melody_smart_service_uuid() -> Uuid {
    Uuid::parse_str(MELODY_SMART_SERVICE).unwrap()
}

pub fn make_melody_smart_data_uuid() -> Uuid {
    Uuid::parse_str(MELODY_SMART_DATA_CHARACTERISTIC).unwrap()
}
