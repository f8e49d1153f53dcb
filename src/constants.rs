//! Application-wide constants for the NetSIO hub.
//!
//! Timing constants come from the original `fujinet-emulator-bridge` NetSIO
//! hub and must not be changed casually — peripherals are tuned against them.

use std::time::Duration;

/// Hub version string printed in the startup banner.
pub const HUB_VERSION: &str = "v0.16";

/// Default TCP port for the Altirra custom-device channel.
pub const DEFAULT_ATDEV_PORT: u16 = 9996;

/// Default UDP port NetSIO peripherals connect to.
pub const DEFAULT_NETSIO_PORT: u16 = 9997;

/// Period of silence after which a registered device is considered expired.
pub const ALIVE_EXPIRATION: Duration = Duration::from_secs(30);

/// Credit granted to a newly registered (or freshly credited) client.
pub const DEFAULT_CREDIT: u8 = 3;

/// Coalescing buffer flush threshold, in bytes.
pub const COALESCE_BUFFER_SIZE: usize = 130;

/// Coalescing buffer max age before a forced flush.
pub const COALESCE_BUFFER_MAX_AGE: Duration = Duration::from_millis(5);

/// How long the hub waits for a sync response over UDP before giving up.
pub const UDP_SYNC_TIMEOUT: Duration = Duration::from_millis(100);

/// How long the hub waits for a sync response over serial before giving up.
pub const SERIAL_SYNC_TIMEOUT: Duration = Duration::from_millis(80);

/// Factor applied to a requested baud rate when programming the serial port.
/// Mirrors the original hub's empirical correction for real UART clocks.
pub const SERIAL_BAUD_ADJUSTMENT: f64 = 0.979;

/// Baud rate the serial port is opened at, before the emulator's first
/// NETSIO_SPEED_CHANGE reconfigures it to the SIO device's actual rate.
pub const DEFAULT_SERIAL_BAUD: u32 = 19200;

/// How long the host outbound pump waits for the emulator's ready-to-receive
/// signal before assuming something went wrong and recovering.
pub const READY_TO_RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the bounded queue feeding the host outbound pump.
pub const HOST_QUEUE_CAPACITY: usize = 8;

/// Capacity of the bounded queue feeding a peripheral backend's sender.
pub const PERIPHERAL_QUEUE_CAPACITY: usize = 16;

/// Consecutive serial I/O errors tolerated before the serial backend cools
/// down and retries.
pub const SERIAL_ERROR_COOLDOWN_THRESHOLD: u32 = 10;

/// Cooldown applied after `SERIAL_ERROR_COOLDOWN_THRESHOLD` consecutive
/// serial errors.
pub const SERIAL_ERROR_COOLDOWN: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_constants_are_sane() {
        assert!(ALIVE_EXPIRATION > COALESCE_BUFFER_MAX_AGE);
        assert!(UDP_SYNC_TIMEOUT > SERIAL_SYNC_TIMEOUT);
        assert!(DEFAULT_CREDIT as usize <= HOST_QUEUE_CAPACITY);
    }
}
