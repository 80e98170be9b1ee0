//! BLE layer for the heart-rate link
//!
//! Provides the radio abstraction traits, the Heart Rate Measurement
//! codec, and a simulated transport for testing without hardware.

pub mod codec;
pub mod simulated;
pub mod transport;

#[cfg(feature = "ble-central")]
pub mod central;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BleError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("Notification error: {0}")]
    NotifyError(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,
}
