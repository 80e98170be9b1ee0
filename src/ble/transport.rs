//! Radio abstraction trait definitions and core types
//!
//! Defines the abstract heart-rate radio interface that both the simulated
//! transport and the real BLE (btleplug) implementation conform to. The
//! connection supervisor only ever talks to these traits.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::BleError;

/// A stable peripheral identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceId {
    /// A real 6-byte BLE MAC address.
    Address([u8; 6]),
    /// A simulated device identified by UUID.
    Simulated(Uuid),
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Address(a) => write!(
                f,
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                a[0], a[1], a[2], a[3], a[4], a[5]
            ),
            DeviceId::Simulated(uuid) => write!(f, "sim:{}", uuid),
        }
    }
}

/// A received BLE advertisement.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    /// Address of the advertising device.
    pub id: DeviceId,
    /// Advertised local name (if present in the frame).
    pub local_name: Option<String>,
    /// Received signal strength indicator (if available), in dBm.
    pub rssi: Option<i16>,
}

/// Transport-level connection state as reported by the radio.
///
/// Some transports emit a `Disconnected` with no reason before any attempt
/// has been made; [`TransportState::is_real_change`] lets consumers filter
/// that idle noise out.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected { reason: Option<String> },
}

impl TransportState {
    /// Whether this frame represents a genuine state change rather than the
    /// initial "disconnected, nothing happened yet" noise.
    pub fn is_real_change(&self) -> bool {
        !matches!(self, TransportState::Disconnected { reason: None })
    }
}

/// A handle to a single heart-rate peripheral.
#[async_trait]
pub trait HeartRatePeripheral: Send + Sync {
    /// The peripheral's stable identifier.
    fn id(&self) -> &DeviceId;

    /// The peripheral's display name, if known.
    fn name(&self) -> Option<String>;

    /// Subscribe to transport state changes.
    fn states(&self) -> broadcast::Receiver<TransportState>;

    /// Establish the link. Resolves once the transport reports connected.
    async fn connect(&self) -> Result<(), BleError>;

    /// Subscribe to raw Heart Rate Measurement characteristic payloads.
    /// Fails if the link is not up.
    async fn notifications(&self) -> Result<broadcast::Receiver<Vec<u8>>, BleError>;

    /// Tear the link down. Safe to call on an already-dead link.
    async fn disconnect(&self) -> Result<(), BleError>;
}

/// BLE central role: scanning for advertisements and resolving peripherals.
#[async_trait]
pub trait HeartRateCentral: Send + Sync {
    /// Start scanning for advertisements.
    async fn start_scan(&self) -> Result<(), BleError>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Subscribe to discovered advertisements.
    fn advertisements(&self) -> broadcast::Receiver<Advertisement>;

    /// Resolve a peripheral handle for the given identifier.
    async fn peripheral(&self, id: &DeviceId) -> Result<Arc<dyn HeartRatePeripheral>, BleError>;
}
