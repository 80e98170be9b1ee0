//! In-process radio simulator
//!
//! Provides a simulated radio where scriptable heart-rate peripherals can
//! advertise, accept connections, stream measurement payloads, and drop the
//! link on demand. Used for integration testing and the demo binary, so the
//! whole connection lifecycle can run without BLE hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use super::codec::encode_heart_rate;
use super::transport::{
    Advertisement, DeviceId, HeartRateCentral, HeartRatePeripheral, TransportState,
};
use super::BleError;

/// The simulated "air" — a shared medium carrying advertisements, plus the
/// registry of connectable peripherals.
pub struct SimRadio {
    adv_tx: broadcast::Sender<Advertisement>,
    devices: Mutex<HashMap<DeviceId, Arc<SimPeripheral>>>,
    scanning: AtomicBool,
}

impl SimRadio {
    /// Create a new simulated radio.
    pub fn new() -> Arc<Self> {
        let (adv_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            adv_tx,
            devices: Mutex::new(HashMap::new()),
            scanning: AtomicBool::new(false),
        })
    }

    /// Create a new simulated peripheral on this radio.
    pub async fn add_device(&self, name: &str, rssi: i16) -> SimDevice {
        let (state_tx, _) = broadcast::channel(64);
        let (notify_tx, _) = broadcast::channel(64);
        let peripheral = Arc::new(SimPeripheral {
            id: DeviceId::Simulated(Uuid::new_v4()),
            name: name.to_string(),
            rssi: StdMutex::new(rssi),
            state_tx,
            notify_tx,
            connected: AtomicBool::new(false),
            connect_latency: StdMutex::new(Duration::ZERO),
            connect_failure: StdMutex::new(None),
        });
        let mut devices = self.devices.lock().await;
        devices.insert(peripheral.id.clone(), Arc::clone(&peripheral));
        SimDevice {
            inner: peripheral,
            adv_tx: self.adv_tx.clone(),
        }
    }

    /// Whether a scan is currently running.
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HeartRateCentral for SimRadio {
    async fn start_scan(&self) -> Result<(), BleError> {
        self.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn advertisements(&self) -> broadcast::Receiver<Advertisement> {
        self.adv_tx.subscribe()
    }

    async fn peripheral(&self, id: &DeviceId) -> Result<Arc<dyn HeartRatePeripheral>, BleError> {
        let devices = self.devices.lock().await;
        devices
            .get(id)
            .cloned()
            .map(|p| p as Arc<dyn HeartRatePeripheral>)
            .ok_or_else(|| BleError::UnknownDevice(id.to_string()))
    }
}

/// Test-facing handle to a simulated peripheral.
#[derive(Clone)]
pub struct SimDevice {
    inner: Arc<SimPeripheral>,
    adv_tx: broadcast::Sender<Advertisement>,
}

impl SimDevice {
    /// The peripheral's identifier.
    pub fn id(&self) -> DeviceId {
        self.inner.id.clone()
    }

    /// Broadcast one advertisement frame with the current name and RSSI.
    pub fn advertise(&self) {
        let adv = Advertisement {
            id: self.inner.id.clone(),
            local_name: Some(self.inner.name.clone()),
            rssi: Some(*self.inner.rssi.lock().unwrap()),
        };
        let _ = self.adv_tx.send(adv);
    }

    /// Change the advertised signal strength.
    pub fn set_rssi(&self, rssi: i16) {
        *self.inner.rssi.lock().unwrap() = rssi;
    }

    /// Set the simulated link-establishment latency applied to `connect()`.
    /// Uses tokio virtual time — paused clocks advance instantly in tests.
    pub fn set_connect_latency(&self, latency: Duration) {
        *self.inner.connect_latency.lock().unwrap() = latency;
    }

    /// Make subsequent `connect()` calls fail with the given reason, or
    /// succeed again when `None`.
    pub fn set_connect_failure(&self, reason: Option<&str>) {
        *self.inner.connect_failure.lock().unwrap() = reason.map(str::to_string);
    }

    /// Push one heart-rate reading to the connected central.
    pub fn push_bpm(&self, bpm: u16) {
        self.push_measurement(encode_heart_rate(bpm));
    }

    /// Push a raw measurement payload to the connected central.
    pub fn push_measurement(&self, payload: Vec<u8>) {
        if self.inner.connected.load(Ordering::SeqCst) {
            let _ = self.inner.notify_tx.send(payload);
        }
    }

    /// Drop the link from the peripheral side (radio loss, power-off).
    pub fn drop_link(&self, reason: &str) {
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            let _ = self.inner.state_tx.send(TransportState::Disconnected {
                reason: Some(reason.to_string()),
            });
        }
    }

    /// Whether a central currently holds the link.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

struct SimPeripheral {
    id: DeviceId,
    name: String,
    rssi: StdMutex<i16>,
    state_tx: broadcast::Sender<TransportState>,
    notify_tx: broadcast::Sender<Vec<u8>>,
    connected: AtomicBool,
    connect_latency: StdMutex<Duration>,
    connect_failure: StdMutex<Option<String>>,
}

#[async_trait]
impl HeartRatePeripheral for SimPeripheral {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn name(&self) -> Option<String> {
        Some(self.name.clone())
    }

    fn states(&self) -> broadcast::Receiver<TransportState> {
        self.state_tx.subscribe()
    }

    async fn connect(&self) -> Result<(), BleError> {
        // Replay the idle state first, like transports that echo their
        // current (disconnected, no status) state before any real attempt.
        let _ = self
            .state_tx
            .send(TransportState::Disconnected { reason: None });
        let _ = self.state_tx.send(TransportState::Connecting);

        let latency = *self.connect_latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let failure = self.connect_failure.lock().unwrap().clone();
        if let Some(reason) = failure {
            let _ = self.state_tx.send(TransportState::Disconnected {
                reason: Some(reason.clone()),
            });
            return Err(BleError::ConnectionError(reason));
        }

        self.connected.store(true, Ordering::SeqCst);
        let _ = self.state_tx.send(TransportState::Connected);
        Ok(())
    }

    async fn notifications(&self) -> Result<broadcast::Receiver<Vec<u8>>, BleError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BleError::Disconnected);
        }
        Ok(self.notify_tx.subscribe())
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.state_tx.send(TransportState::Disconnecting);
            let _ = self.state_tx.send(TransportState::Disconnected {
                reason: Some("disconnected by host".to_string()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_advertisement_broadcast() {
        let radio = SimRadio::new();
        let device = radio.add_device("Strap", -48).await;

        let mut rx = radio.advertisements();
        device.advertise();

        let adv = rx.recv().await.unwrap();
        assert_eq!(adv.id, device.id());
        assert_eq!(adv.local_name.as_deref(), Some("Strap"));
        assert_eq!(adv.rssi, Some(-48));
    }

    #[tokio::test]
    async fn test_rssi_refresh() {
        let radio = SimRadio::new();
        let device = radio.add_device("Strap", -48).await;
        let mut rx = radio.advertisements();

        device.advertise();
        device.set_rssi(-70);
        device.advertise();

        assert_eq!(rx.recv().await.unwrap().rssi, Some(-48));
        assert_eq!(rx.recv().await.unwrap().rssi, Some(-70));
    }

    #[tokio::test]
    async fn test_connect_emits_state_sequence() {
        let radio = SimRadio::new();
        let device = radio.add_device("Strap", -48).await;
        let peripheral = radio.peripheral(&device.id()).await.unwrap();

        let mut states = peripheral.states();
        peripheral.connect().await.unwrap();
        assert!(device.is_connected());

        assert_eq!(
            states.recv().await.unwrap(),
            TransportState::Disconnected { reason: None }
        );
        assert_eq!(states.recv().await.unwrap(), TransportState::Connecting);
        assert_eq!(states.recv().await.unwrap(), TransportState::Connected);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let radio = SimRadio::new();
        let device = radio.add_device("Strap", -48).await;
        device.set_connect_failure(Some("out of range"));

        let peripheral = radio.peripheral(&device.id()).await.unwrap();
        let result = peripheral.connect().await;
        assert!(matches!(result, Err(BleError::ConnectionError(_))));
        assert!(!device.is_connected());
    }

    #[tokio::test]
    async fn test_notifications_require_link() {
        let radio = SimRadio::new();
        let device = radio.add_device("Strap", -48).await;
        let peripheral = radio.peripheral(&device.id()).await.unwrap();

        assert!(matches!(
            peripheral.notifications().await,
            Err(BleError::Disconnected)
        ));

        peripheral.connect().await.unwrap();
        let mut notes = peripheral.notifications().await.unwrap();

        device.push_bpm(72);
        assert_eq!(notes.recv().await.unwrap(), vec![0x00, 72]);
    }

    #[tokio::test]
    async fn test_drop_link_reports_reason() {
        let radio = SimRadio::new();
        let device = radio.add_device("Strap", -48).await;
        let peripheral = radio.peripheral(&device.id()).await.unwrap();

        peripheral.connect().await.unwrap();
        let mut states = peripheral.states();

        device.drop_link("battery died");
        assert_eq!(
            states.recv().await.unwrap(),
            TransportState::Disconnected {
                reason: Some("battery died".to_string())
            }
        );
        assert!(!device.is_connected());
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let radio = SimRadio::new();
        let missing = DeviceId::Simulated(Uuid::new_v4());
        assert!(matches!(
            radio.peripheral(&missing).await,
            Err(BleError::UnknownDevice(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_latency_uses_virtual_time() {
        let radio = SimRadio::new();
        let device = radio.add_device("Strap", -48).await;
        device.set_connect_latency(Duration::from_secs(2));

        let peripheral = radio.peripheral(&device.id()).await.unwrap();
        let before = tokio::time::Instant::now();
        peripheral.connect().await.unwrap();
        assert!(before.elapsed() >= Duration::from_secs(2));
    }
}
