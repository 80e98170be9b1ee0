//! btleplug-backed central (feature `ble-central`)
//!
//! Maps the first system Bluetooth adapter onto the radio traits: scan
//! events become [`Advertisement`]s, peripheral connect/notify becomes the
//! measurement payload stream, and adapter disconnect events feed the
//! transport state stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use btleplug::api::{
    Central as _, CentralEvent, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral, PeripheralId};
use futures_util::StreamExt;
use tokio::sync::broadcast;

use super::codec::{HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE};
use super::transport::{
    Advertisement, DeviceId, HeartRateCentral, HeartRatePeripheral, TransportState,
};
use super::BleError;

/// Per-link state senders, keyed by platform peripheral id so adapter-level
/// disconnect events can be routed to the right link.
type LinkMap = Arc<StdMutex<HashMap<PeripheralId, broadcast::Sender<TransportState>>>>;

pub struct BtleCentral {
    adapter: Adapter,
    adv_tx: broadcast::Sender<Advertisement>,
    known: Arc<StdMutex<HashMap<DeviceId, PeripheralId>>>,
    links: LinkMap,
}

impl BtleCentral {
    /// Bind to the first system Bluetooth adapter.
    pub async fn new() -> Result<Arc<Self>, BleError> {
        let manager = Manager::new()
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| BleError::ScanError("no Bluetooth adapter found".to_string()))?;

        let (adv_tx, _) = broadcast::channel(256);
        let central = Arc::new(Self {
            adapter,
            adv_tx,
            known: Arc::new(StdMutex::new(HashMap::new())),
            links: Arc::new(StdMutex::new(HashMap::new())),
        });
        central.spawn_event_loop().await?;
        Ok(central)
    }

    async fn spawn_event_loop(self: &Arc<Self>) -> Result<(), BleError> {
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))?;
        let central = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        central.forward_advertisement(id).await;
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let sender = central.links.lock().unwrap().get(&id).cloned();
                        if let Some(sender) = sender {
                            let _ = sender.send(TransportState::Disconnected {
                                reason: Some("link lost".to_string()),
                            });
                        }
                    }
                    _ => {}
                }
            }
            log::warn!("Adapter event stream ended");
        });
        Ok(())
    }

    async fn forward_advertisement(&self, id: PeripheralId) {
        let Ok(peripheral) = self.adapter.peripheral(&id).await else {
            return;
        };
        let Ok(Some(properties)) = peripheral.properties().await else {
            return;
        };
        let device_id = DeviceId::Address(properties.address.into_inner());
        self.known.lock().unwrap().insert(device_id.clone(), id);
        let _ = self.adv_tx.send(Advertisement {
            id: device_id,
            local_name: properties.local_name,
            rssi: properties.rssi,
        });
    }
}

#[async_trait]
impl HeartRateCentral for BtleCentral {
    async fn start_scan(&self) -> Result<(), BleError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))
    }

    fn advertisements(&self) -> broadcast::Receiver<Advertisement> {
        self.adv_tx.subscribe()
    }

    async fn peripheral(&self, id: &DeviceId) -> Result<Arc<dyn HeartRatePeripheral>, BleError> {
        let platform_id = self
            .known
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| BleError::UnknownDevice(id.to_string()))?;
        let inner = self
            .adapter
            .peripheral(&platform_id)
            .await
            .map_err(|e| BleError::ConnectionError(e.to_string()))?;
        let name = inner
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|p| p.local_name);

        let (state_tx, _) = broadcast::channel(64);
        let (notify_tx, _) = broadcast::channel(64);
        self.links
            .lock()
            .unwrap()
            .insert(platform_id.clone(), state_tx.clone());

        Ok(Arc::new(BtlePeripheral {
            id: id.clone(),
            name,
            inner,
            state_tx,
            notify_tx,
        }))
    }
}

struct BtlePeripheral {
    id: DeviceId,
    name: Option<String>,
    inner: PlatformPeripheral,
    state_tx: broadcast::Sender<TransportState>,
    notify_tx: broadcast::Sender<Vec<u8>>,
}

#[async_trait]
impl HeartRatePeripheral for BtlePeripheral {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn states(&self) -> broadcast::Receiver<TransportState> {
        self.state_tx.subscribe()
    }

    async fn connect(&self) -> Result<(), BleError> {
        let _ = self.state_tx.send(TransportState::Connecting);
        self.inner
            .connect()
            .await
            .map_err(|e| BleError::ConnectionError(e.to_string()))?;
        self.inner
            .discover_services()
            .await
            .map_err(|e| BleError::ConnectionError(e.to_string()))?;

        let characteristic = self
            .inner
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == HEART_RATE_MEASUREMENT && c.service_uuid == HEART_RATE_SERVICE)
            .ok_or_else(|| {
                BleError::NotifyError("device has no Heart Rate Measurement characteristic".into())
            })?;
        self.inner
            .subscribe(&characteristic)
            .await
            .map_err(|e| BleError::NotifyError(e.to_string()))?;

        // Forward measurement notifications for the life of the link; the
        // stream ends when the transport drops.
        let mut notifications = self
            .inner
            .notifications()
            .await
            .map_err(|e| BleError::NotifyError(e.to_string()))?;
        let notify_tx = self.notify_tx.clone();
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == HEART_RATE_MEASUREMENT {
                    let _ = notify_tx.send(notification.value);
                }
            }
        });

        let _ = self.state_tx.send(TransportState::Connected);
        Ok(())
    }

    async fn notifications(&self) -> Result<broadcast::Receiver<Vec<u8>>, BleError> {
        if !self.inner.is_connected().await.unwrap_or(false) {
            return Err(BleError::Disconnected);
        }
        Ok(self.notify_tx.subscribe())
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.inner
            .disconnect()
            .await
            .map_err(|e| BleError::ConnectionError(e.to_string()))?;
        let _ = self.state_tx.send(TransportState::Disconnected {
            reason: Some("disconnected by host".to_string()),
        });
        Ok(())
    }
}
