//! Device monitor: scan coordination, connection lifecycle, auto-reconnect
//!
//! Owns the radio: runs time-bounded discovery, supervises at most one
//! connection attempt at a time, decodes measurement payloads into the
//! telemetry hub, and re-chases the last device after unexpected drops.
//!
//! Attempt tasks are cancelled cooperatively: each task runs its work under
//! a `tokio::select!` against a cancel channel and its cleanup tail sits
//! after the select, so teardown (transport release, terminal state,
//! bookkeeping) runs on every exit path. Callers await the task handle, so
//! starting a new attempt never overlaps the previous one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::ble::codec::decode_heart_rate;
use crate::ble::transport::{
    Advertisement, DeviceId, HeartRateCentral, HeartRatePeripheral, TransportState,
};
use crate::ble::BleError;
use crate::config::SettingsStore;
use crate::hub::{ConnectionState, TelemetryHub};

/// Upper bound on establishing a link.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Pause before chasing a device that may still be out of range.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// A cancellable background task (scan or connection attempt).
struct AttemptTask {
    cancel: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl AttemptTask {
    /// Signal cancellation and wait for the task's cleanup to finish.
    async fn cancel_and_wait(self) {
        let _ = self.cancel.send(());
        let _ = self.handle.await;
    }

    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[derive(Default)]
struct Tasks {
    scan: Option<AttemptTask>,
    connection: Option<AttemptTask>,
}

/// Internal work requests handled by the supervisor loop, so that a task's
/// cleanup tail never has to cancel-and-await itself.
enum Action {
    Connect(DeviceId),
    Reconnect(DeviceId),
}

/// How a connection attempt ended.
enum AttemptEnd {
    /// Ran to its own end: `Ok(reason)` is the transport-reported disconnect
    /// reason, `Err` a connect failure or timeout.
    Finished(Result<String, BleError>),
    /// Cancelled by a newer scan/connect request or an explicit disconnect.
    Superseded,
}

struct ScanOutcome {
    matched: bool,
    any_found: bool,
}

pub struct DeviceMonitor {
    central: Arc<dyn HeartRateCentral>,
    hub: Arc<TelemetryHub>,
    settings: Arc<SettingsStore>,
    /// Single-flight guard for discovery.
    scanning: AtomicBool,
    /// Set before an explicit disconnect; suppresses auto-reconnect and
    /// selects the disconnect reason text.
    manual_disconnect: AtomicBool,
    /// The peripheral of the in-flight attempt, released by its cleanup.
    current: StdMutex<Option<Arc<dyn HeartRatePeripheral>>>,
    last_device: StdMutex<Option<DeviceId>>,
    tasks: Mutex<Tasks>,
    scan_results: watch::Sender<Vec<Advertisement>>,
    actions_tx: mpsc::Sender<Action>,
    shutdown_tx: broadcast::Sender<()>,
}

impl DeviceMonitor {
    pub fn new(
        central: Arc<dyn HeartRateCentral>,
        hub: Arc<TelemetryHub>,
        settings: Arc<SettingsStore>,
    ) -> Arc<Self> {
        let (actions_tx, actions_rx) = mpsc::channel(16);
        let (shutdown_tx, _) = broadcast::channel(1);
        let (scan_results, _) = watch::channel(Vec::new());

        let monitor = Arc::new(Self {
            central,
            hub,
            settings,
            scanning: AtomicBool::new(false),
            manual_disconnect: AtomicBool::new(false),
            current: StdMutex::new(None),
            last_device: StdMutex::new(None),
            tasks: Mutex::new(Tasks::default()),
            scan_results,
            actions_tx,
            shutdown_tx,
        });

        let supervisor = Arc::clone(&monitor);
        let shutdown_rx = monitor.shutdown_tx.subscribe();
        tokio::spawn(async move {
            supervisor.supervise(actions_rx, shutdown_rx).await;
        });

        monitor
    }

    pub fn hub(&self) -> &Arc<TelemetryHub> {
        &self.hub
    }

    /// The deduplicated advertisement set of the most recent scan.
    pub fn scan_results(&self) -> watch::Receiver<Vec<Advertisement>> {
        self.scan_results.subscribe()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    pub fn last_device(&self) -> Option<DeviceId> {
        self.last_device.lock().unwrap().clone()
    }

    /// Stop the supervisor and any in-flight scan or attempt.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.manual_disconnect.store(true, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().await;
        if let Some(scan) = tasks.scan.take() {
            scan.cancel_and_wait().await;
        }
        if let Some(connection) = tasks.connection.take() {
            connection.cancel_and_wait().await;
        }
    }

    // ------------------------------------------------------------------
    // Scan coordination
    // ------------------------------------------------------------------

    /// Run a time-bounded device discovery. Returns `false` (no-op) while a
    /// scan is already active. Cancels any in-flight connection attempt.
    pub async fn start_scan(self: &Arc<Self>) -> bool {
        self.begin_scan(None).await
    }

    /// Scan for one device and connect to it on sight. The scan terminates
    /// early when the target appears; on timeout it reports a scan failure.
    pub async fn start_targeted_scan(self: &Arc<Self>, target: DeviceId) -> bool {
        self.begin_scan(Some(target)).await
    }

    async fn begin_scan(self: &Arc<Self>, target: Option<DeviceId>) -> bool {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let mut tasks = self.tasks.lock().await;
        if let Some(connection) = tasks.connection.take() {
            connection.cancel_and_wait().await;
        }
        // The scanning flag was clear, so any previous scan task is done or
        // in its final instructions; awaiting it keeps its last state
        // emission ahead of ours.
        if let Some(stale) = tasks.scan.take() {
            stale.cancel_and_wait().await;
        }

        let (cancel_tx, cancel_rx) = broadcast::channel(1);
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            monitor.run_scan(target, cancel_rx).await;
        });
        tasks.scan = Some(AttemptTask {
            cancel: cancel_tx,
            handle,
        });
        true
    }

    async fn run_scan(self: Arc<Self>, target: Option<DeviceId>, mut cancel: broadcast::Receiver<()>) {
        let announced = if target.is_some() {
            ConnectionState::AutoReconnecting
        } else {
            ConnectionState::Scanning
        };
        self.hub.set_state(announced);

        let duration = self.settings.get().scan_timeout();
        let outcome = tokio::select! {
            _ = cancel.recv() => None,
            result = self.collect_advertisements(target.as_ref(), duration) => Some(result),
        };

        // Teardown runs on every exit path.
        if let Err(e) = self.central.stop_scan().await {
            log::warn!("Error stopping scan: {}", e);
        }

        match outcome {
            None => {
                // Superseded by a newer request; the successor announces its
                // own state.
                self.scan_results.send_replace(Vec::new());
            }
            Some(Ok(ScanOutcome { matched: true, .. })) => {
                if let Some(target) = target {
                    log::info!("Scan matched {}, connecting", target);
                    if self.actions_tx.try_send(Action::Connect(target)).is_err() {
                        log::warn!("Monitor supervisor unavailable, dropping connect request");
                    }
                }
            }
            Some(Ok(ScanOutcome {
                matched: false,
                any_found,
            })) => {
                let reason = if target.is_some() {
                    "auto-connect failed: device not found".to_string()
                } else if any_found {
                    "scan complete".to_string()
                } else {
                    "no devices found".to_string()
                };
                self.hub.set_state(ConnectionState::ScanFailed { reason });
            }
            Some(Err(e)) => {
                log::warn!("Scan failed: {}", e);
                self.hub.set_state(ConnectionState::ScanFailed {
                    reason: e.to_string(),
                });
            }
        }

        self.scanning.store(false, Ordering::SeqCst);
    }

    /// Collect advertisements for up to `duration`, deduplicating by device
    /// identifier: first sighting fixes the ordering, later sightings
    /// refresh signal strength and name. Ends early when `target` appears.
    async fn collect_advertisements(
        &self,
        target: Option<&DeviceId>,
        duration: Duration,
    ) -> Result<ScanOutcome, BleError> {
        self.central.start_scan().await?;
        let mut adv_rx = self.central.advertisements();
        let mut found: Vec<Advertisement> = Vec::new();

        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Ok(ScanOutcome { matched: false, any_found: !found.is_empty() });
                }
                adv = adv_rx.recv() => match adv {
                    Ok(adv) => {
                        if let Some(existing) = found.iter_mut().find(|a| a.id == adv.id) {
                            existing.rssi = adv.rssi;
                            if adv.local_name.is_some() {
                                existing.local_name = adv.local_name.clone();
                            }
                        } else {
                            found.push(adv.clone());
                        }
                        self.scan_results.send_replace(found.clone());

                        if target == Some(&adv.id) {
                            return Ok(ScanOutcome { matched: true, any_found: true });
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::debug!("Advertisement stream lagged, skipped {}", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Ok(ScanOutcome { matched: false, any_found: !found.is_empty() });
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Connect to a device. Cancels any in-flight scan or attempt first and
    /// awaits its teardown, so no two attempts' events can interleave.
    pub async fn connect(self: &Arc<Self>, id: DeviceId) {
        let mut tasks = self.tasks.lock().await;
        if let Some(scan) = tasks.scan.take() {
            scan.cancel_and_wait().await;
        }
        if let Some(connection) = tasks.connection.take() {
            connection.cancel_and_wait().await;
        }
        self.scan_results.send_replace(Vec::new());

        self.manual_disconnect.store(false, Ordering::SeqCst);
        *self.last_device.lock().unwrap() = Some(id.clone());

        let (cancel_tx, cancel_rx) = broadcast::channel(1);
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            monitor.run_attempt(id, cancel_rx).await;
        });
        tasks.connection = Some(AttemptTask {
            cancel: cancel_tx,
            handle,
        });
    }

    /// Explicitly disconnect. Sets the manual flag before cancelling, so the
    /// attempt's cleanup picks the manual reason and skips auto-reconnect.
    pub async fn disconnect(&self) {
        self.manual_disconnect.store(true, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().await;
        if let Some(scan) = tasks.scan.take() {
            scan.cancel_and_wait().await;
        }
        if let Some(connection) = tasks.connection.take() {
            connection.cancel_and_wait().await;
        }
        self.scan_results.send_replace(Vec::new());
    }

    async fn run_attempt(self: Arc<Self>, id: DeviceId, mut cancel: broadcast::Receiver<()>) {
        self.hub.set_state(ConnectionState::Connecting);

        let end = tokio::select! {
            result = self.drive_connection(&id) => AttemptEnd::Finished(result),
            _ = cancel.recv() => AttemptEnd::Superseded,
        };

        // Cleanup tail. The task is never aborted, so this runs on every
        // exit path, cancellation and timeout included.
        let peripheral = self.current.lock().unwrap().take();
        if let Some(peripheral) = peripheral {
            if let Err(e) = peripheral.disconnect().await {
                log::warn!("Error releasing link to {}: {}", id, e);
            }
        }

        if let AttemptEnd::Finished(Err(e)) = &end {
            log::warn!("Connection to {} ended: {}", id, e);
        }

        let manual = self.manual_disconnect.load(Ordering::SeqCst);
        let reason = if manual {
            "manually disconnected".to_string()
        } else {
            match &end {
                AttemptEnd::Finished(Ok(r)) => format!("connection lost: {}", r),
                AttemptEnd::Finished(Err(BleError::Timeout)) => "connect timed out".to_string(),
                AttemptEnd::Finished(Err(e)) => format!("connection failed: {}", e),
                AttemptEnd::Superseded => "connection cancelled".to_string(),
            }
        };
        self.hub.set_state(ConnectionState::Disconnected { reason });

        // One reconnect cycle per attempt that ended on its own. Superseded
        // attempts have a successor already in charge.
        if !manual
            && matches!(end, AttemptEnd::Finished(_))
            && self.settings.get().auto_reconnect_enabled
        {
            let last = self.last_device.lock().unwrap().clone();
            if let Some(last) = last {
                if self.actions_tx.try_send(Action::Reconnect(last)).is_err() {
                    log::warn!("Monitor supervisor unavailable, dropping reconnect request");
                }
            }
        }
    }

    async fn drive_connection(&self, id: &DeviceId) -> Result<String, BleError> {
        let peripheral = self.central.peripheral(id).await?;
        *self.current.lock().unwrap() = Some(Arc::clone(&peripheral));

        // Subscribe before connecting so no transition is missed.
        let mut states = peripheral.states();

        tokio::time::timeout(CONNECT_TIMEOUT, peripheral.connect())
            .await
            .map_err(|_| BleError::Timeout)??;

        let device_label = peripheral.name().unwrap_or_else(|| id.to_string());
        let mut notifications: Option<broadcast::Receiver<Vec<u8>>> = None;

        loop {
            tokio::select! {
                state = states.recv() => match state {
                    // Transports replay an idle "disconnected, no status"
                    // frame before any real attempt; only genuine changes
                    // are forwarded.
                    Ok(state) if !state.is_real_change() => {}
                    Ok(TransportState::Connecting) => {
                        self.hub.set_state(ConnectionState::Connecting);
                    }
                    Ok(TransportState::Connected) => {
                        self.hub.set_state(ConnectionState::Connected {
                            device: device_label.clone(),
                        });
                        if notifications.is_none() {
                            notifications = Some(peripheral.notifications().await?);
                        }
                    }
                    Ok(TransportState::Disconnecting) => {
                        self.hub.set_state(ConnectionState::Disconnecting);
                    }
                    Ok(TransportState::Disconnected { reason }) => {
                        return Ok(reason.unwrap_or_else(|| "link lost".to_string()));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::debug!("State stream lagged, skipped {}", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Ok("transport closed".to_string());
                    }
                },
                payload = Self::recv_notification(&mut notifications), if notifications.is_some() => {
                    match payload {
                        Some(bytes) => {
                            self.hub.update_heart_rate(decode_heart_rate(&bytes));
                        }
                        // Stream ended; the state stream reports the
                        // disconnect that caused it.
                        None => notifications = None,
                    }
                }
            }
        }
    }

    async fn recv_notification(rx: &mut Option<broadcast::Receiver<Vec<u8>>>) -> Option<Vec<u8>> {
        match rx.as_mut() {
            Some(rx) => loop {
                match rx.recv().await {
                    Ok(bytes) => return Some(bytes),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::debug!("Notification stream lagged, skipped {}", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            None => std::future::pending().await,
        }
    }

    // ------------------------------------------------------------------
    // Supervisor
    // ------------------------------------------------------------------

    async fn supervise(
        self: Arc<Self>,
        mut actions: mpsc::Receiver<Action>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                action = actions.recv() => match action {
                    Some(Action::Connect(id)) => self.connect(id).await,
                    Some(Action::Reconnect(id)) => self.try_reconnect(id).await,
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }
    }

    async fn try_reconnect(self: &Arc<Self>, id: DeviceId) {
        tokio::time::sleep(RECONNECT_DELAY).await;

        // Stand down if the user acted in the meantime.
        if self.manual_disconnect.load(Ordering::SeqCst) || self.scanning.load(Ordering::SeqCst) {
            return;
        }
        {
            let tasks = self.tasks.lock().await;
            if tasks.connection.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
                return;
            }
        }

        log::info!("Auto-reconnecting to {}", id);
        self.start_targeted_scan(id).await;
    }
}
