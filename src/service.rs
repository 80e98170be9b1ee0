//! Service wiring
//!
//! Assembles the telemetry hub, device monitor, history recorder, webhook
//! dispatcher, and network publishers, and keeps the publishers reconciled
//! with the settings. This is the process-level entry point front ends talk
//! to; it only exposes start/stop/subscribe.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};

use crate::ble::transport::HeartRateCentral;
use crate::config::SettingsStore;
use crate::history::{HistoryError, HistoryStore};
use crate::hub::{ConnectionState, HubEvent, TelemetryHub};
use crate::monitor::DeviceMonitor;
use crate::server::{http, ws, ServerHandle};
use crate::webhook::{WebhookDispatcher, WebhookError, WebhookStore};

#[derive(Default)]
struct Publishers {
    http: Option<ServerHandle>,
    websocket: Option<ServerHandle>,
}

pub struct MonitorService {
    hub: Arc<TelemetryHub>,
    monitor: Arc<DeviceMonitor>,
    settings: Arc<SettingsStore>,
    history: Arc<HistoryStore>,
    dispatcher: Arc<WebhookDispatcher>,
    publishers: Mutex<Publishers>,
    shutdown_tx: broadcast::Sender<()>,
}

impl MonitorService {
    pub fn new(
        central: Arc<dyn HeartRateCentral>,
        settings: Arc<SettingsStore>,
        history: Arc<HistoryStore>,
        webhooks: Arc<WebhookStore>,
    ) -> Result<Arc<Self>, WebhookError> {
        let hub = TelemetryHub::new();
        let monitor = DeviceMonitor::new(central, Arc::clone(&hub), Arc::clone(&settings));
        let dispatcher = Arc::new(WebhookDispatcher::new(webhooks)?);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Arc::new(Self {
            hub,
            monitor,
            settings,
            history,
            dispatcher,
            publishers: Mutex::new(Publishers::default()),
            shutdown_tx,
        }))
    }

    pub fn hub(&self) -> &Arc<TelemetryHub> {
        &self.hub
    }

    pub fn monitor(&self) -> &Arc<DeviceMonitor> {
        &self.monitor
    }

    pub fn dispatcher(&self) -> &Arc<WebhookDispatcher> {
        &self.dispatcher
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    /// Spawn the consumer loops, bring the publishers up per the current
    /// settings, and kick off the startup auto-connect scan if configured.
    pub async fn start(self: &Arc<Self>) {
        self.spawn_trigger_loop();
        self.spawn_recorder_loop();
        self.reconcile_publishers().await;
        self.spawn_settings_watcher();

        let settings = self.settings.get();
        if settings.auto_connect_enabled {
            if let Some(favorite) = settings.favorite_device {
                log::info!("Auto-connecting to favorite device {}", favorite);
                self.monitor.start_targeted_scan(favorite).await;
            }
        }
    }

    /// Stop everything: consumer loops, the monitor, and the publishers.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        self.monitor.shutdown().await;

        let mut publishers = self.publishers.lock().await;
        if let Some(handle) = publishers.http.take() {
            handle.stop().await;
        }
        if let Some(handle) = publishers.websocket.take() {
            handle.stop().await;
        }
    }

    /// Hub triggers -> webhook dispatcher.
    fn spawn_trigger_loop(self: &Arc<Self>) {
        let service = Arc::clone(self);
        let mut triggers = self.hub.triggers();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = triggers.recv() => match event {
                        Ok(event) => service.dispatcher.fire(event.trigger, event.bpm),
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    /// Hub events -> history store. A session opens on `Connected` when
    /// recording is enabled and always gets an end time once the disconnect
    /// cleanup runs, service shutdown included.
    fn spawn_recorder_loop(self: &Arc<Self>) {
        let service = Arc::clone(self);
        let (_, mut events) = self.hub.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut open_session: Option<i64> = None;
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(HubEvent::State(state)) => {
                            service.record_state(&mut open_session, state);
                        }
                        Ok(HubEvent::HeartRate(sample)) => {
                            if sample.bpm == 0 {
                                continue;
                            }
                            let Some(session_id) = open_session else {
                                continue;
                            };
                            match service.history.insert_record(
                                session_id,
                                sample.timestamp,
                                sample.bpm,
                            ) {
                                Ok(()) => {}
                                Err(HistoryError::SessionNotFound(_)) => {
                                    // Session deleted underneath us: stop
                                    // recording for it, leave the
                                    // connection alone.
                                    log::warn!(
                                        "Session {} vanished, disabling recording for it",
                                        session_id
                                    );
                                    open_session = None;
                                }
                                Err(e) => {
                                    log::error!("Failed to record heart rate: {}", e);
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            log::warn!("Recorder lagged, skipped {} events", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
            // Never leave a session open.
            if let Some(session_id) = open_session.take() {
                if let Err(e) = service.history.end_session(session_id, Utc::now()) {
                    log::error!("Failed to close session {}: {}", session_id, e);
                }
            }
        });
    }

    fn record_state(&self, open_session: &mut Option<i64>, state: ConnectionState) {
        match state {
            ConnectionState::Connected { device } => {
                if !self.settings.get().history_recording_enabled {
                    return;
                }
                match self.history.insert_session(&device, Utc::now()) {
                    Ok(id) => *open_session = Some(id),
                    Err(e) => log::error!("Failed to open session: {}", e),
                }
            }
            ConnectionState::Disconnected { .. } => {
                if let Some(id) = open_session.take() {
                    if let Err(e) = self.history.end_session(id, Utc::now()) {
                        log::error!("Failed to close session {}: {}", id, e);
                    }
                }
            }
            _ => {}
        }
    }

    /// Restart/stop publishers whenever their settings change.
    fn spawn_settings_watcher(self: &Arc<Self>) {
        let service = Arc::clone(self);
        let mut settings_rx = self.settings.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = settings_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        service.reconcile_publishers().await;
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    async fn reconcile_publishers(&self) {
        let settings = self.settings.get();
        let mut publishers = self.publishers.lock().await;

        let desired = settings.http;
        let running = publishers.http.as_ref().map(|h| h.port());
        if desired.enabled {
            if running != Some(desired.port) {
                if let Some(handle) = publishers.http.take() {
                    handle.stop().await;
                }
                match http::start(Arc::clone(&self.hub), desired.port) {
                    Ok(handle) => publishers.http = Some(handle),
                    Err(e) => log::error!("HTTP publisher failed to start: {}", e),
                }
            }
        } else if let Some(handle) = publishers.http.take() {
            handle.stop().await;
        }

        let desired = settings.websocket;
        let running = publishers.websocket.as_ref().map(|h| h.port());
        if desired.enabled {
            if running != Some(desired.port) {
                if let Some(handle) = publishers.websocket.take() {
                    handle.stop().await;
                }
                match ws::start(Arc::clone(&self.hub), desired.port) {
                    Ok(handle) => publishers.websocket = Some(handle),
                    Err(e) => log::error!("WebSocket publisher failed to start: {}", e),
                }
            }
        } else if let Some(handle) = publishers.websocket.take() {
            handle.stop().await;
        }
    }

    #[cfg(test)]
    async fn publisher_ports(&self) -> (Option<u16>, Option<u16>) {
        let publishers = self.publishers.lock().await;
        (
            publishers.http.as_ref().map(|h| h.port()),
            publishers.websocket.as_ref().map(|h| h.port()),
        )
    }
}
