//! Telemetry hub: the single broadcast point
//!
//! Holds the latest connection state and heart-rate sample and fans every
//! change out to all subscribed consumers (recorder, webhook dispatcher,
//! network publishers). Single-writer: only the device monitor mutates it.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Connection lifecycle state, as observed by every consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    AutoReconnecting,
    Connected { device: String },
    Disconnecting,
    Disconnected { reason: String },
    ScanFailed { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    /// Human-readable status text, used by front ends and the WebSocket
    /// `status` field.
    pub fn status_line(&self) -> String {
        match self {
            ConnectionState::Idle => "idle".to_string(),
            ConnectionState::Scanning => "scanning for devices".to_string(),
            ConnectionState::Connecting => "connecting".to_string(),
            ConnectionState::AutoReconnecting => "reconnecting".to_string(),
            ConnectionState::Connected { device } => format!("connected to {}", device),
            ConnectionState::Disconnecting => "disconnecting".to_string(),
            ConnectionState::Disconnected { reason } => format!("disconnected: {}", reason),
            ConnectionState::ScanFailed { reason } => format!("scan failed: {}", reason),
        }
    }
}

/// One decoded heart-rate reading. A BPM of 0 means "no signal".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartRateSample {
    pub timestamp: DateTime<Utc>,
    pub bpm: u16,
}

impl HeartRateSample {
    pub fn new(bpm: u16) -> Self {
        Self {
            timestamp: Utc::now(),
            bpm,
        }
    }

    /// The "no signal" sample.
    pub fn none() -> Self {
        Self::new(0)
    }
}

/// Event kinds that webhook rules can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Connected,
    Disconnected,
    HeartRateUpdated,
}

/// A single hub update, delivered to subscribers in emission order.
#[derive(Debug, Clone)]
pub enum HubEvent {
    State(ConnectionState),
    HeartRate(HeartRateSample),
}

/// A trigger firing, consumed by the webhook dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct TriggerEvent {
    pub trigger: Trigger,
    pub bpm: u16,
}

/// The hub itself. Construct once, share via `Arc`.
pub struct TelemetryHub {
    current: Mutex<(ConnectionState, HeartRateSample)>,
    events: broadcast::Sender<HubEvent>,
    triggers: broadcast::Sender<TriggerEvent>,
}

impl TelemetryHub {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let (triggers, _) = broadcast::channel(64);
        Arc::new(Self {
            current: Mutex::new((ConnectionState::Idle, HeartRateSample::none())),
            events,
            triggers,
        })
    }

    /// Latest state and sample.
    pub fn snapshot(&self) -> (ConnectionState, HeartRateSample) {
        self.current.lock().unwrap().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.current.lock().unwrap().0.clone()
    }

    pub fn heart_rate(&self) -> HeartRateSample {
        self.current.lock().unwrap().1.clone()
    }

    /// Subscribe to updates. Returns the current snapshot plus a receiver
    /// for every subsequent event; the snapshot and the receiver are taken
    /// under the same lock, so no update can fall between them.
    pub fn subscribe(&self) -> ((ConnectionState, HeartRateSample), broadcast::Receiver<HubEvent>) {
        let current = self.current.lock().unwrap();
        (current.clone(), self.events.subscribe())
    }

    /// Subscribe to trigger firings.
    pub fn triggers(&self) -> broadcast::Receiver<TriggerEvent> {
        self.triggers.subscribe()
    }

    /// Publish a connection-state change. Consecutive duplicates are
    /// suppressed. Leaving `Connected` zeroes the heart-rate value; entering
    /// `Connected` or `Disconnected` raises the matching trigger.
    pub fn set_state(&self, next: ConnectionState) {
        let mut current = self.current.lock().unwrap();
        if current.0 == next {
            return;
        }
        let was_connected = current.0.is_connected();
        current.0 = next.clone();
        let _ = self.events.send(HubEvent::State(next.clone()));

        if was_connected && !next.is_connected() && current.1.bpm != 0 {
            current.1 = HeartRateSample::none();
            let _ = self.events.send(HubEvent::HeartRate(current.1.clone()));
        }

        match next {
            ConnectionState::Connected { .. } => {
                let _ = self.triggers.send(TriggerEvent {
                    trigger: Trigger::Connected,
                    bpm: 0,
                });
            }
            ConnectionState::Disconnected { .. } => {
                let _ = self.triggers.send(TriggerEvent {
                    trigger: Trigger::Disconnected,
                    bpm: 0,
                });
            }
            _ => {}
        }
    }

    /// Publish a heart-rate reading. Ignored unless currently `Connected`
    /// (samples decoded after a disconnect was detected must not reach
    /// consumers) and when the value is unchanged.
    pub fn update_heart_rate(&self, bpm: u16) {
        let mut current = self.current.lock().unwrap();
        if !current.0.is_connected() {
            return;
        }
        if current.1.bpm == bpm {
            return;
        }
        current.1 = HeartRateSample::new(bpm);
        let _ = self.events.send(HubEvent::HeartRate(current.1.clone()));
        let _ = self.triggers.send(TriggerEvent {
            trigger: Trigger::HeartRateUpdated,
            bpm,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> ConnectionState {
        ConnectionState::Connected {
            device: "Strap".to_string(),
        }
    }

    #[tokio::test]
    async fn test_subscribe_returns_snapshot_then_updates() {
        let hub = TelemetryHub::new();
        hub.set_state(ConnectionState::Scanning);

        let ((state, sample), mut rx) = hub.subscribe();
        assert_eq!(state, ConnectionState::Scanning);
        assert_eq!(sample.bpm, 0);

        hub.set_state(ConnectionState::Connecting);
        match rx.recv().await.unwrap() {
            HubEvent::State(s) => assert_eq!(s, ConnectionState::Connecting),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_events_delivered_in_emission_order() {
        let hub = TelemetryHub::new();
        let (_, mut rx) = hub.subscribe();

        hub.set_state(ConnectionState::Connecting);
        hub.set_state(connected());
        hub.update_heart_rate(72);
        hub.update_heart_rate(75);

        let mut observed = Vec::new();
        for _ in 0..4 {
            observed.push(rx.recv().await.unwrap());
        }
        assert!(matches!(&observed[0], HubEvent::State(ConnectionState::Connecting)));
        assert!(matches!(&observed[1], HubEvent::State(ConnectionState::Connected { .. })));
        assert!(matches!(&observed[2], HubEvent::HeartRate(s) if s.bpm == 72));
        assert!(matches!(&observed[3], HubEvent::HeartRate(s) if s.bpm == 75));
    }

    #[tokio::test]
    async fn test_duplicate_state_suppressed() {
        let hub = TelemetryHub::new();
        let (_, mut rx) = hub.subscribe();

        hub.set_state(ConnectionState::Connecting);
        hub.set_state(ConnectionState::Connecting);
        hub.set_state(connected());

        assert!(matches!(
            rx.recv().await.unwrap(),
            HubEvent::State(ConnectionState::Connecting)
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            HubEvent::State(ConnectionState::Connected { .. })
        ));
    }

    #[tokio::test]
    async fn test_samples_dropped_unless_connected() {
        let hub = TelemetryHub::new();
        hub.update_heart_rate(72);
        assert_eq!(hub.heart_rate().bpm, 0);

        hub.set_state(connected());
        hub.update_heart_rate(72);
        assert_eq!(hub.heart_rate().bpm, 72);

        hub.set_state(ConnectionState::Disconnected {
            reason: "link lost".to_string(),
        });
        hub.update_heart_rate(80);
        assert_eq!(hub.heart_rate().bpm, 0, "post-disconnect sample must be dropped");
    }

    #[tokio::test]
    async fn test_unchanged_bpm_deduplicated() {
        let hub = TelemetryHub::new();
        hub.set_state(connected());
        let mut triggers = hub.triggers();

        hub.update_heart_rate(72);
        hub.update_heart_rate(72);
        hub.update_heart_rate(73);

        assert_eq!(triggers.recv().await.unwrap().bpm, 72);
        assert_eq!(triggers.recv().await.unwrap().bpm, 73);
    }

    #[tokio::test]
    async fn test_bpm_zeroed_when_leaving_connected() {
        let hub = TelemetryHub::new();
        hub.set_state(connected());
        hub.update_heart_rate(72);

        let (_, mut rx) = hub.subscribe();
        hub.set_state(ConnectionState::Disconnected {
            reason: "link lost".to_string(),
        });

        assert!(matches!(
            rx.recv().await.unwrap(),
            HubEvent::State(ConnectionState::Disconnected { .. })
        ));
        assert!(matches!(rx.recv().await.unwrap(), HubEvent::HeartRate(s) if s.bpm == 0));
        assert_eq!(hub.heart_rate().bpm, 0);
    }

    #[tokio::test]
    async fn test_connection_triggers_raised() {
        let hub = TelemetryHub::new();
        let mut triggers = hub.triggers();

        hub.set_state(connected());
        hub.update_heart_rate(68);
        hub.set_state(ConnectionState::Disconnected {
            reason: "done".to_string(),
        });

        assert_eq!(triggers.recv().await.unwrap().trigger, Trigger::Connected);
        let hr = triggers.recv().await.unwrap();
        assert_eq!(hr.trigger, Trigger::HeartRateUpdated);
        assert_eq!(hr.bpm, 68);
        assert_eq!(triggers.recv().await.unwrap().trigger, Trigger::Disconnected);
    }

    #[tokio::test]
    async fn test_scan_states_do_not_fire_triggers() {
        let hub = TelemetryHub::new();
        let mut triggers = hub.triggers();

        hub.set_state(ConnectionState::Scanning);
        hub.set_state(ConnectionState::ScanFailed {
            reason: "no devices found".to_string(),
        });
        hub.set_state(connected());

        // The first trigger observed is the Connected one.
        assert_eq!(triggers.recv().await.unwrap().trigger, Trigger::Connected);
    }

    #[test]
    fn test_trigger_serde_names() {
        assert_eq!(
            serde_json::to_string(&Trigger::HeartRateUpdated).unwrap(),
            "\"heart_rate_updated\""
        );
        assert_eq!(serde_json::to_string(&Trigger::Connected).unwrap(), "\"connected\"");
        assert_eq!(
            serde_json::from_str::<Trigger>("\"disconnected\"").unwrap(),
            Trigger::Disconnected
        );
    }
}
