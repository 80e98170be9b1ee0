// src/bin/heartlink.rs
//! Heart-rate telemetry hub daemon
//!
//! Loads settings, webhook rules, and the session history from a data
//! directory, wires the monitor service to a radio, and runs until Ctrl-C.
//! Built with `--features ble-central` it drives the system Bluetooth
//! adapter; by default it runs a simulated strap so the whole pipeline can
//! be exercised end to end.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use heartlink::config::SettingsStore;
use heartlink::history::HistoryStore;
use heartlink::service::MonitorService;
use heartlink::webhook::WebhookStore;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let data_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./heartlink_data"));
    std::fs::create_dir_all(&data_dir)?;

    let settings = Arc::new(SettingsStore::load(data_dir.join("settings.json"))?);
    let history = Arc::new(HistoryStore::open(&data_dir)?);
    let webhooks = Arc::new(WebhookStore::load(data_dir.join("webhooks.json")));

    let (central, demo_target) = build_central().await?;
    let service = MonitorService::new(central, settings, history, webhooks)?;
    service.start().await;

    // In simulated mode, chase the demo strap so the pipeline has data even
    // with no favorite device configured.
    if let Some(target) = demo_target {
        service.monitor().start_targeted_scan(target).await;
    }

    log::info!("heartlink running, data dir {}", data_dir.display());
    println!("heartlink running (data dir: {})", data_dir.display());
    println!("Press Ctrl+C to stop...");

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    service.stop().await;
    Ok(())
}

type CentralSetup = (
    Arc<dyn heartlink::ble::transport::HeartRateCentral>,
    Option<heartlink::ble::transport::DeviceId>,
);

#[cfg(feature = "ble-central")]
async fn build_central() -> Result<CentralSetup> {
    let central = heartlink::ble::central::BtleCentral::new().await?;
    Ok((
        central as Arc<dyn heartlink::ble::transport::HeartRateCentral>,
        None,
    ))
}

/// Without real BLE support, run against a simulated strap that advertises
/// continuously and produces a gently drifting resting heart rate.
#[cfg(not(feature = "ble-central"))]
async fn build_central() -> Result<CentralSetup> {
    use std::time::Duration;

    use heartlink::ble::simulated::SimRadio;

    let radio = SimRadio::new();
    let strap = radio.add_device("Simulated Strap", -50).await;
    let target = strap.id();
    tokio::spawn(async move {
        let mut tick: u32 = 0;
        loop {
            strap.advertise();
            if strap.is_connected() {
                let wave = (tick as f32 * 0.1).sin() * 6.0;
                strap.push_bpm((72.0 + wave).round() as u16);
            }
            tick += 1;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });

    Ok((
        radio as Arc<dyn heartlink::ble::transport::HeartRateCentral>,
        Some(target),
    ))
}
