//! HTTP snapshot responder
//!
//! `GET /heartrate` returns the latest reading and connection flag as JSON;
//! every other request is a 404.

use std::sync::Arc;

use tokio::sync::oneshot;
use warp::Filter;

use super::{ServerError, ServerHandle};
use crate::hub::TelemetryHub;

/// The `/heartrate` route.
pub fn routes(
    hub: Arc<TelemetryHub>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("heartrate")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::any().map(move || Arc::clone(&hub)))
        .map(|hub: Arc<TelemetryHub>| {
            let (state, sample) = hub.snapshot();
            warp::reply::json(&serde_json::json!({
                "heart_rate": sample.bpm,
                "connected": state.is_connected(),
            }))
        })
}

/// Start the responder on `port`.
pub fn start(hub: Arc<TelemetryHub>, port: u16) -> Result<ServerHandle, ServerError> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (addr, server) = warp::serve(routes(hub))
        .try_bind_with_graceful_shutdown(([0, 0, 0, 0], port), async move {
            shutdown_rx.await.ok();
        })
        .map_err(|e| ServerError::Bind(e.to_string()))?;
    log::info!("HTTP publisher listening on {}", addr);
    let task = tokio::spawn(server);
    Ok(ServerHandle::new(port, shutdown_tx, task))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::ConnectionState;

    #[tokio::test]
    async fn test_snapshot_payload() {
        let hub = TelemetryHub::new();
        hub.set_state(ConnectionState::Connected {
            device: "Polar H10".to_string(),
        });
        hub.update_heart_rate(72);

        let response = warp::test::request()
            .path("/heartrate")
            .reply(&routes(hub))
            .await;
        assert_eq!(response.status(), 200);

        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["heart_rate"], 72);
        assert_eq!(body["connected"], true);
    }

    #[tokio::test]
    async fn test_disconnected_snapshot() {
        let hub = TelemetryHub::new();
        let response = warp::test::request()
            .path("/heartrate")
            .reply(&routes(hub))
            .await;
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["heart_rate"], 0);
        assert_eq!(body["connected"], false);
    }

    #[tokio::test]
    async fn test_other_paths_rejected() {
        let hub = TelemetryHub::new();
        let response = warp::test::request()
            .path("/something")
            .reply(&routes(hub))
            .await;
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let hub = TelemetryHub::new();
        // Port 0 binds an ephemeral port; the handle remembers the request.
        let handle = start(hub, 0).unwrap();
        assert_eq!(handle.port(), 0);
        handle.stop().await;
    }
}
