//! WebSocket pusher
//!
//! On upgrade each client gets the latest snapshot immediately, then one
//! frame per hub update. Periodic pings keep half-open connections from
//! lingering; the first failed write closes the client.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, oneshot};
use warp::ws::{Message, WebSocket};
use warp::Filter;

use super::{ServerError, ServerHandle};
use crate::hub::{ConnectionState, HeartRateSample, TelemetryHub};

const PING_INTERVAL: Duration = Duration::from_secs(4);

/// The WebSocket upgrade route.
pub fn routes(
    hub: Arc<TelemetryHub>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::ws()
        .and(warp::any().map(move || Arc::clone(&hub)))
        .map(|ws: warp::ws::Ws, hub: Arc<TelemetryHub>| {
            ws.on_upgrade(move |socket| client_session(socket, hub))
        })
}

/// Start the pusher on `port`.
pub fn start(hub: Arc<TelemetryHub>, port: u16) -> Result<ServerHandle, ServerError> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (addr, server) = warp::serve(routes(hub))
        .try_bind_with_graceful_shutdown(([0, 0, 0, 0], port), async move {
            shutdown_rx.await.ok();
        })
        .map_err(|e| ServerError::Bind(e.to_string()))?;
    log::info!("WebSocket publisher listening on {}", addr);
    let task = tokio::spawn(server);
    Ok(ServerHandle::new(port, shutdown_tx, task))
}

fn frame(state: &ConnectionState, sample: &HeartRateSample) -> String {
    serde_json::json!({
        "heart_rate": sample.bpm,
        "connected": state.is_connected(),
        "status": state.status_line(),
        "timestamp": Utc::now().timestamp_millis(),
    })
    .to_string()
}

async fn client_session(socket: WebSocket, hub: Arc<TelemetryHub>) {
    let (mut tx, mut rx) = socket.split();

    // Greeting: the latest snapshot, taken atomically with the subscription
    // so no update can slip between them.
    let ((state, sample), mut events) = hub.subscribe();
    if tx.send(Message::text(frame(&state, &sample))).await.is_err() {
        return;
    }

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if tx.send(Message::ping(Vec::new())).await.is_err() {
                    log::debug!("WebSocket ping failed, closing client");
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(_) => {
                    let (state, sample) = hub.snapshot();
                    if tx.send(Message::text(frame(&state, &sample))).await.is_err() {
                        log::debug!("WebSocket send failed, closing client");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::debug!("WebSocket client lagged, skipped {} updates", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = rx.next() => match incoming {
                Some(Ok(message)) if message.is_close() => break,
                // Pongs and client chatter are ignored.
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
        }
    }
}
