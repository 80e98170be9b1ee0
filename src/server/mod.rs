//! Network publishers
//!
//! HTTP snapshot responder and WebSocket pusher, both fed from the
//! telemetry hub and independently start/stoppable.

pub mod http;
pub mod ws;

use thiserror::Error;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind server: {0}")]
    Bind(String),
}

/// A running publisher. Dropping it leaves the server running; call
/// [`ServerHandle::stop`] for a graceful shutdown.
pub struct ServerHandle {
    port: u16,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    fn new(port: u16, shutdown: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            port,
            shutdown,
            task,
        }
    }

    /// The configured port (as requested, not resolved).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Shut the server down and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}
