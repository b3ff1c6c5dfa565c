use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex as AsyncMutex};

use crate::protocol::WireError;

pub mod channel;
pub mod mock;
pub mod websocket;

pub use channel::Channel;
pub use mock::MockTransport;
pub use websocket::WebSocketTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket connect to {url} failed: {message}")]
    Connect { url: String, message: String },
    #[error("transport is not connected")]
    NotConnected,
    #[error("channel '{0}' is closed")]
    ChannelClosed(String),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Lifecycle notifications surfaced to the per-document providers. Drops and
/// redials are otherwise invisible above the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Disconnected,
    Reconnected,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8787/collab".to_string(),
            reconnect_initial: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

/// Transport trait for the single physical connection every document session
/// shares. Implementations multiplex named logical channels over it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Get or create the logical channel with the given name.
    fn channel(&self, name: &str) -> Channel;

    /// Drop the routing entry for a channel once its provider detaches.
    fn release_channel(&self, name: &str);

    /// Names of the currently routed channels.
    fn channel_names(&self) -> Vec<String>;

    /// Check if the underlying socket is currently connected.
    fn is_connected(&self) -> bool;

    /// Subscribe to connect/disconnect notifications.
    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Tear down the socket and stop the I/O task.
    async fn shutdown(&self);
}

// Process-wide transport slot. Components never reach for this themselves;
// only the composition boundary (`CollabClient::connect`) does.
static SHARED: AsyncMutex<Option<Arc<dyn Transport>>> = AsyncMutex::const_new(None);

/// Return the shared transport, connecting it on first use.
pub async fn shared_transport(config: &TransportConfig) -> Result<Arc<dyn Transport>, TransportError> {
    let mut slot = SHARED.lock().await;
    if let Some(transport) = slot.as_ref() {
        return Ok(Arc::clone(transport));
    }
    let transport: Arc<dyn Transport> = WebSocketTransport::connect(config.clone()).await?;
    *slot = Some(Arc::clone(&transport));
    Ok(transport)
}

/// Tear down the shared transport and clear the slot. A later call to
/// [`shared_transport`] dials a fresh connection (e.g. after
/// re-authentication against a different server).
pub async fn destroy_shared_transport() {
    let mut slot = SHARED.lock().await;
    if let Some(transport) = slot.take() {
        transport.shutdown().await;
    }
}
