use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use super::channel::{Channel, ChannelTable};
use super::{Transport, TransportEvent};
use crate::protocol::{Envelope, Frame};

/// In-memory transport for tests. Outbound envelopes are captured instead of
/// hitting a socket, and tests can inject inbound frames or lifecycle events.
pub struct MockTransport {
    channels: Arc<ChannelTable>,
    outbound: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    sent: Mutex<Vec<Envelope>>,
    events: broadcast::Sender<TransportEvent>,
    connected: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (tx_out, rx_out) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            channels: Arc::new(ChannelTable::new(tx_out)),
            outbound: Mutex::new(rx_out),
            sent: Mutex::new(Vec::new()),
            events,
            connected: AtomicBool::new(true),
        })
    }

    /// Everything sent through any channel so far, in order.
    pub fn sent(&self) -> Vec<Envelope> {
        let mut rx = self.outbound.lock();
        let mut sent = self.sent.lock();
        while let Ok(envelope) = rx.try_recv() {
            sent.push(envelope);
        }
        sent.clone()
    }

    /// Simulate an inbound frame from the far side.
    pub fn inject(&self, channel: &str, frame: Frame) {
        self.channels.route(Envelope::new(channel, frame));
    }

    /// Simulate a socket drop/recovery cycle.
    pub fn emit(&self, event: TransportEvent) {
        match event {
            TransportEvent::Disconnected => self.connected.store(false, Ordering::SeqCst),
            TransportEvent::Reconnected => self.connected.store(true, Ordering::SeqCst),
        }
        let _ = self.events.send(event);
    }

    pub fn clear_sent(&self) {
        let _ = self.sent();
        self.sent.lock().clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn channel(&self, name: &str) -> Channel {
        self.channels.channel(name)
    }

    fn release_channel(&self, name: &str) {
        self.channels.release(name);
    }

    fn channel_names(&self) -> Vec<String> {
        self.channels.names()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn shutdown(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
