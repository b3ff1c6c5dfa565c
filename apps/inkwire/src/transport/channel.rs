use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use super::TransportError;
use crate::protocol::{Envelope, Frame};

const CHANNEL_BUFFER: usize = 256;

/// Handle to one named logical stream on the shared transport. Cloning is
/// cheap; all clones send into the same socket and read the same frames.
#[derive(Clone)]
pub struct Channel {
    name: String,
    outbound: mpsc::UnboundedSender<Envelope>,
    inbound: broadcast::Sender<Frame>,
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.outbound
            .send(Envelope::new(self.name.clone(), frame))
            .map_err(|_| TransportError::ChannelClosed(self.name.clone()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.inbound.subscribe()
    }
}

/// Routing table shared by every transport implementation: channel name to
/// broadcast sender for inbound frames, plus the common outbound queue.
pub(crate) struct ChannelTable {
    outbound: mpsc::UnboundedSender<Envelope>,
    channels: RwLock<HashMap<String, broadcast::Sender<Frame>>>,
}

impl ChannelTable {
    pub(crate) fn new(outbound: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            outbound,
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn channel(&self, name: &str) -> Channel {
        let mut channels = self.channels.write();
        let inbound = channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_BUFFER).0)
            .clone();
        Channel {
            name: name.to_string(),
            outbound: self.outbound.clone(),
            inbound,
        }
    }

    pub(crate) fn release(&self, name: &str) {
        self.channels.write().remove(name);
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.channels.read().keys().cloned().collect()
    }

    /// Deliver an inbound envelope to its channel's subscribers. Frames for
    /// unrouted channels are dropped; a document that was closed locally can
    /// still have updates in flight.
    pub(crate) fn route(&self, envelope: Envelope) {
        let channels = self.channels.read();
        match channels.get(&envelope.channel) {
            Some(sender) => {
                if sender.send(envelope.frame).is_err() {
                    trace!(
                        target = "transport.channel",
                        channel = %envelope.channel,
                        "no subscriber for inbound frame"
                    );
                }
            }
            None => {
                trace!(
                    target = "transport.channel",
                    channel = %envelope.channel,
                    "dropping frame for unrouted channel"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_route_reaches_subscriber() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let table = ChannelTable::new(tx);
        let channel = table.channel("doc-1");
        let mut frames = channel.subscribe();

        table.route(Envelope::new(
            "doc-1",
            Frame::Update {
                payload: Bytes::from_static(b"u1"),
            },
        ));
        let frame = frames.try_recv().unwrap();
        assert!(matches!(frame, Frame::Update { .. }));
    }

    #[tokio::test]
    async fn test_unrouted_channel_drops_frame() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let table = ChannelTable::new(tx);
        // No panic, no routing entry created as a side effect.
        table.route(Envelope::new("doc-unknown", Frame::Detach));
        assert!(table.names().is_empty());
    }

    #[tokio::test]
    async fn test_send_wraps_into_envelope() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let table = ChannelTable::new(tx);
        let channel = table.channel("doc-2");
        channel.send(Frame::Detach).unwrap();

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.channel, "doc-2");
        assert_eq!(envelope.frame, Frame::Detach);
    }
}
