use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One multiplexed message on the shared socket. Every frame is addressed to
/// a logical channel named after the document it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub frame: Frame,
}

impl Envelope {
    pub fn new(channel: impl Into<String>, frame: Frame) -> Self {
        Self {
            channel: channel.into(),
            frame,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Announce interest in a channel. Carries the sender's encoded state
    /// vector so the far side can reply with the missing diff.
    Attach { state_vector: Bytes },
    /// Incremental replication update. The payload is an opaque CRDT update
    /// blob; this layer never interprets it.
    Update { payload: Bytes },
    /// Presence metadata for remote cursor rendering.
    Presence { user: PresenceUser },
    /// The sender is leaving the channel.
    Detach,
}

/// Presence identity broadcast alongside replication updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub user_id: String,
    pub label: String,
    pub color: String,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("envelope encode failed: {0}")]
    Encode(String),
    #[error("envelope decode failed: {0}")]
    Decode(String),
}

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    bincode::serialize(envelope).map_err(|err| WireError::Encode(err.to_string()))
}

pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, WireError> {
    bincode::deserialize(bytes).map_err(|err| WireError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = Envelope::new(
            "doc-1",
            Frame::Update {
                payload: Bytes::from_static(&[1, 2, 3]),
            },
        );
        let bytes = encode_envelope(&envelope).unwrap();
        assert_eq!(decode_envelope(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        assert!(decode_envelope(&[0xff; 7]).is_err());
    }
}
