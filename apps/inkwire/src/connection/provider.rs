use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Transact, Update};

use super::ConnectError;
use crate::protocol::{Frame, PresenceUser};
use crate::transport::{Channel, Transport, TransportEvent};

/// Transaction origin marking updates that arrived over the wire, so the
/// update observer does not echo them straight back out.
const REMOTE_ORIGIN: &str = "inkwire.remote";

const PRESENCE_PALETTE: &[&str] = &[
    "#f06292", "#ba68c8", "#7986cb", "#4fc3f7", "#4db6ac", "#aed581", "#ffb74d", "#ff8a65",
];

/// Deterministic color per user id so every collaborator renders the same
/// cursor color without coordination.
pub fn presence_color(user_id: &str) -> &'static str {
    let hash = user_id
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(u32::from(b)));
    PRESENCE_PALETTE[hash as usize % PRESENCE_PALETTE.len()]
}

/// Binds one CRDT document to its named channel on the shared transport:
/// forwards local updates out, applies remote updates in, and broadcasts
/// presence. Construction binds nothing; [`DocProvider::attach`] is the
/// explicit step that starts consuming connection budget.
pub struct DocProvider {
    doc_id: String,
    doc: Doc,
    channel: Channel,
    transport: Arc<dyn Transport>,
    presence: RwLock<Option<PresenceUser>>,
    peers: RwLock<HashMap<String, PresenceUser>>,
    update_sub: Mutex<Option<yrs::Subscription>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    attached: AtomicBool,
}

impl DocProvider {
    pub fn new(doc_id: impl Into<String>, doc: Doc, transport: Arc<dyn Transport>) -> Self {
        let doc_id = doc_id.into();
        let channel = transport.channel(&doc_id);
        Self {
            doc_id,
            doc,
            channel,
            transport,
            presence: RwLock::new(None),
            peers: RwLock::new(HashMap::new()),
            update_sub: Mutex::new(None),
            recv_task: Mutex::new(None),
            attached: AtomicBool::new(false),
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Start replicating: register the local update observer, announce our
    /// state vector on the channel, and spawn the receive task. Idempotent.
    pub fn attach(self: &Arc<Self>) -> Result<(), ConnectError> {
        if self.attached.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let channel = self.channel.clone();
        let doc_id = self.doc_id.clone();
        let sub = self
            .doc
            .observe_update_v1(move |txn, event| {
                if txn.origin() == Some(&Origin::from(REMOTE_ORIGIN)) {
                    return;
                }
                let frame = Frame::Update {
                    payload: Bytes::from(event.update.clone()),
                };
                if channel.send(frame).is_err() {
                    debug!(
                        target = "connection.provider",
                        doc = %doc_id,
                        "transport gone while forwarding local update"
                    );
                }
            })
            .map_err(|err| {
                self.attached.store(false, Ordering::SeqCst);
                ConnectError::Observer {
                    doc_id: self.doc_id.clone(),
                    message: err.to_string(),
                }
            })?;
        *self.update_sub.lock() = Some(sub);

        let state_vector = self.doc.transact().state_vector().encode_v1();
        self.channel.send(Frame::Attach {
            state_vector: Bytes::from(state_vector),
        })?;
        if let Some(user) = self.presence.read().clone() {
            self.channel.send(Frame::Presence { user })?;
        }

        let this = Arc::clone(self);
        let mut frames = self.channel.subscribe();
        let mut events = self.transport.subscribe_events();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = frames.recv() => match frame {
                        Ok(Frame::Update { payload }) => this.apply_remote(&payload),
                        Ok(Frame::Presence { user }) => {
                            this.peers.write().insert(user.user_id.clone(), user);
                        }
                        Ok(Frame::Attach { state_vector }) => this.answer_attach(&state_vector),
                        Ok(Frame::Detach) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(
                                target = "connection.provider",
                                doc = %this.doc_id,
                                skipped,
                                "receiver lagged on document channel"
                            );
                        }
                        Err(RecvError::Closed) => break,
                    },
                    event = events.recv() => match event {
                        Ok(TransportEvent::Reconnected) => this.resync(),
                        Ok(TransportEvent::Disconnected) => {}
                        Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
        *self.recv_task.lock() = Some(task);

        debug!(target = "connection.provider", doc = %self.doc_id, "attached");
        Ok(())
    }

    /// Stop replicating and release the channel. Safe to call on a provider
    /// that never finished attaching.
    pub fn detach(&self) {
        let was_attached = self.attached.swap(false, Ordering::SeqCst);
        if was_attached {
            let _ = self.channel.send(Frame::Detach);
        }
        *self.update_sub.lock() = None;
        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }
        self.transport.release_channel(&self.doc_id);
        debug!(target = "connection.provider", doc = %self.doc_id, "detached");
    }

    /// Tag the local user for presence broadcasting. Applied immediately if
    /// the provider is already attached.
    pub fn set_local_presence(&self, user_id: &str, label: &str) {
        let user = PresenceUser {
            user_id: user_id.to_string(),
            label: label.to_string(),
            color: presence_color(user_id).to_string(),
        };
        *self.presence.write() = Some(user.clone());
        if self.is_attached() {
            let _ = self.channel.send(Frame::Presence { user });
        }
    }

    pub fn local_presence(&self) -> Option<PresenceUser> {
        self.presence.read().clone()
    }

    /// Presence of remote collaborators seen on this channel.
    pub fn peers(&self) -> Vec<PresenceUser> {
        self.peers.read().values().cloned().collect()
    }

    fn apply_remote(&self, payload: &[u8]) {
        let update = match Update::decode_v1(payload) {
            Ok(update) => update,
            Err(err) => {
                warn!(
                    target = "connection.provider",
                    doc = %self.doc_id,
                    error = %err,
                    "dropping undecodable remote update"
                );
                return;
            }
        };
        let mut txn = self.doc.transact_mut_with(REMOTE_ORIGIN);
        if let Err(err) = txn.apply_update(update) {
            warn!(
                target = "connection.provider",
                doc = %self.doc_id,
                error = %err,
                "failed to apply remote update"
            );
        }
    }

    /// A peer announced itself with its state vector; send back whatever it
    /// is missing, plus our presence so it can render us.
    fn answer_attach(&self, state_vector: &[u8]) {
        let sv = match StateVector::decode_v1(state_vector) {
            Ok(sv) => sv,
            Err(err) => {
                warn!(
                    target = "connection.provider",
                    doc = %self.doc_id,
                    error = %err,
                    "ignoring attach with undecodable state vector"
                );
                return;
            }
        };
        let diff = self.doc.transact().encode_state_as_update_v1(&sv);
        let _ = self.channel.send(Frame::Update {
            payload: Bytes::from(diff),
        });
        if let Some(user) = self.presence.read().clone() {
            let _ = self.channel.send(Frame::Presence { user });
        }
    }

    /// The socket came back; re-announce so replication catches up.
    fn resync(&self) {
        let state_vector = self.doc.transact().state_vector().encode_v1();
        let _ = self.channel.send(Frame::Attach {
            state_vector: Bytes::from(state_vector),
        });
        if let Some(user) = self.presence.read().clone() {
            let _ = self.channel.send(Frame::Presence { user });
        }
        debug!(target = "connection.provider", doc = %self.doc_id, "re-announced after reconnect");
    }
}

impl Drop for DocProvider {
    fn drop(&mut self) {
        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_color_is_deterministic() {
        assert_eq!(presence_color("u1"), presence_color("u1"));
        assert!(PRESENCE_PALETTE.contains(&presence_color("someone-else")));
    }
}
