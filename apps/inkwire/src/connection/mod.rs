use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;
use yrs::updates::decoder::Decode;
use yrs::{Doc, Transact, Update};

use crate::transport::{Transport, TransportError};

pub mod provider;

pub use provider::DocProvider;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("initial snapshot for '{doc_id}' is not valid base64: {source}")]
    SnapshotEncoding {
        doc_id: String,
        #[source]
        source: base64::DecodeError,
    },
    #[error("initial snapshot for '{doc_id}' is not a valid update: {message}")]
    SnapshotDecode { doc_id: String, message: String },
    #[error("initial snapshot for '{doc_id}' could not be applied: {message}")]
    SnapshotApply { doc_id: String, message: String },
    #[error("update observer for '{doc_id}' could not be registered: {message}")]
    Observer { doc_id: String, message: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Whether `get_connection` found a live entry or had to build one. The
/// session factory uses this to decide what to roll back on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOrigin {
    Created,
    Existing,
}

/// One live document connection: the replicated document, the provider
/// binding it to a channel on the shared transport, and the snapshot it was
/// seeded from. Owned by the registry; sessions hold shared references.
pub struct ConnectionEntry {
    doc_id: String,
    doc: Doc,
    provider: Arc<DocProvider>,
    initial_snapshot: Option<String>,
    created_at: i64,
}

impl std::fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("doc_id", &self.doc_id)
            .field("initial_snapshot", &self.initial_snapshot)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl ConnectionEntry {
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn provider(&self) -> &Arc<DocProvider> {
        &self.provider
    }

    /// The snapshot applied when this entry was built, still in its
    /// transport encoding. `None` when the document started empty.
    pub fn initial_snapshot(&self) -> Option<&str> {
        self.initial_snapshot.as_deref()
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }
}

/// Maps document ids to live connection entries. Lookup-then-insert runs
/// under one lock so two near-simultaneous requests for the same document
/// can never build two CRDT documents.
pub struct ConnectionRegistry {
    transport: Arc<dyn Transport>,
    entries: Mutex<HashMap<String, Arc<ConnectionEntry>>>,
}

impl ConnectionRegistry {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the entry for `doc_id`, building it on first request. On a hit
    /// the existing live state is authoritative and `initial_state` is
    /// ignored; a stale snapshot must never overwrite a live document. On a
    /// miss the snapshot (if any) is applied to the fresh document *before*
    /// the provider attaches, so initial content cannot be raced by remote
    /// updates.
    pub fn get_connection(
        &self,
        doc_id: &str,
        initial_state: Option<&str>,
    ) -> Result<(Arc<ConnectionEntry>, EntryOrigin), ConnectError> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(doc_id) {
            return Ok((Arc::clone(entry), EntryOrigin::Existing));
        }

        let doc = Doc::new();
        if let Some(encoded) = initial_state {
            apply_snapshot(doc_id, &doc, encoded)?;
        }

        let provider = Arc::new(DocProvider::new(
            doc_id,
            doc.clone(),
            Arc::clone(&self.transport),
        ));
        if let Err(err) = provider.attach() {
            provider.detach();
            return Err(err);
        }

        let entry = Arc::new(ConnectionEntry {
            doc_id: doc_id.to_string(),
            doc,
            provider,
            initial_snapshot: initial_state.map(str::to_string),
            created_at: chrono::Utc::now().timestamp(),
        });
        entries.insert(doc_id.to_string(), Arc::clone(&entry));
        debug!(target = "connection.registry", doc = %doc_id, "connection created");
        Ok((entry, EntryOrigin::Created))
    }

    /// Detach and drop the entry for `doc_id`. No-op if absent.
    pub fn cleanup(&self, doc_id: &str) -> bool {
        let entry = self.entries.lock().remove(doc_id);
        match entry {
            Some(entry) => {
                entry.provider.detach();
                debug!(target = "connection.registry", doc = %doc_id, "connection cleaned up");
                true
            }
            None => false,
        }
    }

    /// Tear down every entry. Used for full subsystem shutdown.
    pub fn destroy(&self) {
        let entries: Vec<Arc<ConnectionEntry>> = self.entries.lock().drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.provider.detach();
        }
        debug!(target = "connection.registry", "registry destroyed");
    }

    /// Diagnostic listing of the currently connected document ids.
    pub fn connected_doc_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn apply_snapshot(doc_id: &str, doc: &Doc, encoded: &str) -> Result<(), ConnectError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|source| ConnectError::SnapshotEncoding {
            doc_id: doc_id.to_string(),
            source,
        })?;
    if bytes.is_empty() {
        return Ok(());
    }
    let update = Update::decode_v1(&bytes).map_err(|err| ConnectError::SnapshotDecode {
        doc_id: doc_id.to_string(),
        message: err.to_string(),
    })?;
    let mut txn = doc.transact_mut();
    txn.apply_update(update)
        .map_err(|err| ConnectError::SnapshotApply {
            doc_id: doc_id.to_string(),
            message: err.to_string(),
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use yrs::{GetString, ReadTxn, StateVector, Text};

    fn snapshot_with_content(text: &str) -> String {
        let doc = Doc::new();
        let content = doc.get_or_insert_text("content");
        {
            let mut txn = doc.transact_mut();
            content.push(&mut txn, text);
        }
        let update = doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default());
        BASE64.encode(update)
    }

    fn content_text(doc: &Doc) -> String {
        let content = doc.get_or_insert_text("content");
        let txn = doc.transact();
        content.get_string(&txn)
    }

    #[tokio::test]
    async fn test_get_connection_is_idempotent() {
        let transport = MockTransport::new();
        let registry = ConnectionRegistry::new(transport);

        let (first, origin) = registry.get_connection("doc-1", None).unwrap();
        assert_eq!(origin, EntryOrigin::Created);

        // Second call returns the identical entry; the stale snapshot
        // argument is ignored and never applied to the live document.
        let snapshot = snapshot_with_content("stale");
        let (second, origin) = registry.get_connection("doc-1", Some(&snapshot)).unwrap();
        assert_eq!(origin, EntryOrigin::Existing);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(content_text(second.doc()), "");
    }

    #[tokio::test]
    async fn test_snapshot_is_applied_before_attach() {
        let transport = MockTransport::new();
        let registry = ConnectionRegistry::new(transport);

        let snapshot = snapshot_with_content("seeded");
        let (entry, _) = registry.get_connection("doc-2", Some(&snapshot)).unwrap();
        assert_eq!(content_text(entry.doc()), "seeded");
        assert_eq!(entry.initial_snapshot(), Some(snapshot.as_str()));
    }

    #[tokio::test]
    async fn test_bad_snapshot_registers_nothing() {
        let transport = MockTransport::new();
        let registry = ConnectionRegistry::new(Arc::clone(&transport) as _);

        let err = registry
            .get_connection("doc-3", Some("%%not-base64%%"))
            .unwrap_err();
        assert!(matches!(err, ConnectError::SnapshotEncoding { .. }));
        assert!(registry.connected_doc_ids().is_empty());
        assert!(transport.channel_names().is_empty());

        // The failed attempt does not block a clean retry.
        let (_, origin) = registry.get_connection("doc-3", None).unwrap();
        assert_eq!(origin, EntryOrigin::Created);
    }

    #[tokio::test]
    async fn test_cleanup_removes_entry_and_channel() {
        let transport = MockTransport::new();
        let registry = ConnectionRegistry::new(Arc::clone(&transport) as _);

        registry.get_connection("doc-4", None).unwrap();
        assert_eq!(registry.connected_doc_ids(), vec!["doc-4".to_string()]);

        assert!(registry.cleanup("doc-4"));
        assert!(registry.connected_doc_ids().is_empty());
        assert!(transport.channel_names().is_empty());
        assert!(!registry.cleanup("doc-4"));
    }

    #[tokio::test]
    async fn test_destroy_clears_every_entry() {
        let transport = MockTransport::new();
        let registry = ConnectionRegistry::new(transport);

        registry.get_connection("doc-5", None).unwrap();
        registry.get_connection("doc-6", None).unwrap();
        registry.destroy();
        assert!(registry.is_empty());
    }
}
