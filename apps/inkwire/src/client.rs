use std::sync::Arc;

use tracing::info;

use crate::config::{CacheDiscipline, CollabConfig};
use crate::connection::ConnectionRegistry;
use crate::session::store::{LruEviction, RetainAll, SessionStore};
use crate::session::{Session, SessionError, SessionFactory, SessionRequest, SurfaceExtension};
use crate::transport::{self, Transport, TransportConfig, TransportError};

/// Process-composition boundary for the whole subsystem: one shared
/// transport, one connection registry, one session store. Everything inside
/// stays a plain struct so tests assemble private instances instead.
pub struct CollabClient {
    transport: Arc<dyn Transport>,
    registry: Arc<ConnectionRegistry>,
    store: SessionStore,
    owns_shared_transport: bool,
}

impl CollabClient {
    /// Connect through the process-wide shared transport, creating it on
    /// first use.
    pub async fn connect(
        config: &CollabConfig,
        extensions: Vec<Arc<dyn SurfaceExtension>>,
    ) -> Result<Self, TransportError> {
        let transport_config = TransportConfig::new(config.collab_url.clone());
        let transport = transport::shared_transport(&transport_config).await?;
        info!(target = "client", url = %config.collab_url, "collaboration client connected");
        Ok(Self::assemble(config, transport, extensions, true))
    }

    /// Assemble over an explicit transport. Used by tests and by hosts that
    /// manage the transport lifecycle themselves.
    pub fn with_transport(
        config: &CollabConfig,
        transport: Arc<dyn Transport>,
        extensions: Vec<Arc<dyn SurfaceExtension>>,
    ) -> Self {
        Self::assemble(config, transport, extensions, false)
    }

    fn assemble(
        config: &CollabConfig,
        transport: Arc<dyn Transport>,
        extensions: Vec<Arc<dyn SurfaceExtension>>,
        owns_shared_transport: bool,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(Arc::clone(&transport)));
        let factory = SessionFactory::new(Arc::clone(&registry)).with_extensions(extensions);
        let store = match config.discipline {
            CacheDiscipline::Bounded => SessionStore::new(
                factory,
                Box::new(LruEviction::new(config.session_capacity)),
            ),
            CacheDiscipline::Unbounded => SessionStore::new(factory, Box::new(RetainAll)),
        };
        Self {
            transport,
            registry,
            store,
            owns_shared_transport,
        }
    }

    /// Open (or return the cached) session for a document.
    pub fn open(&self, request: &SessionRequest) -> Result<Arc<Session>, SessionError> {
        self.store.get_or_create(request)
    }

    pub fn get(&self, doc_id: &str) -> Option<Arc<Session>> {
        self.store.get(doc_id)
    }

    /// Mark user activity on a document, postponing its eviction.
    pub fn touch(&self, doc_id: &str) -> bool {
        self.store.touch(doc_id)
    }

    /// Tab closed: tear the session and its connection down.
    pub fn close(&self, doc_id: &str) -> bool {
        self.store.remove(doc_id)
    }

    pub fn session_count(&self) -> usize {
        self.store.len()
    }

    pub fn open_doc_ids(&self) -> Vec<String> {
        self.store.doc_ids()
    }

    pub fn connected_doc_ids(&self) -> Vec<String> {
        self.registry.connected_doc_ids()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Full subsystem shutdown: every session, every connection, then the
    /// transport itself (clearing the process-wide slot when we own it).
    pub async fn shutdown(self) {
        self.store.destroy();
        self.registry.destroy();
        if self.owns_shared_transport {
            transport::destroy_shared_transport().await;
        } else {
            self.transport.shutdown().await;
        }
        info!(target = "client", "collaboration client shut down");
    }
}
