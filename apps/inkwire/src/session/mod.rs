use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::connection::{ConnectError, ConnectionEntry, ConnectionRegistry, EntryOrigin};
use crate::protocol::PresenceUser;

pub mod store;
pub mod surface;

pub use store::{EvictionPolicy, LruEviction, RetainAll, SessionStamp, SessionStore};
pub use surface::{EditorSurface, MountState, RenderContainer, SurfaceExtension, SurfaceKind};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("extension '{name}' failed to install: {source}")]
    Extension {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("surface already destroyed")]
    SurfaceDestroyed,
}

/// Everything a caller supplies to open a document session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub doc_id: String,
    pub user_id: String,
    pub user_label: String,
    pub initial_state: Option<String>,
    pub locked: bool,
    pub initial_title: String,
}

impl SessionRequest {
    pub fn new(doc_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            doc_id: doc_id.into(),
            user_label: user_id.clone(),
            user_id,
            initial_state: None,
            locked: false,
            initial_title: String::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.user_label = label.into();
        self
    }

    pub fn with_initial_state(mut self, state: impl Into<String>) -> Self {
        self.initial_state = Some(state.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.initial_title = title.into();
        self
    }

    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }
}

/// One open document: paired title/content surfaces plus a shared reference
/// to the connection entry backing them. The session owns its surfaces and
/// container exclusively; the entry stays owned by the registry and the
/// transport outlives everything.
pub struct Session {
    doc_id: String,
    user_id: String,
    title: Mutex<EditorSurface>,
    content: Mutex<EditorSurface>,
    connection: Arc<ConnectionEntry>,
    container: Mutex<Option<RenderContainer>>,
    last_used: AtomicU64,
    opened_at: i64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("doc_id", &self.doc_id)
            .field("user_id", &self.user_id)
            .field("opened_at", &self.opened_at)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn connection(&self) -> &Arc<ConnectionEntry> {
        &self.connection
    }

    pub fn opened_at(&self) -> i64 {
        self.opened_at
    }

    pub fn title_text(&self) -> String {
        self.title.lock().text()
    }

    pub fn content_text(&self) -> String {
        self.content.lock().text()
    }

    pub fn title_editable(&self) -> bool {
        self.title.lock().is_editable()
    }

    /// Remote collaborators currently seen on this document's channel.
    pub fn peers(&self) -> Vec<PresenceUser> {
        self.connection.provider().peers()
    }

    /// Attach the content surface's rendered root to a host container.
    pub fn mount(&self, container: RenderContainer) -> Result<(), SessionError> {
        self.content.lock().mount(container.clone())?;
        *self.container.lock() = Some(container);
        Ok(())
    }

    pub fn is_mounted(&self) -> bool {
        matches!(*self.content.lock().mount_state(), MountState::Mounted(_))
    }

    pub fn render_container(&self) -> Option<RenderContainer> {
        self.container.lock().clone()
    }

    pub(crate) fn stamp(&self, tick: u64) {
        self.last_used.store(tick, Ordering::SeqCst);
    }

    pub(crate) fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::SeqCst)
    }

    /// Destroy both surfaces (detaching any mounted view first) and drop the
    /// container handle. Connection cleanup is the store's step; it follows
    /// immediately in every teardown path.
    pub(crate) fn teardown(&self) {
        self.content.lock().destroy();
        self.title.lock().destroy();
        *self.container.lock() = None;
        debug!(target = "session", doc = %self.doc_id, "session torn down");
    }
}

/// Builds fully wired sessions: connection entry, title surface, content
/// surface with the environment's editing behaviors, optional render
/// container.
pub struct SessionFactory {
    registry: Arc<ConnectionRegistry>,
    extensions: Vec<Arc<dyn SurfaceExtension>>,
    mounted_rendering: bool,
}

impl SessionFactory {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            extensions: Vec::new(),
            mounted_rendering: false,
        }
    }

    /// Editing behaviors installed into every content surface this factory
    /// builds. Opaque to this subsystem.
    pub fn with_extensions(mut self, extensions: Vec<Arc<dyn SurfaceExtension>>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Deployment modes that render immediately get a detached container
    /// created and mounted at construction time.
    pub fn with_mounted_rendering(mut self, mounted: bool) -> Self {
        self.mounted_rendering = mounted;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn create_session(&self, request: &SessionRequest) -> Result<Arc<Session>, SessionError> {
        let (entry, origin) = self
            .registry
            .get_connection(&request.doc_id, request.initial_state.as_deref())?;
        entry
            .provider()
            .set_local_presence(&request.user_id, &request.user_label);

        let title = EditorSurface::title(entry.doc(), &request.initial_title, request.locked);
        let content = match EditorSurface::content(entry.doc(), entry.provider(), &self.extensions)
        {
            Ok(content) => content,
            Err(err) => {
                // Roll back an entry created by this very call so a retry
                // for the same document starts clean.
                if origin == EntryOrigin::Created {
                    self.registry.cleanup(&request.doc_id);
                }
                return Err(err);
            }
        };

        let session = Arc::new(Session {
            doc_id: request.doc_id.clone(),
            user_id: request.user_id.clone(),
            title: Mutex::new(title),
            content: Mutex::new(content),
            connection: entry,
            container: Mutex::new(None),
            last_used: AtomicU64::new(0),
            opened_at: chrono::Utc::now().timestamp(),
        });

        if self.mounted_rendering {
            if let Err(err) = session.mount(RenderContainer::detached()) {
                session.teardown();
                if origin == EntryOrigin::Created {
                    self.registry.cleanup(&request.doc_id);
                }
                return Err(err);
            }
        }

        debug!(
            target = "session",
            doc = %request.doc_id,
            user = %request.user_id,
            mounted = self.mounted_rendering,
            "session created"
        );
        Ok(session)
    }
}
