use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;
use yrs::{Doc, GetString, Text, TextRef, Transact};

use super::SessionError;
use crate::connection::DocProvider;

/// Caller-supplied editing behavior installed into a content surface. The
/// UI layer decides what these do; this subsystem only wires them up and
/// propagates their failures.
pub trait SurfaceExtension: Send + Sync {
    fn name(&self) -> &str;
    fn install(&self, doc: &Doc, provider: &Arc<DocProvider>) -> anyhow::Result<()>;
}

/// Handle to the host view node a surface renders into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderContainer {
    id: String,
}

impl RenderContainer {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// A container that exists but is not yet part of any view tree.
    pub fn detached() -> Self {
        Self {
            id: format!("container-{}", Uuid::new_v4()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Explicit mount lifecycle instead of try/ignore teardown: removing a
/// surface that was never mounted is an ordinary state, not an exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    Mounted(RenderContainer),
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceKind {
    Title,
    Content,
}

impl SurfaceKind {
    /// Name of the shared text root backing this region.
    pub fn root_name(self) -> &'static str {
        match self {
            SurfaceKind::Title => "title",
            SurfaceKind::Content => "content",
        }
    }
}

/// One independently editable region backed by the session's replicated
/// document. Owned exclusively by its Session; the document itself is shared.
pub struct EditorSurface {
    kind: SurfaceKind,
    doc: Doc,
    text: TextRef,
    editable: bool,
    mount: MountState,
    extensions: Vec<Arc<dyn SurfaceExtension>>,
}

impl EditorSurface {
    /// Title region. Seeds `initial_title` only while the shared title text
    /// is still empty; live replicated state is authoritative.
    pub(crate) fn title(doc: &Doc, initial_title: &str, locked: bool) -> Self {
        let text = doc.get_or_insert_text(SurfaceKind::Title.root_name());
        {
            let mut txn = doc.transact_mut();
            if text.len(&txn) == 0 && !initial_title.is_empty() {
                text.insert(&mut txn, 0, initial_title);
            }
        }
        Self {
            kind: SurfaceKind::Title,
            doc: doc.clone(),
            text,
            editable: !locked,
            mount: MountState::Unmounted,
            extensions: Vec::new(),
        }
    }

    /// Content region. Installs the injected behaviors before exposing the
    /// surface; any installation failure aborts construction.
    pub(crate) fn content(
        doc: &Doc,
        provider: &Arc<DocProvider>,
        extensions: &[Arc<dyn SurfaceExtension>],
    ) -> Result<Self, SessionError> {
        for extension in extensions {
            extension
                .install(doc, provider)
                .map_err(|source| SessionError::Extension {
                    name: extension.name().to_string(),
                    source,
                })?;
        }
        let text = doc.get_or_insert_text(SurfaceKind::Content.root_name());
        Ok(Self {
            kind: SurfaceKind::Content,
            doc: doc.clone(),
            text,
            editable: true,
            mount: MountState::Unmounted,
            extensions: extensions.to_vec(),
        })
    }

    pub fn kind(&self) -> SurfaceKind {
        self.kind
    }

    pub fn is_editable(&self) -> bool {
        self.editable && !self.is_destroyed()
    }

    pub fn mount_state(&self) -> &MountState {
        &self.mount
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self.mount, MountState::Destroyed)
    }

    pub fn extension_names(&self) -> Vec<String> {
        self.extensions
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    /// Attach the surface's rendered root to a host container.
    pub fn mount(&mut self, container: RenderContainer) -> Result<(), SessionError> {
        if self.is_destroyed() {
            return Err(SessionError::SurfaceDestroyed);
        }
        self.mount = MountState::Mounted(container);
        Ok(())
    }

    /// Detach from the host container. Tolerates a surface that was never
    /// mounted; teardown may run before the first render.
    pub fn unmount(&mut self) {
        if let MountState::Mounted(container) = &self.mount {
            debug!(
                target = "session.surface",
                kind = ?self.kind,
                container = %container.id(),
                "surface unmounted"
            );
            self.mount = MountState::Unmounted;
        }
    }

    /// Idempotent. Detaches if mounted and drops the installed behaviors;
    /// the backing document is owned by the connection entry, not here.
    pub fn destroy(&mut self) {
        self.unmount();
        self.mount = MountState::Destroyed;
        self.extensions.clear();
    }

    /// Current textual content of this region, empty once destroyed.
    pub fn text(&self) -> String {
        if self.is_destroyed() {
            return String::new();
        }
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }
}
