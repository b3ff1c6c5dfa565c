use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{Session, SessionError, SessionFactory, SessionRequest};

/// Recency snapshot handed to the eviction policy, one per cached session.
#[derive(Debug, Clone)]
pub struct SessionStamp {
    pub doc_id: String,
    pub last_used: u64,
}

/// Pluggable cache discipline. The bounded LRU cache and the unbounded
/// per-tab registry are the same store with a different policy injected.
pub trait EvictionPolicy: Send + Sync {
    /// Pick the session to tear down, or `None` to keep everything. The
    /// just-inserted id is never a valid victim.
    fn select_victim(&self, sessions: &[SessionStamp], just_inserted: &str) -> Option<String>;
}

/// Keep at most `capacity` sessions, evicting the least recently used.
pub struct LruEviction {
    capacity: usize,
}

impl LruEviction {
    pub const DEFAULT_CAPACITY: usize = 8;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for LruEviction {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl EvictionPolicy for LruEviction {
    fn select_victim(&self, sessions: &[SessionStamp], just_inserted: &str) -> Option<String> {
        if sessions.len() <= self.capacity {
            return None;
        }
        sessions
            .iter()
            .filter(|stamp| stamp.doc_id != just_inserted)
            .min_by_key(|stamp| stamp.last_used)
            .map(|stamp| stamp.doc_id.clone())
    }
}

/// Every open tab stays live until it is closed explicitly.
pub struct RetainAll;

impl EvictionPolicy for RetainAll {
    fn select_victim(&self, _sessions: &[SessionStamp], _just_inserted: &str) -> Option<String> {
        None
    }
}

/// Caches constructed sessions per document id. A monotonic logical clock
/// stamps recency; eviction and explicit removal share one teardown path
/// that ends in connection cleanup.
pub struct SessionStore {
    factory: SessionFactory,
    policy: Box<dyn EvictionPolicy>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    clock: AtomicU64,
}

impl SessionStore {
    pub fn new(factory: SessionFactory, policy: Box<dyn EvictionPolicy>) -> Self {
        Self {
            factory,
            policy,
            sessions: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
        }
    }

    /// LRU-bounded store at the default capacity.
    pub fn bounded(factory: SessionFactory) -> Self {
        Self::new(factory, Box::new(LruEviction::default()))
    }

    /// Uncapped store; entries leave only via `remove`/`destroy`.
    pub fn unbounded(factory: SessionFactory) -> Self {
        Self::new(factory, Box::new(RetainAll))
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Return the cached session for `doc_id`, constructing (and possibly
    /// evicting) on a miss. The returned session may still be catching up
    /// with remote state.
    pub fn get_or_create(&self, request: &SessionRequest) -> Result<Arc<Session>, SessionError> {
        let (session, evicted) = {
            let mut sessions = self.sessions.lock();
            if let Some(session) = sessions.get(&request.doc_id) {
                session.stamp(self.tick());
                debug!(target = "session.store", doc = %request.doc_id, "cache hit");
                return Ok(Arc::clone(session));
            }

            let session = self.factory.create_session(request)?;
            session.stamp(self.tick());
            sessions.insert(request.doc_id.clone(), Arc::clone(&session));

            let mut evicted = Vec::new();
            while let Some(victim) = self.select_victim(&sessions, &request.doc_id) {
                match sessions.remove(&victim) {
                    Some(victim_session) => evicted.push(victim_session),
                    None => break,
                }
            }
            (session, evicted)
        };

        for victim in evicted {
            debug!(
                target = "session.store",
                doc = %victim.doc_id(),
                "evicting least recently used session"
            );
            self.teardown(&victim);
        }
        Ok(session)
    }

    /// Read-only lookup; recency is the caller's to manage via [`touch`].
    ///
    /// [`touch`]: SessionStore::touch
    pub fn get(&self, doc_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(doc_id).cloned()
    }

    /// Refresh the recency stamp. No-op if absent.
    pub fn touch(&self, doc_id: &str) -> bool {
        match self.sessions.lock().get(doc_id) {
            Some(session) => {
                session.stamp(self.tick());
                true
            }
            None => false,
        }
    }

    /// Full teardown: surfaces destroyed (any mounted view detached first),
    /// connection cleaned up, entry removed. No-op if absent.
    pub fn remove(&self, doc_id: &str) -> bool {
        let session = self.sessions.lock().remove(doc_id);
        match session {
            Some(session) => {
                self.teardown(&session);
                true
            }
            None => false,
        }
    }

    /// Tear down every cached session, then clear the map.
    pub fn destroy(&self) {
        let sessions: Vec<Arc<Session>> =
            self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            self.teardown(&session);
        }
        debug!(target = "session.store", "store destroyed");
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn contains(&self, doc_id: &str) -> bool {
        self.sessions.lock().contains_key(doc_id)
    }

    pub fn doc_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn select_victim(
        &self,
        sessions: &HashMap<String, Arc<Session>>,
        just_inserted: &str,
    ) -> Option<String> {
        let stamps: Vec<SessionStamp> = sessions
            .iter()
            .map(|(doc_id, session)| SessionStamp {
                doc_id: doc_id.clone(),
                last_used: session.last_used(),
            })
            .collect();
        self.policy.select_victim(&stamps, just_inserted)
    }

    fn teardown(&self, session: &Arc<Session>) {
        session.teardown();
        self.factory.registry().cleanup(session.doc_id());
    }
}
