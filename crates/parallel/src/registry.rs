use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("session {0} already exists")]
    Duplicate(String),

    #[error("registry is closed")]
    Closed,
}

/// Thread-safe map of active sessions keyed by transfer id.
///
/// Sessions are shared as `Arc<S>` so handlers keep working on a session
/// after it has been removed; removal only stops new lookups from finding it.
pub struct SessionRegistry<S> {
    inner: Mutex<Inner<S>>,
}

struct Inner<S> {
    sessions: HashMap<String, Arc<S>>,
    closed: bool,
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                closed: false,
            }),
        }
    }
}

impl<S> SessionRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, session: Arc<S>) -> Result<(), RegistryError> {
        let id = id.into();
        let mut inner = self.lock();
        if inner.closed {
            return Err(RegistryError::Closed);
        }
        if inner.sessions.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        inner.sessions.insert(id, session);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<S>> {
        self.lock().sessions.get(id).cloned()
    }

    /// Removes `id`. Removing a missing id is a no-op.
    pub fn remove(&self, id: &str) -> Option<Arc<S>> {
        self.lock().sessions.remove(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuses further inserts and hands back every live session.
    pub fn close(&self) -> Vec<Arc<S>> {
        let mut inner = self.lock();
        inner.closed = true;
        inner.sessions.drain().map(|(_, s)| s).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, Inner<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
