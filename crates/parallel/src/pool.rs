use std::sync::{Arc, PoisonError, RwLock};

/// Fixed set of clients, one per lane.
///
/// Lane `i` always talks through client `i % len`. The pool owns the clients;
/// [`close`](Self::close) releases them and leaves the pool empty.
pub struct ConnectionPool<T: ?Sized> {
    clients: RwLock<Vec<Arc<T>>>,
}

impl<T: ?Sized> ConnectionPool<T> {
    pub fn new(clients: Vec<Arc<T>>) -> Self {
        Self {
            clients: RwLock::new(clients),
        }
    }

    /// Client for `connection_id`, or `None` once the pool is closed.
    pub fn client(&self, connection_id: usize) -> Option<Arc<T>> {
        let clients = self.clients.read().unwrap_or_else(PoisonError::into_inner);
        if clients.is_empty() {
            return None;
        }
        Some(Arc::clone(&clients[connection_id % clients.len()]))
    }

    pub fn len(&self) -> usize {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops the pool's references. Clients still held by running lanes live
    /// until those lanes finish.
    pub fn close(&self) -> usize {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        let closed = clients.len();
        clients.clear();
        closed
    }
}
