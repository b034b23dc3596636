//! Shared connections keyed by `user@host:port`.
//!
//! A cached connection is handed out again only if it still answers a
//! keepalive. Otherwise a fresh connection replaces the entry; entries are
//! never reconnected in place. When two callers connect the same key at
//! once, the first to register wins and the other connection is closed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::client::connection::Connection;
use crate::config::types::{ConnectionKey, ConnectionParams};
use crate::error::SshfsError;
use crate::session::ssh2::Ssh2Connector;
use crate::session::Connector;

pub struct Registry {
    connector: Arc<dyn Connector>,
    entries: Mutex<HashMap<ConnectionKey, Arc<Connection>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(Ssh2Connector))
    }

    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ConnectionKey, Arc<Connection>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return a live connection for `params`, connecting a new one if the
    /// cached entry is missing or fails validation.
    ///
    /// Connecting happens outside the registry lock, so a slow server does not
    /// block lookups for other hosts.
    pub fn get_or_connect(&self, params: ConnectionParams) -> Result<Arc<Connection>, SshfsError> {
        let key = params.key();
        let cached = self.entries().get(&key).cloned();

        if let Some(conn) = &cached {
            if conn.is_connected() && conn.validate_connection() {
                tracing::debug!(key = %key, "Reusing cached connection");
                return Ok(Arc::clone(conn));
            }
            tracing::info!(key = %key, "Cached connection is dead, replacing it");
        }

        let fresh = Arc::new(Connection::with_connector(params, Arc::clone(&self.connector)));
        fresh.connect()?;

        let mut entries = self.entries();
        if let Some(current) = entries.get(&key) {
            let raced = !cached.as_ref().is_some_and(|c| Arc::ptr_eq(c, current));
            if raced && current.is_connected() {
                let winner = Arc::clone(current);
                drop(entries);
                tracing::debug!(key = %key, "Key registered concurrently, dropping duplicate connection");
                fresh.disconnect();
                return Ok(winner);
            }
        }
        let replaced = entries.insert(key.clone(), Arc::clone(&fresh));
        drop(entries);
        if let Some(old) = replaced {
            old.disconnect();
        }
        tracing::debug!(key = %key, "Registered new connection");
        Ok(fresh)
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<Arc<Connection>> {
        self.entries().get(key).cloned()
    }

    /// Forget `key` without disconnecting; current holders keep working.
    pub fn remove(&self, key: &ConnectionKey) -> Option<Arc<Connection>> {
        self.entries().remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Disconnect and forget every connection.
    pub fn clear(&self) {
        let drained: Vec<_> = self.entries().drain().collect();
        for (key, conn) in drained {
            tracing::debug!(key = %key, "Closing registered connection");
            conn.disconnect();
        }
    }
}
