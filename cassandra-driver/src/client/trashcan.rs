//! Idle connections moved out of the active pool.
//!
//! A connection is parked here when its host's pool grows past the core size
//! and it has little traffic left. It is handed back to the pool if the host
//! needs a connection again before the next sweep, otherwise the sweep frees it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use super::ConnectionsCollection;
use crate::network::Connection;
use crate::Endpoint;

#[derive(Default)]
pub(crate) struct Trashcan {
    connections: Mutex<HashMap<Endpoint, ConnectionsCollection>>,
}

impl Trashcan {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<Endpoint, ConnectionsCollection>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn put(&self, connection: Arc<Connection>) {
        trace!(
            connection_id = %connection.id(),
            endpoint = %connection.endpoint(),
            "Moving connection to trashcan"
        );
        self.connections()
            .entry(connection.endpoint())
            .or_default()
            .insert(connection.id(), connection);
    }

    /// Takes any connection to `endpoint` out of the trashcan.
    pub(crate) fn recycle(&self, endpoint: Endpoint) -> Option<Arc<Connection>> {
        let mut connections = self.connections();
        let for_endpoint = connections.get_mut(&endpoint)?;
        let id = *for_endpoint.keys().next()?;
        let connection = for_endpoint.remove(&id);
        if for_endpoint.is_empty() {
            connections.remove(&endpoint);
        }
        connection
    }

    /// Takes out every connection with no request in flight, and every
    /// connection that is no longer usable.
    pub(crate) fn take_sweepable(&self) -> Vec<Arc<Connection>> {
        let mut connections = self.connections();
        let mut swept = Vec::new();
        for for_endpoint in connections.values_mut() {
            for_endpoint.retain(|_, connection| {
                if connection.is_empty() || !connection.is_healthy() {
                    swept.push(Arc::clone(connection));
                    false
                } else {
                    true
                }
            });
        }
        connections.retain(|_, for_endpoint| !for_endpoint.is_empty());
        swept
    }

    pub(crate) fn remove_endpoint(&self, endpoint: Endpoint) -> Vec<Arc<Connection>> {
        self.connections()
            .remove(&endpoint)
            .map(|for_endpoint| for_endpoint.into_values().collect())
            .unwrap_or_default()
    }

    pub(crate) fn remove_all(&self) -> Vec<Arc<Connection>> {
        self.connections()
            .drain()
            .flat_map(|(_, for_endpoint)| for_endpoint.into_values())
            .collect()
    }

    pub(crate) fn for_each(&self, mut f: impl FnMut(&Arc<Connection>)) {
        self.connections()
            .values()
            .flat_map(|for_endpoint| for_endpoint.values())
            .for_each(&mut f);
    }

    pub(crate) fn len(&self) -> usize {
        self.connections().values().map(HashMap::len).sum()
    }
}
