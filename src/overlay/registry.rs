//! Connection registry
//!
//! Live connections are indexed by id and by remote identity. A dropped
//! connection leaves the live set immediately but stays parked until its
//! two-phase shutdown destroys it, so queued drains can still reach it.

use crate::identity::PeerIdentity;
use crate::overlay::connection::{Connection, ConnectionId, PeerRole};
use std::collections::HashMap;

#[derive(Default)]
pub struct ConnectionRegistry {
    live: HashMap<ConnectionId, Connection>,
    by_remote: HashMap<PeerIdentity, ConnectionId>,
    closing: HashMap<ConnectionId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live connection; refuses a second one to the same remote
    pub fn add(&mut self, connection: Connection) -> Result<(), Connection> {
        let remote = *connection.remote();
        if self.by_remote.contains_key(&remote) {
            return Err(connection);
        }
        self.by_remote.insert(remote, connection.id());
        self.live.insert(connection.id(), connection);
        Ok(())
    }

    /// Live or closing connection
    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        match self.live.get_mut(&id) {
            Some(connection) => Some(connection),
            None => self.closing.get_mut(&id),
        }
    }

    pub fn live(&self, id: ConnectionId) -> Option<&Connection> {
        self.live.get(&id)
    }

    pub fn by_remote(&self, remote: &PeerIdentity) -> Option<&Connection> {
        self.by_remote.get(remote).and_then(|id| self.live.get(id))
    }

    pub fn by_remote_mut(&mut self, remote: &PeerIdentity) -> Option<&mut Connection> {
        let id = self.by_remote.get(remote)?;
        self.live.get_mut(id)
    }

    pub fn is_connected(&self, remote: &PeerIdentity) -> bool {
        self.by_remote.contains_key(remote)
    }

    /// Move a live connection to the closing set
    pub fn forget(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        let connection = self.live.remove(&id)?;
        self.by_remote.remove(connection.remote());
        log::trace!("Registry forgot {}", connection);
        Some(self.closing.entry(id).or_insert(connection))
    }

    /// Remove a connection for good
    pub fn destroy(&mut self, id: ConnectionId) -> Option<Connection> {
        if let Some(connection) = self.closing.remove(&id) {
            return Some(connection);
        }
        let connection = self.live.remove(&id)?;
        self.by_remote.remove(connection.remote());
        Some(connection)
    }

    pub fn live_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.live.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn closing_count(&self) -> usize {
        self.closing.len()
    }

    pub fn count_role(&self, role: PeerRole) -> usize {
        self.live.values().filter(|c| c.role() == role).count()
    }

    /// Remotes of authenticated live connections, sorted
    pub fn authenticated_peers(&self) -> Vec<PeerIdentity> {
        let mut peers: Vec<_> = self
            .live
            .values()
            .filter(|c| c.is_authenticated())
            .map(|c| *c.remote())
            .collect();
        peers.sort();
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LocalBroker;
    use crate::overlay::connection::ConnectionContext;
    use crate::overlay::main_thread::{MainThread, Task};
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn peer(s: &str) -> PeerIdentity {
        PeerIdentity::parse(s).unwrap()
    }

    fn ctx() -> (ConnectionContext, UnboundedReceiver<Task>) {
        let (main, tasks) = MainThread::channel();
        let ctx = ConnectionContext {
            broker: Arc::new(LocalBroker::new()),
            channel: "overlay".to_string(),
            main,
            idle_timeout: None,
        };
        (ctx, tasks)
    }

    #[test]
    fn test_add_forget_destroy() {
        let (ctx, _tasks) = ctx();
        let me = peer("AAAAAAAA");
        let b = peer("BBBBBBBB");
        let mut registry = ConnectionRegistry::new();

        registry
            .add(Connection::initiate(&ctx, ConnectionId(1), me, b))
            .ok()
            .unwrap();
        assert!(registry
            .add(Connection::initiate(&ctx, ConnectionId(2), me, b))
            .is_err());
        registry
            .add(Connection::accept(&ctx, ConnectionId(3), me, peer("CCCCCCCC")))
            .ok()
            .unwrap();

        assert!(registry.is_connected(&b));
        assert_eq!(registry.count_role(PeerRole::WeInitiated), 1);
        assert_eq!(registry.count_role(PeerRole::TheyInitiated), 1);
        assert_eq!(registry.authenticated_peers(), vec![peer("CCCCCCCC")]);

        assert!(registry.forget(ConnectionId(1)).is_some());
        assert!(!registry.is_connected(&b));
        assert_eq!(registry.live_ids(), vec![ConnectionId(3)]);
        assert_eq!(registry.closing_count(), 1);
        assert!(registry.get_mut(ConnectionId(1)).is_some());
        assert!(registry.live(ConnectionId(1)).is_none());

        assert!(registry.destroy(ConnectionId(1)).is_some());
        assert!(registry.get_mut(ConnectionId(1)).is_none());
        assert_eq!(registry.closing_count(), 0);
        assert!(registry.forget(ConnectionId(1)).is_none());
    }
}
