//! Peer set -- the server's authoritative registry of admitted peers.
//!
//! Admission is a single write-locked check-and-insert, so concurrent
//! inbound and outbound handshakes cannot overshoot capacity or admit the
//! same node twice. An admitted entry stays pending until the remote's
//! verdict arrives; pending entries hold a capacity slot but are not
//! reported as peers.

use std::collections::HashMap;
use std::sync::Arc;

use strand_protocol::{DisconnectReason, NodeId, NodeIdentity};
use tokio::sync::RwLock;

use crate::peer::{PeerHandle, PeerInfo};

struct Entry {
    handle: PeerHandle,
    established: bool,
}

#[derive(Clone)]
pub struct PeerSet {
    inner: Arc<RwLock<HashMap<NodeId, Entry>>>,
    capacity: usize,
    local: NodeId,
}

impl PeerSet {
    pub fn new(local: NodeId, capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            local,
        }
    }

    /// Admit `handle` as pending or say why not. Checks run in order:
    /// capacity, duplicate, self, shared protocols.
    ///
    /// When both nodes dial each other at once, the connection dialed by
    /// the lower node id wins on both ends. If `handle` wins against the
    /// current entry it takes the entry's place, and the loser is
    /// disconnected and returned.
    pub async fn admit(
        &self,
        handle: PeerHandle,
        no_shared_protocols: bool,
    ) -> Result<Option<PeerHandle>, DisconnectReason> {
        let node_id = handle.id();
        let mut set = self.inner.write().await;

        let supersedes = match set.get(&node_id) {
            Some(existing) => self.supersedes(&handle, &existing.handle),
            None => false,
        };
        if set.len() >= self.capacity && !supersedes {
            return Err(DisconnectReason::TooManyPeers);
        }
        if set.contains_key(&node_id) && !supersedes {
            return Err(DisconnectReason::DuplicatePeer);
        }
        if node_id == self.local {
            return Err(DisconnectReason::SelfConnect);
        }
        if no_shared_protocols {
            return Err(DisconnectReason::UselessPeer);
        }

        let inbound = handle.is_inbound();
        let replaced = set.insert(
            node_id,
            Entry {
                handle,
                established: false,
            },
        );
        let replaced = replaced.map(|old| {
            old.handle.disconnect();
            tracing::info!(peer = %node_id.short(), inbound, "set: simultaneous dial, replaced connection");
            old.handle
        });
        tracing::info!(peer = %node_id.short(), inbound, set_size = set.len(), "set: peer admitted");
        Ok(replaced)
    }

    /// The remote confirmed connection `conn_id`; report it from now on.
    /// False if the entry was removed or replaced in the meantime.
    pub async fn establish(&self, node_id: &NodeId, conn_id: usize) -> bool {
        let mut set = self.inner.write().await;
        match set.get_mut(node_id) {
            Some(entry) if entry.handle.conn_id() == conn_id => {
                entry.established = true;
                true
            }
            _ => false,
        }
    }

    /// Remove a peer, but only the entry created for connection `conn_id`.
    pub async fn remove(&self, node_id: &NodeId, conn_id: usize) -> Option<PeerHandle> {
        let mut set = self.inner.write().await;
        if set.get(node_id).map(|e| e.handle.conn_id()) != Some(conn_id) {
            return None;
        }
        let removed = set.remove(node_id);
        tracing::info!(peer = %node_id.short(), set_size = set.len(), "set: peer removed");
        removed.map(|e| e.handle)
    }

    /// Established peer by id.
    pub async fn get(&self, node_id: &NodeId) -> Option<PeerHandle> {
        self.inner
            .read()
            .await
            .get(node_id)
            .filter(|e| e.established)
            .map(|e| e.handle.clone())
    }

    /// True for pending entries as well.
    pub async fn contains(&self, node_id: &NodeId) -> bool {
        self.inner.read().await.contains_key(node_id)
    }

    /// Number of established peers.
    pub async fn len(&self) -> usize {
        self.inner.read().await.values().filter(|e| e.established).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Point-in-time copy of established member identities.
    pub async fn snapshot(&self) -> Vec<NodeIdentity> {
        self.inner
            .read()
            .await
            .values()
            .filter(|e| e.established)
            .map(|e| e.handle.identity())
            .collect()
    }

    pub async fn infos(&self) -> Vec<PeerInfo> {
        let mut infos: Vec<PeerInfo> = self
            .inner
            .read()
            .await
            .values()
            .filter(|e| e.established)
            .map(|e| e.handle.info())
            .collect();
        infos.sort_by_key(|i| i.connected_at);
        infos
    }

    /// The node that dialed the connection behind `handle`.
    fn dialer(&self, handle: &PeerHandle) -> NodeId {
        if handle.is_inbound() {
            handle.id()
        } else {
            self.local
        }
    }

    fn supersedes(&self, new: &PeerHandle, old: &PeerHandle) -> bool {
        new.is_inbound() != old.is_inbound() && self.dialer(new) < self.dialer(old)
    }
}
