//! Connected WebSocket peers and role-filtered broadcast.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Id assigned to a peer on registration.
pub type PeerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerRole {
    /// Control or UI connection.
    Frontend,
    /// Camera capture node.
    Camera,
}

impl PeerRole {
    /// Role named by a `client_type` value.
    pub fn from_client_type(client_type: &str) -> Option<Self> {
        match client_type {
            "frontend" => Some(PeerRole::Frontend),
            "camera_client" => Some(PeerRole::Camera),
            _ => None,
        }
    }

    pub fn client_type(&self) -> &'static str {
        match self {
            PeerRole::Frontend => "frontend",
            PeerRole::Camera => "camera_client",
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.client_type())
    }
}

/// Message queued for a peer's socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// One JPEG frame of the peer's capture feed, sent as a binary message.
    Frame(Bytes),
    Close,
}

pub type PeerSender = mpsc::UnboundedSender<Outbound>;

struct Peer {
    role: PeerRole,
    sender: PeerSender,
}

/// Registered peers, keyed by assigned id.
pub struct PeerRegistry {
    next_id: AtomicU64,
    peers: RwLock<HashMap<PeerId, Peer>>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a classified peer and return its fresh id.
    ///
    /// `welcome` is queued before the peer becomes visible, so it precedes
    /// every broadcast the peer receives.
    pub fn register<F>(&self, role: PeerRole, sender: PeerSender, welcome: F) -> PeerId
    where
        F: FnOnce(PeerId) -> String,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = sender.send(Outbound::Text(welcome(id)));
        self.peers.write().insert(id, Peer { role, sender });
        info!(peer_id = id, role = %role, "Peer registered");
        id
    }

    pub fn unregister(&self, id: PeerId) -> bool {
        let removed = self.peers.write().remove(&id).is_some();
        if removed {
            info!(peer_id = id, "Peer disconnected");
        }
        removed
    }

    pub fn role(&self, id: PeerId) -> Option<PeerRole> {
        self.peers.read().get(&id).map(|p| p.role)
    }

    /// Ids of every registered peer, ascending.
    pub fn ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn count(&self) -> usize {
        self.peers.read().len()
    }

    /// Queue `text` for every peer with `role`. Returns how many peers
    /// accepted it; peers whose writer is gone are skipped.
    pub fn broadcast(&self, role: PeerRole, text: &str) -> usize {
        let peers = self.peers.read();
        let mut delivered = 0;
        for (id, peer) in peers.iter().filter(|(_, p)| p.role == role) {
            if peer.sender.send(Outbound::Text(text.to_string())).is_ok() {
                delivered += 1;
            } else {
                debug!(peer_id = *id, "Peer writer is gone");
            }
        }
        delivered
    }

    /// Send `notice` to every peer, then ask each writer to close.
    pub fn close_all(&self, notice: &str) -> usize {
        let peers = self.peers.read();
        for peer in peers.values() {
            let _ = peer.sender.send(Outbound::Text(notice.to_string()));
            let _ = peer.sender.send(Outbound::Close);
        }
        info!(peers = peers.len(), "Closing all peers");
        peers.len()
    }
}
