//! The set of known peers.

use crate::peer::{Peer, SharedPeer};
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, info};

/// Known peers and the delegates attributed to them.
pub struct PeerRepository {
    peers: DashMap<SocketAddr, SharedPeer>,
    /// Delegate public key -> hosting peer.
    delegates: DashMap<String, SocketAddr>,
}

impl PeerRepository {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
            delegates: DashMap::new(),
        }
    }

    /// All peers, in no particular order.
    pub fn peers(&self) -> Vec<SharedPeer> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.peers.iter().map(|e| *e.key()).collect()
    }

    pub fn peer(&self, addr: &SocketAddr) -> Option<SharedPeer> {
        self.peers.get(addr).map(|e| e.value().clone())
    }

    pub fn has_peer(&self, addr: &SocketAddr) -> bool {
        self.peers.contains_key(addr)
    }

    /// Insert or replace a peer.
    pub fn set_peer(&self, peer: Peer) -> SharedPeer {
        let addr = peer.addr;
        let shared = peer.shared();
        self.peers.insert(addr, shared.clone());
        debug!(peer = %addr, total = self.peers.len(), "Peer stored");
        shared
    }

    /// Insert an existing handle.
    pub fn add_peer(&self, peer: SharedPeer) {
        let addr = peer.read().addr;
        self.peers.insert(addr, peer);
        debug!(peer = %addr, total = self.peers.len(), "Peer stored");
    }

    /// Remove a peer and drop its delegate attributions.
    pub fn forget_peer(&self, addr: &SocketAddr) -> Option<SharedPeer> {
        let removed = self.peers.remove(addr).map(|(_, peer)| peer);
        if removed.is_some() {
            self.delegates.retain(|_, host| host != addr);
            info!(peer = %addr, remaining = self.peers.len(), "Peer removed");
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peers sharing the /24 (IPv4) or /64 (IPv6) of `ip`.
    pub fn same_subnet_count(&self, ip: IpAddr) -> usize {
        self.peers.iter().filter(|e| same_subnet(e.key().ip(), ip)).count()
    }

    /// Peer currently credited with `public_key`.
    pub fn delegate_host(&self, public_key: &str) -> Option<SocketAddr> {
        self.delegates.get(public_key).map(|e| *e.value())
    }

    /// Credit `public_key` to `peer`, taking it away from any previous host.
    pub fn assign_delegate(&self, public_key: &str, peer: &SharedPeer) {
        let addr = peer.read().addr;
        let previous = self.delegates.insert(public_key.to_string(), addr);

        if let Some(previous) = previous.filter(|p| *p != addr) {
            if let Some(old) = self.peer(&previous) {
                old.write().public_keys.retain(|k| k != public_key);
            }
            debug!(delegate = %public_key, from = %previous, to = %addr, "Delegate reattributed");
        }

        let mut guard = peer.write();
        if !guard.public_keys.iter().any(|k| k == public_key) {
            guard.public_keys.push(public_key.to_string());
        }
    }
}

impl Default for PeerRepository {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether two addresses share a /24 (IPv4) or /64 (IPv6) prefix.
pub fn same_subnet(a: IpAddr, b: IpAddr) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a.octets()[..3] == b.octets()[..3],
        (IpAddr::V6(a), IpAddr::V6(b)) => a.segments()[..4] == b.segments()[..4],
        _ => false,
    }
}
