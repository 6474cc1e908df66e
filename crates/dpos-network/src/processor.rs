//! Peer acceptance pipeline.

use crate::communicator::PeerCommunicator;
use crate::error::{NetworkError, NetworkResult};
use crate::events::NetworkEvent;
use crate::peer::{Peer, SharedPeer};
use dashmap::DashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Acceptance rules.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Addresses of this node, besides loopback.
    pub own_ips: Vec<IpAddr>,
    /// Never accepted.
    pub blacklist: Vec<IpAddr>,
    /// If non-empty, only these are accepted.
    pub whitelist: Vec<IpAddr>,
    /// Peers allowed per /24 subnet.
    pub max_same_subnet_peers: usize,
    /// Accept private, loopback and link-local addresses.
    pub allow_private: bool,
    /// Deadline for the acceptance ping.
    pub verify_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            own_ips: Vec::new(),
            blacklist: Vec::new(),
            whitelist: Vec::new(),
            max_same_subnet_peers: 5,
            allow_private: false,
            verify_timeout: Duration::from_secs(60),
        }
    }
}

/// Options for [`PeerProcessor::validate_and_accept_peer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptOptions {
    /// The peer comes from the static seed list.
    pub seed: bool,
    /// Log rejections at debug level.
    pub less_verbose: bool,
}

/// Admits new peers into the repository.
pub struct PeerProcessor {
    config: ProcessorConfig,
    communicator: Arc<PeerCommunicator>,
    /// Acceptances in progress.
    pending: DashSet<SocketAddr>,
}

impl PeerProcessor {
    pub fn new(config: ProcessorConfig, communicator: Arc<PeerCommunicator>) -> Self {
        Self {
            config,
            communicator,
            pending: DashSet::new(),
        }
    }

    /// Static checks on an address.
    pub fn validate_peer_address(&self, addr: &SocketAddr, seed: bool) -> Result<(), String> {
        let ip = addr.ip();
        let own_port = self.communicator.config().own_port;

        if addr.port() == own_port && (ip.is_loopback() || self.config.own_ips.contains(&ip)) {
            return Err("own address".into());
        }
        if addr.port() == 0 {
            return Err("port 0".into());
        }
        if self.config.blacklist.contains(&ip) {
            return Err("blacklisted".into());
        }
        if !self.config.whitelist.is_empty() && !self.config.whitelist.contains(&ip) {
            return Err("not whitelisted".into());
        }
        if !seed && !self.config.allow_private && !is_routable(ip) {
            return Err("not routable".into());
        }
        if self.communicator.repository().has_peer(addr) {
            return Err("already known".into());
        }
        if !seed
            && self.communicator.repository().same_subnet_count(ip) >= self.config.max_same_subnet_peers
        {
            return Err("subnet full".into());
        }
        Ok(())
    }

    /// Validate `addr`, verify it with a full ping and add it to the peer
    /// set.
    pub async fn validate_and_accept_peer(
        &self,
        addr: SocketAddr,
        options: AcceptOptions,
    ) -> NetworkResult<SharedPeer> {
        if let Err(reason) = self.validate_peer_address(&addr, options.seed) {
            if options.less_verbose {
                debug!(peer = %addr, reason = %reason, "Rejected peer");
            } else {
                info!(peer = %addr, reason = %reason, "Rejected peer");
            }
            return Err(NetworkError::PeerRejected(format!("{}: {}", addr, reason)));
        }

        if !self.pending.insert(addr) {
            return Err(NetworkError::PeerRejected(format!("{}: already pending", addr)));
        }
        let result = self.accept(addr, options).await;
        self.pending.remove(&addr);
        result
    }

    async fn accept(&self, addr: SocketAddr, options: AcceptOptions) -> NetworkResult<SharedPeer> {
        let mut peer = Peer::new(addr);
        peer.seed = options.seed;
        let peer = peer.shared();

        let milestones = self.communicator.chain().milestones.clone();
        let ping = self
            .communicator
            .ping(&peer, self.config.verify_timeout, milestones.as_ref(), true, false)
            .await;

        if let Err(e) = ping {
            self.communicator.disconnect(addr).await;
            if options.less_verbose {
                debug!(peer = %addr, error = %e, "Could not accept peer");
            } else {
                info!(peer = %addr, error = %e, "Could not accept peer");
            }
            return Err(e);
        }

        self.communicator.repository().add_peer(peer.clone());
        self.communicator.events().publish(NetworkEvent::PeerAdded(addr));
        if !options.less_verbose {
            info!(peer = %addr, "Accepted new peer");
        }
        Ok(peer)
    }
}

/// Whether `ip` is reachable over the public internet.
pub fn is_routable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation())
        }
        IpAddr::V6(v6) => {
            let unique_local = (v6.segments()[0] & 0xfe00) == 0xfc00;
            let link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || unique_local || link_local)
        }
    }
}
