//! Per-peer record.
//!
//! A [`Peer`] is owned by the repository behind a [`SharedPeer`] handle and
//! mutated by the synchronization flow. Locks are held only across short,
//! await-free sections.

use crate::message::{PeerChainState, PluginInfo};
use parking_lot::RwLock;
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A peer counts as recently pinged for this long.
pub const RECENTLY_PINGED: Duration = Duration::from_secs(120);

/// Infractions expire after this long.
pub const INFRACTION_TTL: Duration = Duration::from_secs(600);

/// Live infractions at which a peer is ignored.
pub const MAX_INFRACTIONS: usize = 3;

/// Shared handle to a peer record.
pub type SharedPeer = Arc<RwLock<Peer>>;

/// Outcome of a full chain comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationResult {
    pub our_height: u32,
    pub their_height: u32,
    pub highest_common_height: u32,
}

impl VerificationResult {
    pub fn new(our_height: u32, their_height: u32, highest_common_height: u32) -> Self {
        Self {
            our_height,
            their_height,
            highest_common_height,
        }
    }

    /// Neither chain is a prefix of the other.
    pub fn forked(&self) -> bool {
        self.highest_common_height != self.our_height
            && self.highest_common_height != self.their_height
    }
}

/// Outcome of the header-only comparison.
///
/// Without a common height a fork cannot be ruled out, so the result reads
/// as forked until a full verification says otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastVerificationResult {
    pub our_height: u32,
    pub their_height: u32,
    pub highest_common_height: Option<u32>,
}

impl FastVerificationResult {
    pub fn forked(&self) -> bool {
        match self.highest_common_height {
            Some(common) => common != self.our_height && common != self.their_height,
            None => true,
        }
    }
}

/// Mutable state of a remote node.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Identity.
    pub addr: SocketAddr,
    /// Protocol version from the last status.
    pub version: Option<String>,
    /// Last claimed chain state.
    pub state: Option<PeerChainState>,
    /// Round delegates attributed to this peer.
    pub public_keys: Vec<String>,
    /// Sibling services.
    pub plugins: BTreeMap<String, PluginInfo>,
    /// Last probe result per sibling port, `None` when unreachable.
    pub ports: BTreeMap<String, Option<Duration>>,
    /// Round-trip time of the last status request.
    pub latency: Option<Duration>,
    pub last_pinged: Option<Instant>,
    /// Needs re-verification before its state is trusted.
    pub stale: bool,
    /// Added from the static seed list.
    pub seed: bool,
    pub sequential_error_counter: u32,
    infractions: VecDeque<Instant>,
    pub verification_result: Option<VerificationResult>,
    pub fast_verification_result: Option<FastVerificationResult>,
}

impl Peer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            version: None,
            state: None,
            public_keys: Vec::new(),
            plugins: BTreeMap::new(),
            ports: BTreeMap::new(),
            latency: None,
            last_pinged: None,
            stale: false,
            seed: false,
            sequential_error_counter: 0,
            infractions: VecDeque::new(),
            verification_result: None,
            fast_verification_result: None,
        }
    }

    /// Wrap in a shared handle.
    pub fn shared(self) -> SharedPeer {
        Arc::new(RwLock::new(self))
    }

    pub fn ip(&self) -> std::net::IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Claimed height, if any status was received.
    pub fn height(&self) -> Option<u32> {
        self.state.as_ref().map(|s| s.height)
    }

    pub fn recently_pinged(&self) -> bool {
        self.last_pinged
            .map(|at| at.elapsed() < RECENTLY_PINGED)
            .unwrap_or(false)
    }

    /// Three or more infractions in the trailing window. Expired entries are
    /// dropped here.
    pub fn is_ignored(&mut self) -> bool {
        self.prune_infractions();
        self.infractions.len() >= MAX_INFRACTIONS
    }

    pub fn add_infraction(&mut self) {
        self.infractions.push_back(Instant::now());
    }

    /// Record an infraction at a given time.
    pub fn add_infraction_at(&mut self, at: Instant) {
        let pos = self.infractions.partition_point(|t| *t <= at);
        self.infractions.insert(pos, at);
    }

    /// Live infractions.
    pub fn infraction_count(&mut self) -> usize {
        self.prune_infractions();
        self.infractions.len()
    }

    fn prune_infractions(&mut self) {
        while let Some(oldest) = self.infractions.front() {
            if oldest.elapsed() >= INFRACTION_TTL {
                self.infractions.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verification_result.is_some()
    }

    pub fn is_forked(&self) -> bool {
        self.verification_result
            .map(|r| r.forked())
            .unwrap_or(false)
    }

    pub fn is_active_block_producer(&self) -> bool {
        !self.public_keys.is_empty()
    }
}
