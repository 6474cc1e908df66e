//! Fork detection by delegate-weighted quorum.
//!
//! Peers vote with the number of round delegates they host. Relay peers
//! (no delegates, ahead of us) count with weight one, and only when the
//! delegate-backed weight alone cannot reach quorum. No fork is reported
//! below quorum, whatever the individual peers say.

use dpos_network::{SharedPeer, VerificationResult};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tracing::{debug, info};

/// Most blocks rolled back per decision.
pub const MAX_ROLLBACK: u32 = 5000;

/// Outcome of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStatus {
    pub forked: bool,
    pub blocks_to_rollback: Option<u32>,
}

impl NetworkStatus {
    pub fn not_forked() -> Self {
        Self {
            forked: false,
            blocks_to_rollback: None,
        }
    }

    pub fn rollback(blocks: u32) -> Self {
        Self {
            forked: true,
            blocks_to_rollback: Some(blocks),
        }
    }
}

/// A verified peer's say in the health check.
#[derive(Debug, Clone, Copy)]
pub struct PeerVote {
    pub addr: SocketAddr,
    /// Claimed height.
    pub height: u32,
    pub verification: VerificationResult,
    /// Current round delegates the peer hosts.
    pub delegates: usize,
}

/// Median of the heights peers claim, 0 without any claims.
pub fn network_height(peers: &[SharedPeer]) -> u32 {
    let mut heights: Vec<u32> = peers.iter().filter_map(|p| p.read().height()).collect();
    heights.sort_unstable();
    heights.get(heights.len() / 2).copied().unwrap_or(0)
}

/// Votes needed out of `active_delegates`.
pub fn quorum(active_delegates: u32) -> usize {
    (active_delegates / 2 + 1) as usize
}

/// Decide whether we are on a fork and how far to roll back.
pub fn evaluate(
    our_height: u32,
    active_delegates: u32,
    own_weight: usize,
    votes: &[PeerVote],
) -> NetworkStatus {
    let quorum = quorum(active_delegates);

    let mut included: Vec<(&PeerVote, usize)> = votes
        .iter()
        .filter(|v| v.delegates > 0)
        .map(|v| (v, v.delegates))
        .collect();
    let mut weight = own_weight + included.iter().map(|(_, w)| w).sum::<usize>();

    if weight < quorum {
        let relays: Vec<_> = votes
            .iter()
            .filter(|v| v.delegates == 0 && v.height > our_height)
            .map(|v| (v, 1))
            .collect();
        weight += relays.len();
        included.extend(relays);
    }

    if weight < quorum {
        debug!(weight, quorum, "Not enough verified weight to judge forks");
        return NetworkStatus::not_forked();
    }

    let mut fork_votes: BTreeMap<u32, usize> = BTreeMap::new();
    for (vote, w) in &included {
        if vote.verification.forked() {
            *fork_votes
                .entry(vote.verification.highest_common_height)
                .or_default() += w;
        }
    }

    // Most votes wins; ties go to the higher common height.
    let Some((&fork_height, &fork_weight)) = fork_votes
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(b.0)))
    else {
        return NetworkStatus::not_forked();
    };

    let canonical_weight = own_weight
        + included
            .iter()
            .filter(|(v, _)| {
                !v.verification.forked() || v.verification.highest_common_height > fork_height
            })
            .map(|(_, w)| w)
            .sum::<usize>();

    if fork_weight <= canonical_weight {
        debug!(fork_height, fork_weight, canonical_weight, "Fork outvoted");
        return NetworkStatus::not_forked();
    }

    let blocks = our_height.saturating_sub(fork_height).min(MAX_ROLLBACK);
    info!(
        fork_height,
        fork_weight,
        canonical_weight,
        blocks_to_rollback = blocks,
        "Network reports a fork"
    );
    NetworkStatus::rollback(blocks)
}
