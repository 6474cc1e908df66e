//! Chain verification of a peer's claimed state.
//!
//! A [`PeerVerifier`] is built for one ping and runs a pipeline with early
//! exits:
//!
//! 1. check the claimed header on its own
//! 2. accept if we hold the peer's highest block
//! 3. 8-ary search for the highest common block
//! 4. verify the peer's blocks after the common block, up to the end of
//!    that round
//!
//! `Ok(None)` means "could not verify" and is not a verdict either way.
//! Every step runs against one deadline; passing it aborts with
//! [`NetworkError::Timeout`].

use crate::communicator::{GetBlocksOptions, PeerCommunicator};
use crate::error::{NetworkError, NetworkResult};
use crate::message::{PeerChainState, MAX_BLOCKS_IN_REPLY};
use crate::peer::{FastVerificationResult, SharedPeer, VerificationResult};
use dpos_chain::{BlockCrypto, ChainStore, DelegateProvider, Milestones, Slots};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Heights probed per common-block search step.
pub const SEARCH_ARITY: usize = 8;

/// Chain collaborators shared by the communicator and verifier.
#[derive(Clone)]
pub struct ChainContext {
    pub store: Arc<dyn ChainStore>,
    pub delegates: Arc<dyn DelegateProvider>,
    pub crypto: Arc<dyn BlockCrypto>,
    pub milestones: Arc<Milestones>,
    pub slots: Slots,
}

/// Up to [`SEARCH_ARITY`] evenly spaced heights in `[low, high]`, always
/// including both ends, ascending.
pub fn probe_heights(low: u32, high: u32) -> Vec<u32> {
    if high < low {
        return Vec::new();
    }
    let span = (high - low) as u64;
    if span < SEARCH_ARITY as u64 {
        return (low..=high).collect();
    }
    let steps = (SEARCH_ARITY - 1) as u64;
    let mut probes: Vec<u32> = (0..SEARCH_ARITY as u64)
        .map(|i| low + (i * span / steps) as u32)
        .collect();
    probes.dedup();
    probes
}

/// Verifies one peer's claimed chain state.
pub struct PeerVerifier<'a> {
    communicator: &'a PeerCommunicator,
    peer: SharedPeer,
    addr: SocketAddr,
    deadline: Instant,
}

impl<'a> PeerVerifier<'a> {
    pub fn new(communicator: &'a PeerCommunicator, peer: SharedPeer, deadline: Instant) -> Self {
        let addr = peer.read().addr;
        Self {
            communicator,
            peer,
            addr,
            deadline,
        }
    }

    fn chain(&self) -> &ChainContext {
        self.communicator.chain()
    }

    fn check_deadline(&self, step: &str) -> NetworkResult<()> {
        if Instant::now() >= self.deadline {
            return Err(NetworkError::Timeout(format!(
                "verification of {} past deadline during {}",
                self.addr, step
            )));
        }
        Ok(())
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Full verification.
    pub async fn check_state(
        &self,
        claimed: &PeerChainState,
    ) -> NetworkResult<Option<VerificationResult>> {
        let our_height = self.chain().store.last_height().await?;

        if !self.check_state_header(claimed, our_height).await? {
            return Ok(None);
        }

        if self.we_have_peers_highest_block(claimed, our_height).await? {
            return Ok(Some(VerificationResult::new(
                our_height,
                claimed.height,
                claimed.height,
            )));
        }

        let high = our_height.min(claimed.height);
        let Some(common) = self.find_highest_common_block_height(1, high).await? else {
            return Ok(None);
        };

        if !self.verify_peer_blocks(common + 1, claimed.height).await? {
            return Ok(None);
        }

        let result = VerificationResult::new(our_height, claimed.height, common);
        if result.forked() {
            info!(
                peer = %self.addr,
                our_height,
                their_height = claimed.height,
                common,
                "Peer is on a fork"
            );
        }
        Ok(Some(result))
    }

    /// Header check and tip comparison only.
    pub async fn check_state_fast(
        &self,
        claimed: &PeerChainState,
    ) -> NetworkResult<Option<FastVerificationResult>> {
        let our_height = self.chain().store.last_height().await?;

        if !self.check_state_header(claimed, our_height).await? {
            return Ok(None);
        }

        let highest_common_height = self
            .we_have_peers_highest_block(claimed, our_height)
            .await?
            .then_some(claimed.height);

        Ok(Some(FastVerificationResult {
            our_height,
            their_height: claimed.height,
            highest_common_height,
        }))
    }

    /// The claimed header is consistent with the claimed height and signed
    /// by someone allowed to sign it.
    pub async fn check_state_header(
        &self,
        claimed: &PeerChainState,
        our_height: u32,
    ) -> NetworkResult<bool> {
        self.check_deadline("state header")?;
        let header = &claimed.header;

        if header.height != claimed.height {
            debug!(
                peer = %self.addr,
                claimed = claimed.height,
                header = header.height,
                "Claimed height does not match header"
            );
            return Ok(false);
        }

        if let Some(ours) = self.chain().store.block_at_height(claimed.height).await? {
            if ours == *header {
                return Ok(true);
            }
        }

        if claimed.height < our_height {
            let round = self.chain().milestones.round_info(claimed.height);
            let delegates = self.chain().delegates.active_delegates(&round).await?;
            self.check_deadline("round delegates")?;
            if !delegates.contains(&header.generator_public_key) {
                debug!(
                    peer = %self.addr,
                    height = claimed.height,
                    generator = %header.generator_public_key,
                    "Header not signed by a round delegate"
                );
                return Ok(false);
            }
        }

        let valid = self.chain().crypto.verify_block(header);
        if !valid {
            debug!(peer = %self.addr, height = claimed.height, "Header signature invalid");
        }
        Ok(valid)
    }

    /// We hold the peer's tip, so the peer is on our chain, at or behind us.
    pub async fn we_have_peers_highest_block(
        &self,
        claimed: &PeerChainState,
        our_height: u32,
    ) -> NetworkResult<bool> {
        self.check_deadline("highest block")?;
        if claimed.height > our_height {
            return Ok(false);
        }
        let ours = self.chain().store.block_at_height(claimed.height).await?;
        Ok(matches!(ours, Some(block) if block.id == claimed.header.id))
    }

    /// 8-ary search for the highest height in `[low, high]` where both
    /// chains hold the same block.
    ///
    /// Returns `None` if the peer's answers contradict the probes it was
    /// given.
    pub async fn find_highest_common_block_height(
        &self,
        mut low: u32,
        mut high: u32,
    ) -> NetworkResult<Option<u32>> {
        loop {
            self.check_deadline("common block search")?;

            let probes = probe_heights(low, high);
            let ours = self.chain().store.blocks_at_heights(&probes).await?;
            let mut height_by_id = HashMap::with_capacity(probes.len());
            let mut ids = Vec::with_capacity(probes.len());
            for block in ours.into_iter().flatten() {
                height_by_id.insert(block.id.clone(), block.height);
                ids.push(block.id);
            }

            debug!(peer = %self.addr, low, high, probes = ids.len(), "Searching common block");

            let reply = match self
                .communicator
                .has_common_blocks(&self.peer, &ids, self.remaining())
                .await
            {
                Ok(reply) => reply,
                Err(e @ NetworkError::Timeout(_)) => return Err(e),
                Err(e) => {
                    info!(peer = %self.addr, error = %e, "Failed to find common block");
                    return Ok(None);
                }
            };

            let Some(common) = reply else {
                info!(peer = %self.addr, low, high, "Peer has none of the probed blocks");
                return Ok(None);
            };

            let height = match height_by_id.get(&common.id) {
                Some(&height) if height == common.height && height >= low => height,
                _ => {
                    info!(
                        peer = %self.addr,
                        id = %common.id,
                        height = common.height,
                        "Bogus common block reply"
                    );
                    return Ok(None);
                }
            };

            if height == high {
                return Ok(Some(height));
            }

            let next = probes
                .iter()
                .copied()
                .find(|&p| p > height)
                .unwrap_or(high);
            if next == height + 1 {
                return Ok(Some(height));
            }
            low = height;
            high = next - 1;
        }
    }

    /// Verify the peer's blocks from `start` to the earlier of its claimed
    /// height and the end of the round containing `start`.
    pub async fn verify_peer_blocks(&self, start: u32, claimed_height: u32) -> NetworkResult<bool> {
        if start > claimed_height {
            return Ok(true);
        }

        let round = self.chain().milestones.round_info(start);
        let end = claimed_height.min(round.last_height());
        let delegates = self.chain().delegates.active_delegates(&round).await?;

        let mut previous_id = self
            .chain()
            .store
            .block_at_height(start - 1)
            .await?
            .map(|b| b.id);
        let mut height = start;

        while height <= end {
            self.check_deadline("peer blocks")?;

            let limit = (end - height + 1).min(MAX_BLOCKS_IN_REPLY as u32);
            let options = GetBlocksOptions::new(height - 1, limit)
                .headers_only()
                .with_timeout(self.remaining());
            let blocks = match self.communicator.get_peer_blocks(&self.peer, options).await {
                Ok(blocks) => blocks,
                Err(e @ NetworkError::Timeout(_)) => return Err(e),
                Err(e) => {
                    info!(peer = %self.addr, height, error = %e, "Failed to fetch peer blocks");
                    return Ok(false);
                }
            };

            if blocks.is_empty() {
                info!(peer = %self.addr, height, "Peer returned no blocks");
                return Ok(false);
            }

            for block in blocks.into_iter().take((end - height + 1) as usize) {
                let header = &block.header;
                if header.height != height {
                    info!(peer = %self.addr, expected = height, got = header.height, "Wrong block height");
                    return Ok(false);
                }
                if previous_id.is_some() && header.previous_block != previous_id {
                    info!(peer = %self.addr, height, "Block does not link to its parent");
                    return Ok(false);
                }
                if !delegates.contains(&header.generator_public_key) {
                    info!(peer = %self.addr, height, "Block not forged by a round delegate");
                    return Ok(false);
                }
                if !self.chain().crypto.verify_block(header) {
                    info!(peer = %self.addr, height, "Block signature invalid");
                    return Ok(false);
                }
                previous_id = Some(header.id.clone());
                height += 1;
            }
        }
        Ok(true)
    }
}
