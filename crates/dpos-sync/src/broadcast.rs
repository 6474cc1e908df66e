//! Block and transaction relay.

use dpos_chain::{Block, Transaction};
use dpos_network::PeerCommunicator;
use futures::future::join_all;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A repeat broadcast of the same block waits this long after the first.
pub const BROADCAST_WINDOW: Duration = Duration::from_millis(500);

/// Peers a transaction batch is relayed to.
pub const MAX_PEERS_BROADCAST: usize = 20;

#[derive(Debug, Clone)]
struct BroadcastRecord {
    id: String,
    at: Instant,
    from_forger: bool,
}

/// Relays blocks and transactions to peers.
pub struct Broadcaster {
    communicator: Arc<PeerCommunicator>,
    window: Duration,
    max_peers_broadcast: usize,
    last_block: Mutex<Option<BroadcastRecord>>,
}

impl Broadcaster {
    pub fn new(communicator: Arc<PeerCommunicator>) -> Self {
        Self {
            communicator,
            window: BROADCAST_WINDOW,
            max_peers_broadcast: MAX_PEERS_BROADCAST,
            last_block: Mutex::new(None),
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_max_peers_broadcast(mut self, max: usize) -> Self {
        self.max_peers_broadcast = max;
        self
    }

    /// Post `block` to every peer. Returns the number of peers that took it.
    ///
    /// If the same block went out less than the window ago from a
    /// non-forging path, waits for the window to pass and sends only if our
    /// tip is still at the block's height.
    pub async fn broadcast_block(&self, block: &Block, from_forger: bool) -> usize {
        let wait = {
            let mut last = self.last_block.lock();
            let wait = match last.as_ref() {
                Some(record) if record.id == block.id() && !record.from_forger => {
                    self.window.checked_sub(record.at.elapsed())
                }
                _ => None,
            };
            if wait.is_none() {
                *last = Some(BroadcastRecord {
                    id: block.id().to_string(),
                    at: Instant::now(),
                    from_forger,
                });
            }
            wait
        };

        if let Some(wait) = wait {
            debug!(id = %block.id(), wait_ms = wait.as_millis() as u64, "Delaying repeat broadcast");
            tokio::time::sleep(wait).await;
            match self.communicator.chain().store.last_height().await {
                Ok(height) if height == block.height() => {}
                Ok(height) => {
                    debug!(id = %block.id(), tip = height, "Tip moved on, skipping broadcast");
                    return 0;
                }
                Err(e) => {
                    warn!(error = %e, "Could not read tip, skipping broadcast");
                    return 0;
                }
            }
            *self.last_block.lock() = Some(BroadcastRecord {
                id: block.id().to_string(),
                at: Instant::now(),
                from_forger,
            });
        }

        let peers = self.communicator.repository().peers();
        info!(
            id = %block.id(),
            height = block.height(),
            transactions = block.transactions.len(),
            peers = peers.len(),
            "Broadcasting block"
        );
        let results = join_all(peers.iter().map(|p| self.communicator.post_block(p, block))).await;
        results.iter().filter(|r| r.is_ok()).count()
    }

    /// Post `transactions` to a random sample of peers. Returns the number
    /// of peers that accepted them.
    pub async fn broadcast_transactions(&self, transactions: &[Transaction]) -> usize {
        if transactions.is_empty() {
            return 0;
        }
        let mut peers = self.communicator.repository().peers();
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(self.max_peers_broadcast);

        debug!(count = transactions.len(), peers = peers.len(), "Broadcasting transactions");
        let results = join_all(
            peers
                .iter()
                .map(|p| self.communicator.post_transactions(p, transactions)),
        )
        .await;
        results.iter().filter(|r| r.is_ok()).count()
    }
}
