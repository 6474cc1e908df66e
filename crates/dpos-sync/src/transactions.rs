//! Unconfirmed transaction download.

use dpos_chain::Transaction;
use dpos_network::{PeerCommunicator, RecentTable, SharedPeer};
use futures::future::join_all;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Transactions seen within this window are dropped as duplicates.
pub const TRANSACTION_DEDUP_TTL: Duration = Duration::from_secs(30);

/// Peers asked per download.
pub const TRANSACTION_PEERS: usize = 4;

const RECENT_TRANSACTIONS_SIZE: usize = 50_000;

/// Pulls pools from up-to-date peers.
pub struct TransactionDownloader {
    communicator: Arc<PeerCommunicator>,
    recent: RecentTable<String>,
    sample: usize,
}

impl TransactionDownloader {
    pub fn new(communicator: Arc<PeerCommunicator>) -> Self {
        Self::with_ttl(communicator, TRANSACTION_DEDUP_TTL)
    }

    pub fn with_ttl(communicator: Arc<PeerCommunicator>, ttl: Duration) -> Self {
        Self {
            communicator,
            recent: RecentTable::new(RECENT_TRANSACTIONS_SIZE, ttl),
            sample: TRANSACTION_PEERS,
        }
    }

    /// Transactions not seen in the dedup window, from a sample of
    /// non-forked peers at or above our height.
    pub async fn download_transactions(&self) -> Vec<Transaction> {
        let our_height = match self.communicator.chain().store.last_height().await {
            Ok(height) => height,
            Err(e) => {
                warn!(error = %e, "Could not read tip for transaction download");
                return Vec::new();
            }
        };

        let mut peers: Vec<SharedPeer> = self
            .communicator
            .repository()
            .peers()
            .into_iter()
            .filter(|p| {
                let p = p.read();
                !p.is_forked() && p.height().is_some_and(|h| h >= our_height)
            })
            .filter(|p| !self.communicator.would_throttle_on_fetching_transactions(p))
            .collect();
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(self.sample);

        let replies = join_all(
            peers
                .iter()
                .map(|p| self.communicator.get_unconfirmed_transactions(p)),
        )
        .await;

        let mut fresh = Vec::new();
        for (peer, reply) in peers.iter().zip(replies) {
            match reply {
                Ok(transactions) => {
                    fresh.extend(
                        transactions
                            .into_iter()
                            .filter(|tx| self.recent.insert(tx.id.clone())),
                    );
                }
                Err(e) => debug!(peer = %peer.read().addr, error = %e, "Pool download failed"),
            }
        }
        debug!(count = fresh.len(), peers = peers.len(), "Downloaded transactions");
        fresh
    }
}
