//! # dpos-sync
//!
//! Network monitoring and chain synchronization for the DPoS relay node.
//!
//! This crate provides:
//! - Peer-set maintenance: seeding, discovery and bounded ping sweeps
//! - Parallel chunked block download with out-of-order chunk reuse
//! - Fork detection by delegate-weighted quorum
//! - Block and transaction relay

mod broadcast;
mod download;
mod error;
mod health;
mod monitor;
mod transactions;

pub use broadcast::{Broadcaster, BROADCAST_WINDOW, MAX_PEERS_BROADCAST};
pub use download::{next_chunk_size, BlockDownloader, DownloadConfig, DEFAULT_CHUNK_SIZE};
pub use error::{SyncError, SyncResult};
pub use health::{evaluate, network_height, quorum, NetworkStatus, PeerVote, MAX_ROLLBACK};
pub use monitor::{CleanseOptions, MonitorConfig, NetworkMonitor};
pub use transactions::{TransactionDownloader, TRANSACTION_DEDUP_TTL, TRANSACTION_PEERS};
