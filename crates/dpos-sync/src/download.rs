//! Parallel chunked block download.
//!
//! The range above our tip is split into chunks, one per peer, fetched
//! concurrently. Only an unbroken run of heights starting right above our
//! tip is returned; chunks that arrive beyond a failed one are cached and
//! reused by the next call.

use crate::health::network_height;
use dpos_chain::Block;
use dpos_network::message::MAX_BLOCKS_IN_REPLY;
use dpos_network::{GetBlocksOptions, PeerCommunicator, SharedPeer};
use futures::future::join_all;
use lru::LruCache;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Blocks requested per chunk while downloads succeed.
pub const DEFAULT_CHUNK_SIZE: u32 = 400;

/// Chunks kept for reuse after a failed download.
const CHUNK_CACHE_SIZE: usize = 64;

/// Download configuration.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Maximum chunks in flight.
    pub max_parallel: usize,
    /// Chunk size restored after any successful download.
    pub chunk_size: u32,
    /// Per-request timeout, communicator default if unset.
    pub timeout: Option<Duration>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_parallel: 10,
            chunk_size: DEFAULT_CHUNK_SIZE,
            timeout: None,
        }
    }
}

/// Chunk size for the next call.
pub fn next_chunk_size(current: u32, default: u32, downloaded_any: bool) -> u32 {
    if downloaded_any {
        default
    } else {
        current.div_ceil(10).max(1)
    }
}

fn is_contiguous(blocks: &[Block], start: u32) -> bool {
    blocks
        .iter()
        .enumerate()
        .all(|(k, block)| block.height() == start + k as u32)
}

/// Downloads blocks above our tip from non-forked peers.
pub struct BlockDownloader {
    config: DownloadConfig,
    communicator: Arc<PeerCommunicator>,
    /// Chunks keyed by the height they start after.
    cache: Mutex<LruCache<u32, Vec<Block>>>,
    chunk_size: AtomicU32,
}

impl BlockDownloader {
    pub fn new(config: DownloadConfig, communicator: Arc<PeerCommunicator>) -> Self {
        let chunk_size = config.chunk_size.max(1);
        Self {
            config,
            communicator,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CHUNK_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            )),
            chunk_size: AtomicU32::new(chunk_size),
        }
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Current chunk size.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size.load(Ordering::Relaxed)
    }

    /// Whether a chunk starting after `height` is cached.
    pub fn is_cached(&self, height: u32) -> bool {
        self.cache.lock().contains(&height)
    }

    pub fn cached_chunks(&self) -> usize {
        self.cache.lock().len()
    }

    /// Download blocks from `from_height + 1` using up to `max_parallel`
    /// peers at once.
    pub async fn download_blocks_from_height(
        &self,
        from_height: u32,
        max_parallel: usize,
    ) -> Vec<Block> {
        let all_peers = self.communicator.repository().peers();
        let mut peers: Vec<SharedPeer> = all_peers
            .iter()
            .filter(|p| !p.read().is_forked())
            .cloned()
            .collect();
        if peers.is_empty() {
            error!("Could not download blocks: no usable peers");
            return Vec::new();
        }
        peers.shuffle(&mut rand::thread_rng());

        let chunk_size = self.chunk_size();
        let network_height = network_height(&all_peers);
        let missing_chunks = if network_height <= from_height {
            1
        } else {
            (network_height - from_height).div_ceil(chunk_size) as usize
        };
        let chunks = missing_chunks.min(peers.len()).min(max_parallel.max(1));
        debug!(from_height, network_height, chunks, chunk_size, "Downloading blocks");

        let failed = AtomicBool::new(false);
        let jobs = (0..chunks).map(|i| {
            self.download_chunk(i, chunks, from_height, chunk_size, &peers, &failed)
        });
        let results = join_all(jobs).await;

        let mut downloaded = Vec::new();
        let mut next = from_height + 1;
        let mut results = results.into_iter().enumerate();
        'chunks: for (_, result) in results.by_ref() {
            let Some(blocks) = result else {
                break;
            };
            for block in blocks {
                // A cached chunk may overlap a smaller chunk before it.
                if block.height() < next {
                    continue;
                }
                if block.height() != next {
                    warn!(expected = next, got = block.height(), "Gap between downloaded chunks");
                    break 'chunks;
                }
                downloaded.push(block);
                next += 1;
            }
        }

        {
            let mut cache = self.cache.lock();
            for (i, result) in results {
                if let Some(blocks) = result.filter(|b| !b.is_empty()) {
                    let height = from_height + chunk_size * i as u32;
                    debug!(height, count = blocks.len(), "Caching chunk for later");
                    cache.put(height, blocks);
                }
            }
        }

        let next_size = next_chunk_size(chunk_size, self.config.chunk_size, !downloaded.is_empty());
        if next_size != chunk_size {
            debug!(from = chunk_size, to = next_size, "Adjusted download chunk size");
        }
        self.chunk_size.store(next_size, Ordering::Relaxed);

        downloaded
    }

    async fn download_chunk(
        &self,
        index: usize,
        chunks: usize,
        from_height: u32,
        chunk_size: u32,
        peers: &[SharedPeer],
        failed: &AtomicBool,
    ) -> Option<Vec<Block>> {
        let height = from_height + chunk_size * index as u32;
        let is_last = index + 1 == chunks;

        let cached = self.cache.lock().pop(&height);
        if let Some(blocks) = cached {
            debug!(height, count = blocks.len(), "Using cached chunk");
            return Some(blocks);
        }

        let limit = chunk_size.min(MAX_BLOCKS_IN_REPLY as u32);
        let range = format!("[{}, {}]", height + 1, height + limit);
        let mut options = GetBlocksOptions::new(height, limit);
        if let Some(timeout) = self.config.timeout {
            options = options.with_timeout(timeout);
        }

        // First choice differs per job; fallbacks are the peers nobody
        // started with.
        let mut candidates = vec![peers[index].clone()];
        let mut fallbacks = peers[chunks..].to_vec();
        fallbacks.shuffle(&mut rand::thread_rng());
        candidates.extend(fallbacks);

        for peer in &candidates {
            let addr = peer.read().addr;
            match self.communicator.get_peer_blocks(peer, options).await {
                Ok(blocks) if (!blocks.is_empty() || is_last) && is_contiguous(&blocks, height + 1) => {
                    debug!(peer = %addr, range = %range, count = blocks.len(), "Downloaded blocks");
                    return Some(blocks);
                }
                Ok(blocks) => {
                    info!(peer = %addr, range = %range, count = blocks.len(), "Peer returned no usable blocks");
                }
                Err(e) => {
                    info!(peer = %addr, range = %range, error = %e, "Failed to download blocks");
                }
            }
            if failed.load(Ordering::Relaxed) {
                info!(range = %range, "Giving up: another download job failed");
                break;
            }
        }

        failed.store(true, Ordering::Relaxed);
        warn!(range = %range, tried = candidates.len(), "Could not download blocks from any peer");
        None
    }
}
