//! Chain state and delegate collaborators.

use crate::block::BlockHeader;
use crate::error::{ChainError, ChainResult};
use crate::round::RoundInfo;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};

/// Read access to our own chain.
#[async_trait]
pub trait ChainStore: Send + Sync {
    /// Current tip.
    async fn last_block(&self) -> ChainResult<BlockHeader>;

    /// Up to `count` most recent headers, newest first.
    async fn last_blocks(&self, count: usize) -> ChainResult<Vec<BlockHeader>>;

    /// Current tip height.
    async fn last_height(&self) -> ChainResult<u32> {
        Ok(self.last_block().await?.height)
    }

    /// Header at `height`, if we have it.
    async fn block_at_height(&self, height: u32) -> ChainResult<Option<BlockHeader>>;

    /// Headers at each of `heights`, in the same order.
    async fn blocks_at_heights(&self, heights: &[u32]) -> ChainResult<Vec<Option<BlockHeader>>> {
        let mut out = Vec::with_capacity(heights.len());
        for &height in heights {
            out.push(self.block_at_height(height).await?);
        }
        Ok(out)
    }
}

/// Round delegate lookup.
#[async_trait]
pub trait DelegateProvider: Send + Sync {
    /// Public keys (hex) of the delegates forging in `round`.
    async fn active_delegates(&self, round: &RoundInfo) -> ChainResult<Vec<String>>;

    /// Registered name of a delegate.
    fn delegate_name(&self, _public_key: &str) -> Option<String> {
        None
    }
}

/// In-memory chain, newest block last.
pub struct MemoryChainStore {
    blocks: RwLock<Vec<BlockHeader>>,
}

impl MemoryChainStore {
    /// Create a store holding only `genesis`.
    pub fn new(genesis: BlockHeader) -> ChainResult<Self> {
        if genesis.height != 1 {
            return Err(ChainError::InvalidBlock(format!(
                "genesis at height {}",
                genesis.height
            )));
        }
        Ok(Self {
            blocks: RwLock::new(vec![genesis.without_transactions()]),
        })
    }

    /// Create a store from a full chain starting at genesis.
    pub fn from_blocks(blocks: Vec<BlockHeader>) -> ChainResult<Self> {
        let mut iter = blocks.into_iter();
        let genesis = iter
            .next()
            .ok_or_else(|| ChainError::Store("empty chain".into()))?;
        let store = Self::new(genesis)?;
        for block in iter {
            store.append(block)?;
        }
        Ok(store)
    }

    /// Append a block that extends the tip.
    pub fn append(&self, block: BlockHeader) -> ChainResult<()> {
        let mut blocks = self.blocks.write();
        let tip = blocks.last().ok_or_else(|| ChainError::Store("empty chain".into()))?;
        if block.height != tip.height + 1 || block.previous_block.as_deref() != Some(tip.id.as_str()) {
            return Err(ChainError::NotLinked {
                height: block.height,
                tip: tip.height,
            });
        }
        debug!(height = block.height, id = %block.id, "Appended block");
        blocks.push(block.without_transactions());
        Ok(())
    }

    /// Remove up to `count` blocks from the tip, never removing genesis.
    pub fn rollback(&self, count: u32) -> u32 {
        let mut blocks = self.blocks.write();
        let removable = (blocks.len() - 1).min(count as usize);
        let keep = blocks.len() - removable;
        blocks.truncate(keep);
        info!(removed = removable, height = keep, "Rolled back blocks");
        removable as u32
    }

    pub fn height(&self) -> u32 {
        self.blocks.read().len() as u32
    }
}

#[async_trait]
impl ChainStore for MemoryChainStore {
    async fn last_block(&self) -> ChainResult<BlockHeader> {
        self.blocks
            .read()
            .last()
            .cloned()
            .ok_or_else(|| ChainError::Store("empty chain".into()))
    }

    async fn last_blocks(&self, count: usize) -> ChainResult<Vec<BlockHeader>> {
        Ok(self.blocks.read().iter().rev().take(count).cloned().collect())
    }

    async fn last_height(&self) -> ChainResult<u32> {
        Ok(self.height())
    }

    async fn block_at_height(&self, height: u32) -> ChainResult<Option<BlockHeader>> {
        if height == 0 {
            return Ok(None);
        }
        Ok(self.blocks.read().get(height as usize - 1).cloned())
    }
}

/// A fixed, ordered delegate list.
///
/// Every round is forged by the first `max_delegates` registered keys.
#[derive(Debug, Default)]
pub struct StaticDelegates {
    keys: Vec<String>,
    names: HashMap<String, String>,
}

impl StaticDelegates {
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            keys,
            names: HashMap::new(),
        }
    }

    /// Attach a registered name to a key.
    pub fn with_name(mut self, public_key: impl Into<String>, name: impl Into<String>) -> Self {
        self.names.insert(public_key.into(), name.into());
        self
    }
}

#[async_trait]
impl DelegateProvider for StaticDelegates {
    async fn active_delegates(&self, round: &RoundInfo) -> ChainResult<Vec<String>> {
        Ok(self
            .keys
            .iter()
            .take(round.max_delegates as usize)
            .cloned()
            .collect())
    }

    fn delegate_name(&self, public_key: &str) -> Option<String> {
        self.names.get(public_key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(height: u32, previous: Option<&str>) -> BlockHeader {
        BlockHeader {
            id: format!("{:064x}", height),
            version: 0,
            timestamp: height * 8,
            height,
            previous_block: previous.map(String::from),
            number_of_transactions: 0,
            total_amount: 0,
            total_fee: 0,
            reward: 0,
            payload_length: 0,
            payload_hash: "00".repeat(32),
            generator_public_key: format!("02{}", "11".repeat(32)),
            block_signature: "22".repeat(64),
            transactions: None,
        }
    }

    fn chain(len: u32) -> Vec<BlockHeader> {
        (1..=len)
            .map(|h| {
                let prev = (h > 1).then(|| format!("{:064x}", h - 1));
                block(h, prev.as_deref())
            })
            .collect()
    }

    #[tokio::test]
    async fn test_memory_store_queries() {
        let store = MemoryChainStore::from_blocks(chain(5)).unwrap();
        assert_eq!(store.last_height().await.unwrap(), 5);
        assert_eq!(store.last_block().await.unwrap().height, 5);

        let last = store.last_blocks(2).await.unwrap();
        assert_eq!(last.iter().map(|b| b.height).collect::<Vec<_>>(), vec![5, 4]);

        let found = store.blocks_at_heights(&[1, 3, 9]).await.unwrap();
        assert_eq!(found[0].as_ref().unwrap().height, 1);
        assert_eq!(found[1].as_ref().unwrap().height, 3);
        assert!(found[2].is_none());
        assert!(store.block_at_height(0).await.unwrap().is_none());
    }

    #[test]
    fn test_append_requires_link() {
        let store = MemoryChainStore::from_blocks(chain(2)).unwrap();
        assert!(matches!(
            store.append(block(4, Some(format!("{:064x}", 3).as_str()))),
            Err(ChainError::NotLinked { height: 4, tip: 2 })
        ));
        assert!(store.append(block(3, Some("ff".repeat(32).as_str()))).is_err());
        assert!(store.append(block(3, Some(format!("{:064x}", 2).as_str()))).is_ok());
    }

    #[test]
    fn test_rollback_keeps_genesis() {
        let store = MemoryChainStore::from_blocks(chain(5)).unwrap();
        assert_eq!(store.rollback(2), 2);
        assert_eq!(store.height(), 3);
        assert_eq!(store.rollback(10), 2);
        assert_eq!(store.height(), 1);
    }

    #[tokio::test]
    async fn test_static_delegates() {
        let provider = StaticDelegates::new(vec!["a".into(), "b".into(), "c".into()])
            .with_name("a", "genesis_1");
        let round = RoundInfo {
            round: 1,
            round_height: 1,
            next_round: 2,
            max_delegates: 2,
        };
        assert_eq!(provider.active_delegates(&round).await.unwrap(), vec!["a", "b"]);
        assert_eq!(provider.delegate_name("a").as_deref(), Some("genesis_1"));
        assert!(provider.delegate_name("c").is_none());
    }
}
