//! Node orchestration.

use crate::config::NodeConfig;
use anyhow::{Context, Result};
use dpos_chain::{
    Block, BlockCrypto, BlockHeader, ChainError, ChainStore, DelegateProvider, MemoryChainStore,
    Secp256k1Crypto, Slots, StaticDelegates,
};
use dpos_network::{
    ChainContext, EventBus, NetworkEvent, PeerCommunicator, PeerProcessor, PeerRepository,
    RateLimiter, TcpTransport, TcpTransportConfig,
};
use dpos_sync::NetworkMonitor;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause between sync attempts.
const SYNC_INTERVAL: Duration = Duration::from_secs(2);

/// Sync attempts between health checks while caught up.
const HEALTH_CHECK_EVERY: u32 = 30;

/// The relay node.
pub struct Node {
    config: NodeConfig,
    store: Arc<MemoryChainStore>,
    chain: ChainContext,
    events: EventBus,
    monitor: Arc<NetworkMonitor>,
    shutdown: CancellationToken,
}

impl Node {
    /// Wire up the chain, network and monitor.
    pub fn new(config: NodeConfig) -> Result<Arc<Self>> {
        let genesis_path = config.genesis_path();
        let content = std::fs::read_to_string(&genesis_path)
            .with_context(|| format!("Failed to read genesis block {:?}", genesis_path))?;
        let genesis: BlockHeader =
            serde_json::from_str(&content).context("Failed to parse genesis block")?;
        genesis.validate().context("Invalid genesis block")?;
        let store = Arc::new(MemoryChainStore::new(genesis)?);

        let milestones = Arc::new(config.milestones()?);
        let delegates: Arc<dyn DelegateProvider> =
            Arc::new(StaticDelegates::new(config.chain.delegates.clone()));
        let crypto: Arc<dyn BlockCrypto> = Arc::new(Secp256k1Crypto::new());
        let chain = ChainContext {
            store: store.clone() as Arc<dyn ChainStore>,
            delegates,
            crypto,
            milestones,
            slots: Slots::new(config.chain.epoch),
        };

        let events = EventBus::default();
        let transport = Arc::new(TcpTransport::new(
            &config.p2p.nethash,
            TcpTransportConfig::default(),
        ));
        let communicator = Arc::new(PeerCommunicator::new(
            config.communicator_config()?,
            transport,
            Arc::new(RateLimiter::new(config.rate_limit_config()?)),
            Arc::new(PeerRepository::new()),
            events.clone(),
            chain.clone(),
        ));
        let processor = Arc::new(PeerProcessor::new(
            config.processor_config(),
            communicator.clone(),
        ));
        let monitor = Arc::new(NetworkMonitor::new(
            config.monitor_config(),
            communicator,
            processor,
        ));

        Ok(Arc::new(Self {
            config,
            store,
            chain,
            events,
            monitor,
            shutdown: CancellationToken::new(),
        }))
    }

    /// Run the node until shut down.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        info!(network = %self.config.network, port = self.config.p2p.port, "Starting node services");

        let listener = self.monitor.boot().await?;
        let monitor = self.monitor.clone();
        let status_loop = tokio::spawn(async move { monitor.run().await });

        let mut ticks = 0u32;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(SYNC_INTERVAL) => {}
            }
            ticks = ticks.wrapping_add(1);
            if let Err(e) = self.sync_step(ticks % HEALTH_CHECK_EVERY == 0).await {
                warn!(error = %e, "Sync step failed");
            }
        }

        self.monitor.shutdown();
        let _ = tokio::join!(listener, status_loop);
        info!("Node main loop stopped");
        Ok(())
    }

    /// Download what the network has above our tip, or check for forks
    /// when caught up.
    async fn sync_step(&self, check_health: bool) -> Result<()> {
        let our_height = self.store.height();
        let network_height = self.monitor.network_height();

        if network_height <= our_height {
            if self.monitor.is_cold_start() && self.store.height() > 1 {
                self.monitor.complete_cold_start();
            }
            if check_health {
                let status = self.monitor.check_network_health().await?;
                if let Some(blocks) = status.blocks_to_rollback.filter(|_| status.forked) {
                    let removed = self.store.rollback(blocks);
                    warn!(removed, height = self.store.height(), "Rolled back to rejoin the network");
                }
            }
            return Ok(());
        }

        let blocks = match self.monitor.download_blocks_from_height(our_height, None).await {
            Ok(blocks) => blocks,
            Err(e) => {
                debug!(error = %e, "No blocks downloaded");
                return Ok(());
            }
        };
        let applied = self.apply_blocks(blocks).await?;
        if applied > 0 {
            info!(applied, height = self.store.height(), network_height, "Applied blocks");
        }
        if self.store.height() >= network_height {
            self.events.publish(NetworkEvent::ChainSynced {
                height: self.store.height(),
            });
        }
        Ok(())
    }

    async fn apply_blocks(&self, blocks: Vec<Block>) -> Result<usize> {
        let mut applied = 0;
        for block in blocks {
            if !self.chain.crypto.verify_block(&block.header) {
                warn!(height = block.height(), id = %block.id(), "Downloaded block failed verification");
                break;
            }
            let height = block.height();
            match self.store.append(block.header) {
                Ok(()) => applied += 1,
                Err(ChainError::NotLinked { height, tip }) => {
                    info!(height, tip, "Downloaded blocks do not extend our chain, checking for fork");
                    let status = self.monitor.check_for_fork().await?;
                    if let Some(blocks) = status.blocks_to_rollback.filter(|_| status.forked) {
                        self.store.rollback(blocks);
                    }
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            let round = self.chain.milestones.round_info(height);
            if height == round.last_height() {
                self.events.publish(NetworkEvent::RoundApplied { round: round.round });
            }
        }
        Ok(applied)
    }

    /// Stop the node.
    pub fn shutdown(&self) {
        info!("Shutting down node...");
        self.shutdown.cancel();
        self.monitor.shutdown();
    }
}
