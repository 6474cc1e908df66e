//! Test harness: an in-process peer network and a wired-up node context.
//!
//! [`SimNetwork`] implements the transport by answering requests from
//! per-peer chains, so the communicator, verifier and monitor run their
//! real code paths against peers whose behavior the test controls.

use async_trait::async_trait;
use bytes::Bytes;
use dpos_chain::{
    BlockHeader, ChainStore, MemoryChainStore, Milestones, Secp256k1Crypto, Slots,
    StaticDelegates,
};
use dpos_network::message::{
    AckReply, CommonBlock, CommonBlocksReply, CommonBlocksRequest, GetBlocksRequest,
    NetworkInfo, PeerConfig, PeerAddress, PeerChainState, PostBlockReply, PostBlockRequest,
    Request, Rpc, StatusReply, UnconfirmedTransactionsReply,
};
use dpos_network::{
    ChainContext, CommunicatorConfig, EventBus, NetworkError, NetworkResult, Peer,
    PeerCommunicator, PeerProcessor, PeerRepository, ProcessorConfig, RateLimit,
    RateLimitConfig, RateLimiter, SharedPeer, Transport, TransportErrorKind,
};
use dpos_sync::{MonitorConfig, NetworkMonitor};
use libsecp256k1::SecretKey;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::generators::public_key_hex;

/// Network identifier shared by the test node and honest peers.
pub const NETHASH: &str = "6e84d08bd299ed97c212c886c98a57e36545c8f5d645ca7eeae63a8bd62d8988";

/// Block time used by test milestones.
pub const BLOCK_TIME: u32 = 8;

/// Address `10.0.<n>.1:4002`; each index gets its own /24.
pub fn peer_addr(n: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, n, 1], 4002))
}

/// How a simulated peer answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Honest,
    /// Accepts requests and never replies.
    Hang,
    /// Refuses connections.
    Refuse,
    /// Replies with bytes that are not JSON.
    Garbage,
}

/// A simulated remote node.
#[derive(Clone)]
pub struct SimPeer {
    pub chain: Vec<BlockHeader>,
    pub behavior: Behavior,
    pub latency: Duration,
    pub nethash: String,
    pub version: String,
    pub peers: Vec<PeerAddress>,
    pub pool: Vec<String>,
    /// `getBlocks` after these heights fails, after `failure_delay`.
    pub failing_blocks: HashSet<u32>,
    pub failure_delay: Duration,
    /// Delegates announced in status, with their secret keys.
    pub identities: Vec<SecretKey>,
    pub current_slot: u32,
}

impl SimPeer {
    pub fn new(chain: Vec<BlockHeader>) -> Self {
        Self {
            chain,
            behavior: Behavior::Honest,
            latency: Duration::ZERO,
            nethash: NETHASH.to_string(),
            version: "3.0.0".to_string(),
            peers: Vec::new(),
            pool: Vec::new(),
            failing_blocks: HashSet::new(),
            failure_delay: Duration::ZERO,
            identities: Vec::new(),
            current_slot: 0,
        }
    }

    pub fn behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn nethash(mut self, nethash: &str) -> Self {
        self.nethash = nethash.to_string();
        self
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn knows(mut self, addrs: &[SocketAddr]) -> Self {
        self.peers = addrs
            .iter()
            .map(|a| PeerAddress {
                ip: a.ip().to_string(),
                port: a.port(),
            })
            .collect();
        self
    }

    pub fn pool(mut self, transactions: Vec<String>) -> Self {
        self.pool = transactions;
        self
    }

    pub fn failing_blocks_after(mut self, height: u32, delay: Duration) -> Self {
        self.failing_blocks.insert(height);
        self.failure_delay = delay;
        self
    }

    pub fn identities(mut self, keys: &[SecretKey], current_slot: u32) -> Self {
        self.identities = keys.to_vec();
        self.current_slot = current_slot;
        self
    }

    pub fn tip(&self) -> &BlockHeader {
        self.chain.last().expect("sim chains are never empty")
    }

    pub fn state(&self) -> PeerChainState {
        let tip = self.tip();
        PeerChainState {
            height: tip.height,
            allowed: false,
            current_slot: self.current_slot,
            header: tip.without_transactions(),
        }
    }

    fn status(&self) -> NetworkResult<StatusReply> {
        let mut reply = StatusReply {
            state: self.state(),
            config: PeerConfig {
                version: self.version.clone(),
                network: NetworkInfo {
                    name: "testnet".to_string(),
                    nethash: self.nethash.clone(),
                },
                plugins: BTreeMap::new(),
            },
            public_keys: self.identities.iter().map(public_key_hex).collect(),
            signatures: Vec::new(),
        };
        let digest = reply.signed_digest()?;
        reply.signatures = self
            .identities
            .iter()
            .map(|key| crate::generators::sign_hex(&digest, key))
            .collect();
        Ok(reply)
    }

    fn reply(&self, rpc: Rpc, payload: &[u8]) -> NetworkResult<Vec<u8>> {
        let request: Request<serde_json::Value> = serde_json::from_slice(payload)?;
        let body = match rpc {
            Rpc::GetStatus => serde_json::to_vec(&self.status()?)?,
            Rpc::GetPeers => serde_json::to_vec(&self.peers)?,
            Rpc::GetCommonBlocks => {
                let request: CommonBlocksRequest = serde_json::from_value(request.data)?;
                let common = self
                    .chain
                    .iter()
                    .filter(|b| request.ids.contains(&b.id))
                    .max_by_key(|b| b.height)
                    .map(|b| CommonBlock {
                        height: b.height,
                        id: b.id.clone(),
                    });
                serde_json::to_vec(&CommonBlocksReply { common })?
            }
            Rpc::GetBlocks => {
                let request: GetBlocksRequest = serde_json::from_value(request.data)?;
                let blocks: Vec<BlockHeader> = self
                    .chain
                    .iter()
                    .filter(|b| b.height > request.last_block_height)
                    .take(request.block_limit as usize)
                    .map(|b| {
                        if request.headers_only {
                            b.without_transactions()
                        } else {
                            BlockHeader {
                                transactions: Some(Vec::new()),
                                ..b.clone()
                            }
                        }
                    })
                    .collect();
                serde_json::to_vec(&blocks)?
            }
            Rpc::PostBlock => {
                let request: PostBlockRequest = serde_json::from_value(request.data)?;
                serde_json::to_vec(&PostBlockReply {
                    status: true,
                    height: request.block.height,
                })?
            }
            Rpc::GetUnconfirmedTransactions => serde_json::to_vec(&UnconfirmedTransactionsReply {
                pool_size: self.pool.len() as u32,
                transactions: self.pool.clone(),
            })?,
            Rpc::PostTransactions => serde_json::to_vec(&AckReply {})?,
        };
        Ok(body)
    }
}

/// In-process transport over simulated peers.
#[derive(Default)]
pub struct SimNetwork {
    peers: RwLock<HashMap<SocketAddr, Arc<SimPeer>>>,
    requests: Mutex<Vec<(SocketAddr, Rpc)>>,
    block_limits: Mutex<Vec<u32>>,
    disconnects: Mutex<Vec<SocketAddr>>,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_peer(&self, addr: SocketAddr, peer: SimPeer) {
        self.peers.write().insert(addr, Arc::new(peer));
    }

    /// Change a peer in place.
    pub fn update_peer(&self, addr: SocketAddr, change: impl FnOnce(&mut SimPeer)) {
        let mut peers = self.peers.write();
        if let Some(peer) = peers.get_mut(&addr) {
            change(Arc::make_mut(peer));
        }
    }

    /// Requests of kind `rpc` sent to anyone.
    pub fn requests(&self, rpc: Rpc) -> usize {
        self.requests.lock().iter().filter(|(_, r)| *r == rpc).count()
    }

    /// Requests of kind `rpc` sent to `addr`.
    pub fn requests_to(&self, addr: SocketAddr, rpc: Rpc) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|(a, r)| *a == addr && *r == rpc)
            .count()
    }

    /// `block_limit` of every `getBlocks` request, in order.
    pub fn block_limits(&self) -> Vec<u32> {
        self.block_limits.lock().clone()
    }

    pub fn disconnects(&self) -> Vec<SocketAddr> {
        self.disconnects.lock().clone()
    }

    fn peer(&self, addr: SocketAddr) -> NetworkResult<Arc<SimPeer>> {
        self.peers.read().get(&addr).cloned().ok_or_else(|| NetworkError::Transport {
            kind: TransportErrorKind::Generic,
            message: format!("connection refused by {}", addr),
        })
    }
}

#[async_trait]
impl Transport for SimNetwork {
    async fn connect(&self, addr: SocketAddr, _timeout: Duration) -> NetworkResult<()> {
        let peer = self.peer(addr)?;
        if peer.behavior == Behavior::Refuse {
            return Err(NetworkError::Transport {
                kind: TransportErrorKind::Generic,
                message: format!("connection refused by {}", addr),
            });
        }
        Ok(())
    }

    async fn emit(
        &self,
        addr: SocketAddr,
        rpc: Rpc,
        payload: Bytes,
        _timeout: Duration,
    ) -> NetworkResult<Bytes> {
        self.requests.lock().push((addr, rpc));
        if rpc == Rpc::GetBlocks {
            let request: Request<GetBlocksRequest> = serde_json::from_slice(&payload)?;
            self.block_limits.lock().push(request.data.block_limit);
        }
        let peer = self.peer(addr)?;

        match peer.behavior {
            Behavior::Hang => std::future::pending::<()>().await,
            Behavior::Garbage => return Ok(Bytes::from_static(b"<html>")),
            Behavior::Refuse => {
                return Err(NetworkError::Transport {
                    kind: TransportErrorKind::Generic,
                    message: "session closed".to_string(),
                })
            }
            Behavior::Honest => {}
        }

        if !peer.latency.is_zero() {
            tokio::time::sleep(peer.latency).await;
        }

        if rpc == Rpc::GetBlocks && !peer.failing_blocks.is_empty() {
            let request: Request<GetBlocksRequest> = serde_json::from_slice(&payload)?;
            if peer.failing_blocks.contains(&request.data.last_block_height) {
                tokio::time::sleep(peer.failure_delay).await;
                return Err(NetworkError::Transport {
                    kind: TransportErrorKind::Generic,
                    message: "socket hang up".to_string(),
                });
            }
        }

        peer.reply(rpc, &payload).map(Bytes::from)
    }

    async fn disconnect(&self, addr: SocketAddr) {
        self.disconnects.lock().push(addr);
    }

    async fn probe(&self, addr: SocketAddr, _timeout: Duration) -> NetworkResult<Duration> {
        self.peer(addr).map(|_| Duration::from_millis(1))
    }
}

/// Rate limits high enough to stay out of the way.
pub fn permissive_rate_limits() -> RateLimitConfig {
    RateLimitConfig {
        global: RateLimit::per_second(100_000),
        rules: Rpc::ALL
            .into_iter()
            .map(|rpc| (rpc, RateLimit::per_second(100_000)))
            .collect(),
    }
}

/// A node wired to a [`SimNetwork`].
pub struct TestContext {
    pub network: Arc<SimNetwork>,
    pub store: Arc<MemoryChainStore>,
    pub chain: ChainContext,
    pub repository: Arc<PeerRepository>,
    pub events: EventBus,
    pub communicator: Arc<PeerCommunicator>,
    pub processor: Arc<PeerProcessor>,
}

impl TestContext {
    /// Our chain is `chain`; `delegates` forge every round.
    pub fn new(chain: &[BlockHeader], delegates: &[SecretKey]) -> Self {
        Self::with_config(chain, delegates, CommunicatorConfig::default(), permissive_rate_limits())
    }

    pub fn with_config(
        chain: &[BlockHeader],
        delegates: &[SecretKey],
        config: CommunicatorConfig,
        rate_limits: RateLimitConfig,
    ) -> Self {
        let store = Arc::new(MemoryChainStore::from_blocks(chain.to_vec()).expect("linked chain"));
        let delegate_count = delegates.len().max(1) as u32;
        let chain = ChainContext {
            store: store.clone() as Arc<dyn ChainStore>,
            delegates: Arc::new(StaticDelegates::new(
                delegates.iter().map(public_key_hex).collect(),
            )),
            crypto: Arc::new(Secp256k1Crypto::new()),
            milestones: Arc::new(
                Milestones::single(delegate_count, BLOCK_TIME).expect("valid milestone"),
            ),
            slots: Slots::new(0),
        };

        let network = SimNetwork::new();
        let repository = Arc::new(PeerRepository::new());
        let events = EventBus::default();
        let communicator = Arc::new(PeerCommunicator::new(
            CommunicatorConfig {
                nethash: NETHASH.to_string(),
                ..config
            },
            network.clone(),
            Arc::new(RateLimiter::new(rate_limits)),
            repository.clone(),
            events.clone(),
            chain.clone(),
        ));
        let processor = Arc::new(PeerProcessor::new(
            ProcessorConfig {
                allow_private: true,
                verify_timeout: Duration::from_secs(5),
                ..Default::default()
            },
            communicator.clone(),
        ));

        Self {
            network,
            store,
            chain,
            repository,
            events,
            communicator,
            processor,
        }
    }

    pub fn monitor(&self, config: MonitorConfig) -> Arc<NetworkMonitor> {
        Arc::new(NetworkMonitor::new(
            config,
            self.communicator.clone(),
            self.processor.clone(),
        ))
    }

    /// Monitor config without connectivity checks.
    pub fn quiet_monitor_config() -> MonitorConfig {
        MonitorConfig {
            dns_hosts: Vec::new(),
            ntp_hosts: Vec::new(),
            verify_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    /// Register `sim` with the network only.
    pub fn add_remote(&self, addr: SocketAddr, sim: SimPeer) {
        self.network.add_peer(addr, sim);
    }

    /// Register `sim` and add it to the repository with its claimed state,
    /// skipping acceptance.
    pub fn add_known_peer(&self, addr: SocketAddr, sim: SimPeer) -> SharedPeer {
        let mut peer = Peer::new(addr);
        peer.state = Some(sim.state());
        self.network.add_peer(addr, sim);
        self.repository.set_peer(peer)
    }

    /// Our current slot, as peers must announce it for identities to count.
    pub fn current_slot(&self) -> u32 {
        let height = self.store.height();
        self.chain
            .slots
            .current_slot(self.chain.milestones.as_ref(), height)
    }
}
