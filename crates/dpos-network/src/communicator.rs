//! Typed request/response layer over peer sessions.
//!
//! Every procedure goes through [`PeerCommunicator::emit`], which waits for
//! the outgoing rate limiter, sends the request with our headers, decodes
//! the reply strictly and charges failures to the peer.

use crate::error::{NetworkError, NetworkResult};
use crate::events::{EventBus, NetworkEvent};
use crate::message::{
    decode_reply, AckReply, BlocksReply, CommonBlock, CommonBlocksReply, CommonBlocksRequest,
    EmptyRequest, GetBlocksRequest, PeerAddress, PeerChainState, PeerConfig, PeersReply,
    PostBlockReply, PostBlockRequest, PostTransactionsRequest, ReplySchema, Request,
    RequestHeaders, Rpc, StatusReply, UnconfirmedTransactionsReply, BLOCKS_MAX_PAYLOAD,
    DEFAULT_MAX_PAYLOAD, MAX_BLOCKS_IN_REPLY, MAX_COMMON_BLOCK_IDS,
};
use crate::penalties::{ErrorPolicy, DEFAULT_MAX_SEQUENTIAL_ERRORS};
use crate::peer::SharedPeer;
use crate::rate_limit::RateLimiter;
use crate::repository::PeerRepository;
use crate::transport::Transport;
use crate::verifier::{ChainContext, PeerVerifier};
use dashmap::DashMap;
use dpos_chain::{Block, BlockHeader, BlockTimeLookup, Transaction};
use futures::future::join_all;
use semver::{Version, VersionReq};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

/// Communicator configuration.
#[derive(Debug, Clone)]
pub struct CommunicatorConfig {
    /// Port we accept peers on, sent in request headers.
    pub own_port: u16,
    /// Our protocol version, sent in request headers.
    pub version: String,
    /// Network we belong to.
    pub nethash: String,
    /// Versions we talk to.
    pub minimum_version: VersionReq,
    /// Sequential failures before a peer is disconnected.
    pub max_sequential_errors: u32,
    /// Default request timeout.
    pub request_timeout: Duration,
    /// Upper bound for the status request inside `ping`.
    pub status_timeout: Duration,
    /// Timeout for block downloads.
    pub get_blocks_timeout: Duration,
    /// Timeout for sibling port probes.
    pub ports_timeout: Duration,
    /// Decoded transactions between scheduler yields.
    pub decode_yield_interval: usize,
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        Self {
            own_port: 4002,
            version: "3.0.0".to_string(),
            nethash: String::new(),
            minimum_version: VersionReq::parse(">=3.0.0").unwrap_or(VersionReq::STAR),
            max_sequential_errors: DEFAULT_MAX_SEQUENTIAL_ERRORS,
            request_timeout: Duration::from_secs(5),
            status_timeout: Duration::from_secs(5),
            get_blocks_timeout: Duration::from_secs(10),
            ports_timeout: Duration::from_secs(3),
            decode_yield_interval: 50,
        }
    }
}

/// Options for [`PeerCommunicator::get_peer_blocks`].
#[derive(Debug, Clone, Copy)]
pub struct GetBlocksOptions {
    /// Blocks are returned from `from_height + 1`.
    pub from_height: u32,
    pub block_limit: u32,
    pub headers_only: bool,
    /// Overrides the configured download timeout.
    pub timeout: Option<Duration>,
}

impl GetBlocksOptions {
    pub fn new(from_height: u32, block_limit: u32) -> Self {
        Self {
            from_height,
            block_limit,
            headers_only: false,
            timeout: None,
        }
    }

    pub fn headers_only(mut self) -> Self {
        self.headers_only = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// RPC client for peers.
pub struct PeerCommunicator {
    config: CommunicatorConfig,
    transport: Arc<dyn Transport>,
    rate_limiter: Arc<RateLimiter>,
    repository: Arc<PeerRepository>,
    events: EventBus,
    chain: ChainContext,
    /// Per-ip FIFO for transaction posts.
    post_queues: DashMap<IpAddr, Arc<Mutex<()>>>,
}

impl PeerCommunicator {
    pub fn new(
        config: CommunicatorConfig,
        transport: Arc<dyn Transport>,
        rate_limiter: Arc<RateLimiter>,
        repository: Arc<PeerRepository>,
        events: EventBus,
        chain: ChainContext,
    ) -> Self {
        Self {
            config,
            transport,
            rate_limiter,
            repository,
            events,
            chain,
            post_queues: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CommunicatorConfig {
        &self.config
    }

    pub fn chain(&self) -> &ChainContext {
        &self.chain
    }

    pub fn repository(&self) -> &Arc<PeerRepository> {
        &self.repository
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Send `rpc` to `peer` and decode the reply.
    pub async fn emit<Req, R>(
        &self,
        peer: &SharedPeer,
        rpc: Rpc,
        payload: &Req,
        timeout: Duration,
        max_payload: usize,
        disconnect_on_error: bool,
    ) -> NetworkResult<R>
    where
        Req: Serialize + Sync,
        R: ReplySchema,
    {
        self.emit_timed(peer, rpc, payload, timeout, max_payload, disconnect_on_error)
            .await
            .map(|(reply, _)| reply)
    }

    async fn emit_timed<Req, R>(
        &self,
        peer: &SharedPeer,
        rpc: Rpc,
        payload: &Req,
        timeout: Duration,
        max_payload: usize,
        disconnect_on_error: bool,
    ) -> NetworkResult<(R, Duration)>
    where
        Req: Serialize + Sync,
        R: ReplySchema,
    {
        let addr = peer.read().addr;

        while let Err(wait) = self.rate_limiter.consume(addr.ip(), rpc) {
            trace!(peer = %addr, rpc = %rpc, wait_ms = wait.as_millis() as u64, "Rate limited, waiting");
            tokio::time::sleep(wait).await;
        }

        let result = self.request(addr, rpc, payload, timeout, max_payload).await;
        match &result {
            Ok(_) => peer.write().sequential_error_counter = 0,
            Err(e) => self.handle_error(peer, rpc, e, disconnect_on_error),
        }
        result
    }

    async fn request<Req, R>(
        &self,
        addr: SocketAddr,
        rpc: Rpc,
        payload: &Req,
        timeout: Duration,
        max_payload: usize,
    ) -> NetworkResult<(R, Duration)>
    where
        Req: Serialize + Sync,
        R: ReplySchema,
    {
        tokio::time::timeout(timeout, self.transport.connect(addr, timeout))
            .await
            .map_err(|_| NetworkError::Timeout(format!("connect to {}", addr)))??;

        let body = serde_json::to_vec(&Request {
            data: payload,
            headers: RequestHeaders {
                port: self.config.own_port,
                version: self.config.version.clone(),
            },
        })?;

        let started = Instant::now();
        let reply = tokio::time::timeout(timeout, self.transport.emit(addr, rpc, body.into(), timeout))
            .await
            .map_err(|_| NetworkError::Timeout(format!("{} to {}", rpc, addr)))??;
        let elapsed = started.elapsed();
        if reply.is_empty() {
            return Err(NetworkError::NoReply(format!("{} from {}", rpc, addr)));
        }
        Ok((decode_reply(rpc, &reply, max_payload)?, elapsed))
    }

    fn handle_error(&self, peer: &SharedPeer, rpc: Rpc, error: &NetworkError, disconnect: bool) {
        let policy = ErrorPolicy::classify(error);
        let (addr, counter) = {
            let mut p = peer.write();
            if policy.counts() {
                p.sequential_error_counter += 1;
            }
            (p.addr, p.sequential_error_counter)
        };

        match policy {
            ErrorPolicy::LogOnly => {
                debug!(peer = %addr, rpc = %rpc, error = %error, "Request rejected");
            }
            ErrorPolicy::Count => {
                debug!(peer = %addr, rpc = %rpc, error = %error, errors = counter, "Request failed");
            }
            ErrorPolicy::Disconnect => {
                warn!(peer = %addr, rpc = %rpc, error = %error, "Request failed unexpectedly");
            }
        }

        if disconnect && policy.should_disconnect(counter, self.config.max_sequential_errors) {
            info!(peer = %addr, errors = counter, "Disconnecting peer after request failures");
            self.events.publish(NetworkEvent::PeerDisconnect {
                addr,
                reason: error.to_string(),
            });
        }
    }

    /// Handshake: fetch the peer's status, check it belongs to our network
    /// and verify its claimed chain.
    ///
    /// Returns the cached state without contacting the peer when it was
    /// pinged recently, unless `force` is set or the peer is stale. The
    /// whole call is bounded by `timeout`: verification steps run against
    /// the same deadline and are cancelled with it.
    pub async fn ping(
        &self,
        peer: &SharedPeer,
        timeout: Duration,
        block_time_lookup: &dyn BlockTimeLookup,
        force: bool,
        skip_common_blocks: bool,
    ) -> NetworkResult<Option<PeerChainState>> {
        let deadline = Instant::now() + timeout;
        {
            let p = peer.read();
            if p.recently_pinged() && !force && !p.stale {
                return Ok(p.state.clone());
            }
        }

        let status_timeout = timeout.min(self.config.status_timeout);
        let (status, latency): (StatusReply, _) = self
            .emit_timed(
                peer,
                Rpc::GetStatus,
                &EmptyRequest::default(),
                status_timeout,
                DEFAULT_MAX_PAYLOAD,
                true,
            )
            .await?;

        self.validate_config(&status.config)?;

        let verifier = PeerVerifier::new(self, peer.clone(), deadline);
        let fast_forked = if skip_common_blocks {
            let result = verifier
                .check_state_fast(&status.state)
                .await?
                .ok_or_else(|| NetworkError::VerificationFailed("could not verify state".into()))?;
            peer.write().fast_verification_result = Some(result);
            result.forked()
        } else {
            let result = verifier
                .check_state(&status.state)
                .await?
                .ok_or_else(|| NetworkError::VerificationFailed("could not verify chain".into()))?;
            peer.write().verification_result = Some(result);
            false
        };

        {
            let mut p = peer.write();
            p.state = Some(status.state.clone());
            p.version = Some(status.config.version.clone());
            p.plugins = status.config.plugins.clone();
            p.latency = Some(latency);
            p.last_pinged = Some(Instant::now());
            // A fast check that could not rule out a fork is inconclusive.
            p.stale = fast_forked;
        }

        if let Err(e) = self.validate_identities(peer, &status, block_time_lookup).await {
            debug!(peer = %peer.read().addr, error = %e, "Skipped delegate identities");
        }

        Ok(Some(status.state))
    }

    fn validate_config(&self, config: &PeerConfig) -> NetworkResult<()> {
        if config.network.nethash != self.config.nethash {
            return Err(NetworkError::VerificationFailed(format!(
                "nethash mismatch: {}",
                config.network.nethash
            )));
        }
        let version = Version::parse(&config.version).map_err(|e| {
            NetworkError::VerificationFailed(format!("bad version {}: {}", config.version, e))
        })?;
        if !self.config.minimum_version.matches(&version) {
            return Err(NetworkError::VerificationFailed(format!(
                "incompatible version {}, require {}",
                version, self.config.minimum_version
            )));
        }
        Ok(())
    }

    /// Credit the peer with the delegates whose identity signatures check
    /// out for the round it claims to be in.
    async fn validate_identities(
        &self,
        peer: &SharedPeer,
        status: &StatusReply,
        block_time_lookup: &dyn BlockTimeLookup,
    ) -> NetworkResult<()> {
        if status.public_keys.is_empty() {
            return Ok(());
        }

        let tip = self.chain.store.last_block().await?;
        let our_slot = self.chain.slots.current_slot(block_time_lookup, tip.height);
        let declared = status.state.current_slot;
        if declared.abs_diff(our_slot) > 1 {
            warn!(
                peer = %peer.read().addr,
                declared,
                slot = our_slot,
                "Peer announced delegate identities outside our slot window"
            );
            return Err(NetworkError::VerificationFailed(format!(
                "slot {} outside [{}, {}]",
                declared,
                our_slot.saturating_sub(1),
                our_slot.saturating_add(1)
            )));
        }

        let digest = status.signed_digest()?;
        let round = self.chain.milestones.round_info(status.state.height);
        let authorized = self.chain.delegates.active_delegates(&round).await?;

        for (key, signature) in status.public_keys.iter().zip(&status.signatures) {
            if !authorized.contains(key) {
                continue;
            }
            let (Ok(pk), Ok(sig)) = (hex::decode(key), hex::decode(signature)) else {
                continue;
            };
            if !self.chain.crypto.verify_signature(&digest, &sig, &pk) {
                debug!(delegate = %key, "Invalid identity signature");
                continue;
            }
            if self.takes_precedence(peer, key, &tip) {
                self.repository.assign_delegate(key, peer);
            }
        }
        Ok(())
    }

    /// Whether `candidate` should host `key` instead of its current holder.
    fn takes_precedence(&self, candidate: &SharedPeer, key: &str, tip: &BlockHeader) -> bool {
        let Some(holder_addr) = self.repository.delegate_host(key) else {
            return true;
        };
        let (addr, forked, on_our_tip) = {
            let c = candidate.read();
            let on_our_tip = c
                .state
                .as_ref()
                .map(|s| s.height == tip.height && s.header.id == tip.id)
                .unwrap_or(false);
            (c.addr, c.is_forked(), on_our_tip)
        };
        if holder_addr == addr || !forked || on_our_tip {
            return true;
        }
        self.repository
            .peer(&holder_addr)
            .map(|holder| holder.read().is_forked())
            .unwrap_or(true)
    }

    /// Announce a block.
    pub async fn post_block(&self, peer: &SharedPeer, block: &Block) -> NetworkResult<PostBlockReply> {
        let mut header = block.header.clone();
        header.transactions = Some(block.transactions.iter().map(Transaction::to_hex).collect());
        self.emit(
            peer,
            Rpc::PostBlock,
            &PostBlockRequest { block: header },
            self.config.request_timeout,
            DEFAULT_MAX_PAYLOAD,
            true,
        )
        .await
    }

    /// Relay transactions. Posts to the same ip are sent one at a time, in
    /// call order.
    pub async fn post_transactions(
        &self,
        peer: &SharedPeer,
        transactions: &[Transaction],
    ) -> NetworkResult<()> {
        let ip = peer.read().ip();
        let queue = self
            .post_queues
            .entry(ip)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _turn = queue.lock().await;

        let request = PostTransactionsRequest {
            transactions: transactions.iter().map(Transaction::to_hex).collect(),
        };
        self.emit::<_, AckReply>(
            peer,
            Rpc::PostTransactions,
            &request,
            self.config.request_timeout,
            DEFAULT_MAX_PAYLOAD,
            false,
        )
        .await
        .map(|_| ())
    }

    /// The peer's known peers.
    pub async fn get_peers(&self, peer: &SharedPeer) -> NetworkResult<Vec<PeerAddress>> {
        let reply: PeersReply = self
            .emit(
                peer,
                Rpc::GetPeers,
                &EmptyRequest::default(),
                self.config.request_timeout,
                DEFAULT_MAX_PAYLOAD,
                true,
            )
            .await?;
        Ok(reply.0)
    }

    /// Highest of `ids` the peer also has.
    pub async fn has_common_blocks(
        &self,
        peer: &SharedPeer,
        ids: &[String],
        timeout: Duration,
    ) -> NetworkResult<Option<CommonBlock>> {
        if ids.len() > MAX_COMMON_BLOCK_IDS {
            return Err(NetworkError::InvalidMessage(format!(
                "{} ids exceeds {}",
                ids.len(),
                MAX_COMMON_BLOCK_IDS
            )));
        }
        let reply: CommonBlocksReply = self
            .emit(
                peer,
                Rpc::GetCommonBlocks,
                &CommonBlocksRequest { ids: ids.to_vec() },
                timeout,
                DEFAULT_MAX_PAYLOAD,
                true,
            )
            .await?;
        Ok(reply.common)
    }

    /// Blocks from `options.from_height + 1`, with transactions decoded.
    pub async fn get_peer_blocks(
        &self,
        peer: &SharedPeer,
        options: GetBlocksOptions,
    ) -> NetworkResult<Vec<Block>> {
        let request = GetBlocksRequest {
            last_block_height: options.from_height,
            block_limit: options.block_limit.min(MAX_BLOCKS_IN_REPLY as u32),
            headers_only: options.headers_only,
        };
        let reply: BlocksReply = self
            .emit(
                peer,
                Rpc::GetBlocks,
                &request,
                options.timeout.unwrap_or(self.config.get_blocks_timeout),
                BLOCKS_MAX_PAYLOAD,
                false,
            )
            .await?;

        let mut blocks = Vec::with_capacity(reply.0.len());
        let mut decoded = 0usize;
        for header in reply.0 {
            decoded += header.transactions.as_ref().map_or(0, Vec::len);
            let block = Block::from_header(header).map_err(|e| NetworkError::ProtocolViolation {
                rpc: Rpc::GetBlocks,
                reason: e.to_string(),
            })?;
            blocks.push(block);
            if decoded >= self.config.decode_yield_interval {
                decoded = 0;
                tokio::task::yield_now().await;
            }
        }
        Ok(blocks)
    }

    /// The peer's transaction pool. Undecodable entries are skipped.
    pub async fn get_unconfirmed_transactions(
        &self,
        peer: &SharedPeer,
    ) -> NetworkResult<Vec<Transaction>> {
        let reply: UnconfirmedTransactionsReply = self
            .emit(
                peer,
                Rpc::GetUnconfirmedTransactions,
                &EmptyRequest::default(),
                self.config.request_timeout,
                BLOCKS_MAX_PAYLOAD,
                false,
            )
            .await?;
        Ok(reply
            .transactions
            .iter()
            .filter_map(|tx| Transaction::from_hex(tx).ok())
            .collect())
    }

    /// Probe the peer's enabled sibling services and record the results.
    pub async fn ping_ports(&self, peer: &SharedPeer) {
        let (ip, plugins) = {
            let p = peer.read();
            (p.ip(), p.plugins.clone())
        };
        let probes = plugins
            .into_iter()
            .filter(|(_, plugin)| plugin.enabled)
            .map(|(name, plugin)| async move {
                let addr = SocketAddr::new(ip, plugin.port);
                let result = self.transport.probe(addr, self.config.ports_timeout).await;
                (name, result.ok())
            });
        let results = join_all(probes).await;

        let mut p = peer.write();
        for (name, latency) in results {
            trace!(peer = %p.addr, plugin = %name, reachable = latency.is_some(), "Port probed");
            p.ports.insert(name, latency);
        }
    }

    /// Close our session with `addr`.
    pub async fn disconnect(&self, addr: SocketAddr) {
        self.transport.disconnect(addr).await;
    }

    pub fn would_throttle_on_download(&self, peer: &SharedPeer) -> bool {
        self.would_throttle(peer, Rpc::GetBlocks)
    }

    pub fn would_throttle_on_fetching_peers(&self, peer: &SharedPeer) -> bool {
        self.would_throttle(peer, Rpc::GetPeers)
    }

    pub fn would_throttle_on_fetching_transactions(&self, peer: &SharedPeer) -> bool {
        self.would_throttle(peer, Rpc::GetUnconfirmedTransactions)
    }

    fn would_throttle(&self, peer: &SharedPeer, rpc: Rpc) -> bool {
        let ip = peer.read().ip();
        self.rate_limiter.has_exceeded_no_consume(ip, rpc)
    }
}
