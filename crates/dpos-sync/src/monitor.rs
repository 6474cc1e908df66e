//! Network monitor: keeps the peer set healthy and drives chain sync.
//!
//! The monitor owns the periodic maintenance loop (discovery, reseeding,
//! ping sweeps), reacts to network events and exposes the sync-facing
//! operations: block download, fork checks and relay.

use crate::broadcast::Broadcaster;
use crate::download::{BlockDownloader, DownloadConfig};
use crate::health::{self, NetworkStatus, PeerVote};
use crate::transactions::TransactionDownloader;
use crate::{SyncError, SyncResult};
use dashmap::DashSet;
use dpos_chain::{Block, Transaction};
use dpos_network::discovery::{check_dns, check_ntp, DEFAULT_DNS_HOSTS, DEFAULT_NTP_HOSTS};
use dpos_network::{
    AcceptOptions, EventBus, NetworkEvent, PeerCommunicator, PeerProcessor, PeerRepository,
    SharedPeer,
};
use futures::future::join_all;
use futures::StreamExt;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Peers tried first and used to reseed.
    pub seed_peers: Vec<SocketAddr>,
    /// Resolvers checked at boot. Empty skips the check.
    pub dns_hosts: Vec<String>,
    /// Time servers checked at boot. Empty skips the check.
    pub ntp_hosts: Vec<String>,
    pub connectivity_timeout: Duration,
    /// Peers below which we reseed.
    pub minimum_network_reach: usize,
    pub ignore_minimum_network_reach: bool,
    /// Ping budget for full sweeps.
    pub verify_timeout: Duration,
    /// Ping budget for fast sweeps.
    pub fast_ping_delay: Duration,
    pub max_concurrent_pings: usize,
    /// Peers asked for their peer lists per discovery.
    pub discovery_sample: usize,
    /// Addresses taken from each informant.
    pub max_peers_per_informant: usize,
    /// Don't discover at boot.
    pub skip_discovery: bool,
    /// Never discover.
    pub disable_discovery: bool,
    /// Genesis start: no peers to wait for.
    pub network_start: bool,
    /// Minimum time between event-driven ping sweeps.
    pub ping_sweep_interval: Duration,
    /// Delay between status updates.
    pub status_interval: Duration,
    /// Delay between status updates while below minimum reach.
    pub low_reach_interval: Duration,
    /// Delegate public keys forging on this node.
    pub local_delegates: Vec<String>,
    pub download: DownloadConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            seed_peers: Vec::new(),
            dns_hosts: DEFAULT_DNS_HOSTS.iter().map(|h| h.to_string()).collect(),
            ntp_hosts: DEFAULT_NTP_HOSTS.iter().map(|h| h.to_string()).collect(),
            connectivity_timeout: Duration::from_secs(5),
            minimum_network_reach: 20,
            ignore_minimum_network_reach: false,
            verify_timeout: Duration::from_secs(60),
            fast_ping_delay: Duration::from_millis(1500),
            max_concurrent_pings: 64,
            discovery_sample: 8,
            max_peers_per_informant: 50,
            skip_discovery: false,
            disable_discovery: false,
            network_start: false,
            ping_sweep_interval: Duration::from_secs(10),
            status_interval: Duration::from_secs(600),
            low_reach_interval: Duration::from_secs(60),
            local_delegates: Vec::new(),
            download: DownloadConfig::default(),
        }
    }
}

/// Options for [`NetworkMonitor::cleanse_peers`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanseOptions {
    /// Short deadline and header-only verification.
    pub fast: bool,
    /// Ping peers even if pinged recently.
    pub force_ping: bool,
    /// Ping a random sample of this size instead of everyone.
    pub peer_count: Option<usize>,
}

struct UpdateGuard<'a>(&'a AtomicBool);

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Peer-set maintenance and sync entry points.
pub struct NetworkMonitor {
    config: MonitorConfig,
    communicator: Arc<PeerCommunicator>,
    processor: Arc<PeerProcessor>,
    downloader: BlockDownloader,
    transactions: TransactionDownloader,
    broadcaster: Broadcaster,
    /// A status update is running.
    updating: AtomicBool,
    initializing: AtomicBool,
    cold_start: AtomicBool,
    last_ping_sweep: Mutex<Option<Instant>>,
    shutdown: CancellationToken,
}

impl NetworkMonitor {
    pub fn new(
        config: MonitorConfig,
        communicator: Arc<PeerCommunicator>,
        processor: Arc<PeerProcessor>,
    ) -> Self {
        let downloader = BlockDownloader::new(config.download.clone(), communicator.clone());
        let transactions = TransactionDownloader::new(communicator.clone());
        let broadcaster = Broadcaster::new(communicator.clone());
        let cold_start = config.network_start;
        Self {
            config,
            communicator,
            processor,
            downloader,
            transactions,
            broadcaster,
            updating: AtomicBool::new(false),
            initializing: AtomicBool::new(true),
            cold_start: AtomicBool::new(cold_start),
            last_ping_sweep: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn communicator(&self) -> &Arc<PeerCommunicator> {
        &self.communicator
    }

    pub fn downloader(&self) -> &BlockDownloader {
        &self.downloader
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    fn repository(&self) -> &Arc<PeerRepository> {
        self.communicator.repository()
    }

    fn events(&self) -> &EventBus {
        self.communicator.events()
    }

    /// Token cancelled by [`NetworkMonitor::shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the run loop and the event listener.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Connectivity checks, seeding and initial discovery. Starts the event
    /// listener.
    pub async fn boot(self: &Arc<Self>) -> SyncResult<JoinHandle<()>> {
        let listener = self.spawn_event_listener();

        if let Err(e) = self.check_connectivity().await {
            error!(error = %e, "Connectivity check failed");
        }

        let seeded = self.populate_seed_peers().await;
        info!(seeded, "Seed peers populated");

        if self.config.skip_discovery {
            warn!("Skipped peer discovery because the relay is in skip-discovery mode");
        } else {
            self.update_network_status(true).await;
        }

        self.log_peer_versions();
        self.initializing.store(false, Ordering::SeqCst);
        Ok(listener)
    }

    async fn check_connectivity(&self) -> SyncResult<()> {
        let timeout = self.config.connectivity_timeout;
        if !self.config.dns_hosts.is_empty() {
            let host = check_dns(&self.config.dns_hosts, timeout).await?;
            info!(host = %host, "DNS connectivity verified");
        }
        if !self.config.ntp_hosts.is_empty() {
            match check_ntp(&self.config.ntp_hosts, timeout).await {
                Ok((host, offset_ms)) => info!(host = %host, offset_ms, "NTP connectivity verified"),
                Err(e) => warn!(error = %e, "NTP connectivity check failed"),
            }
        }
        Ok(())
    }

    fn spawn_event_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let mut events = self.events().subscribe();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(NetworkEvent::ChainSynced { .. }) | Ok(NetworkEvent::RoundApplied { .. }) => {
                        if monitor.claim_ping_sweep() {
                            let monitor = Arc::clone(&monitor);
                            tokio::spawn(async move {
                                monitor
                                    .cleanse_peers(CleanseOptions {
                                        fast: true,
                                        force_ping: true,
                                        peer_count: None,
                                    })
                                    .await;
                            });
                        }
                    }
                    Ok(NetworkEvent::PeerDisconnect { addr, reason }) => {
                        debug!(peer = %addr, reason = %reason, "Disconnect requested");
                        monitor.disconnect_peer(addr).await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Network monitor fell behind on events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Network event listener stopped");
        })
    }

    /// Whether an event-driven ping sweep may start now.
    fn claim_ping_sweep(&self) -> bool {
        let mut last = self.last_ping_sweep.lock();
        match *last {
            Some(at) if at.elapsed() < self.config.ping_sweep_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    /// Run periodic status updates until shut down.
    pub async fn run(&self) {
        loop {
            let next = self.update_network_status(false).await;
            debug!(next_secs = next.as_secs(), "Next network status update scheduled");
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(next) => {}
            }
        }
        info!("Network monitor stopped");
    }

    /// Discover, cleanse and reseed as needed. Returns the delay until the
    /// next update. Concurrent calls return at once.
    pub async fn update_network_status(&self, initial: bool) -> Duration {
        if self.updating.swap(true, Ordering::SeqCst) {
            debug!("Network status update already in progress");
            return self.config.status_interval;
        }
        let _guard = UpdateGuard(&self.updating);

        if self.config.network_start {
            self.cold_start.store(true, Ordering::SeqCst);
            warn!("Entering cold start because the relay is in genesis-start mode");
            return self.config.status_interval;
        }
        if self.config.disable_discovery {
            warn!("Skipped peer discovery because the relay is in non-discovery mode");
            return self.config.status_interval;
        }

        if self.discover_peers(initial).await {
            self.cleanse_peers(CleanseOptions::default()).await;
        }

        if self.has_minimum_peers() {
            self.config.status_interval
        } else {
            info!(
                peers = self.repository().count(),
                minimum = self.config.minimum_network_reach,
                "Couldn't find enough peers, falling back to seed peers"
            );
            self.populate_seed_peers().await;
            self.config.low_reach_interval
        }
    }

    /// Accept configured seeds we don't already know. Returns how many were
    /// accepted.
    pub async fn populate_seed_peers(&self) -> usize {
        if self.config.seed_peers.is_empty() {
            warn!("No seed peers configured");
            return 0;
        }
        let seeds: Vec<SocketAddr> = self
            .config
            .seed_peers
            .iter()
            .filter(|addr| !self.repository().has_peer(addr))
            .copied()
            .collect();
        let options = AcceptOptions {
            seed: true,
            less_verbose: true,
        };
        let results = join_all(
            seeds
                .iter()
                .map(|addr| self.processor.validate_and_accept_peer(*addr, options)),
        )
        .await;
        results.iter().filter(|r| r.is_ok()).count()
    }

    /// Ask a sample of peers for theirs and try to accept the new ones.
    /// Returns whether candidates were processed and a cleanse is due.
    pub async fn discover_peers(&self, ping_all: bool) -> bool {
        let own_peers = self.repository().peers();
        let mut informants: Vec<SharedPeer> = own_peers
            .iter()
            .filter(|p| !self.communicator.would_throttle_on_fetching_peers(p))
            .cloned()
            .collect();
        informants.shuffle(&mut rand::thread_rng());
        informants.truncate(self.config.discovery_sample);

        let replies = join_all(informants.iter().map(|p| self.communicator.get_peers(p))).await;

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for (informant, reply) in informants.iter().zip(replies) {
            let mut addrs: Vec<SocketAddr> = match reply {
                Ok(list) => list.iter().filter_map(|a| a.to_socket_addr()).collect(),
                Err(e) => {
                    debug!(peer = %informant.read().addr, error = %e, "Could not fetch peer list");
                    continue;
                }
            };
            addrs.shuffle(&mut rand::thread_rng());
            addrs.truncate(self.config.max_peers_per_informant);
            candidates.extend(addrs.into_iter().filter(|a| seen.insert(*a)));
        }

        let behind = (own_peers.len() as f64) < candidates.len() as f64 * 0.75;
        if ping_all || !self.has_minimum_peers() || behind {
            debug!(candidates = candidates.len(), "Processing discovered peers");
            let options = AcceptOptions {
                seed: false,
                less_verbose: true,
            };
            let accepted = join_all(
                candidates
                    .iter()
                    .map(|addr| self.processor.validate_and_accept_peer(*addr, options)),
            )
            .await
            .iter()
            .filter(|r| r.is_ok())
            .count();
            if accepted > 0 {
                info!(accepted, "Discovered new peers");
            }
            self.ping_peer_ports(ping_all).await;
            return true;
        }

        self.ping_peer_ports(false).await;
        false
    }

    /// Probe sibling service ports. Without `ping_all`, only peers never
    /// probed.
    pub async fn ping_peer_ports(&self, ping_all: bool) {
        let peers: Vec<SharedPeer> = self
            .repository()
            .peers()
            .into_iter()
            .filter(|p| ping_all || p.read().ports.is_empty())
            .collect();
        futures::stream::iter(peers)
            .for_each_concurrent(self.config.max_concurrent_pings.max(1), |peer| async move {
                self.communicator.ping_ports(&peer).await;
            })
            .await;
    }

    /// Ping peers within a bounded wall-clock budget.
    ///
    /// Failed pings disconnect the peer. Pings still running when the budget
    /// runs out are abandoned and their peers get one infraction each.
    pub async fn cleanse_peers(&self, options: CleanseOptions) {
        let mut peers = self.repository().peers();
        if let Some(count) = options.peer_count {
            peers.shuffle(&mut rand::thread_rng());
            peers.truncate(count);
        }
        let total = peers.len();
        if total == 0 {
            return;
        }

        let ping_delay = if options.fast {
            self.config.fast_ping_delay
        } else {
            self.config.verify_timeout
        };
        info!(peers = total, fast = options.fast, "Checking peers");

        let in_flight: DashSet<SocketAddr> = DashSet::new();
        let unresponsive = AtomicUsize::new(0);
        let semaphore = Semaphore::new(self.config.max_concurrent_pings.max(1));
        let milestones = self.communicator.chain().milestones.clone();

        {
            let pings = join_all(peers.iter().map(|peer| {
                let (in_flight, unresponsive, semaphore) = (&in_flight, &unresponsive, &semaphore);
                let milestones = milestones.as_ref();
                async move {
                    let Ok(_permit) = semaphore.acquire().await else {
                        return;
                    };
                    let addr = peer.read().addr;
                    in_flight.insert(addr);
                    let result = self
                        .communicator
                        .ping(peer, ping_delay, milestones, options.force_ping, options.fast)
                        .await;
                    in_flight.remove(&addr);
                    if let Err(e) = result {
                        unresponsive.fetch_add(1, Ordering::Relaxed);
                        debug!(peer = %addr, error = %e, "Removing peer after failed ping");
                        self.disconnect_peer(addr).await;
                    }
                }
            }));
            let deadline = tokio::time::sleep(ping_delay);
            tokio::pin!(pings);
            tokio::pin!(deadline);
            tokio::select! {
                biased;
                _ = &mut deadline => debug!(in_flight = in_flight.len(), "Ping budget exhausted"),
                _ = &mut pings => {}
            }
        }

        let slow: Vec<SocketAddr> = in_flight.iter().map(|a| *a).collect();
        for addr in slow {
            let Some(peer) = self.repository().peer(&addr) else {
                continue;
            };
            let ignored = {
                let mut p = peer.write();
                p.add_infraction();
                p.is_ignored()
            };
            debug!(peer = %addr, ignored, "Peer too slow to respond to ping");
            if ignored {
                self.disconnect_peer(addr).await;
            }
        }

        if self.initializing.load(Ordering::SeqCst) {
            let unresponsive = unresponsive.load(Ordering::Relaxed);
            info!(
                responsive = total.saturating_sub(unresponsive),
                total,
                "Peers on the network are responsive"
            );
            info!(height = self.network_height(), "Median network height");
        }
    }

    /// Drop `addr` from the peer set and close its session.
    pub async fn disconnect_peer(&self, addr: SocketAddr) {
        let known = self.repository().forget_peer(&addr).is_some();
        self.communicator.disconnect(addr).await;
        if known {
            debug!(peer = %addr, "Peer removed");
            self.events().publish(NetworkEvent::PeerRemoved(addr));
        }
    }

    /// Median height claimed by our peers.
    pub fn network_height(&self) -> u32 {
        health::network_height(&self.repository().peers())
    }

    pub fn has_minimum_peers(&self) -> bool {
        self.config.ignore_minimum_network_reach
            || self.repository().count() >= self.config.minimum_network_reach
    }

    pub fn is_cold_start(&self) -> bool {
        self.cold_start.load(Ordering::SeqCst)
    }

    pub fn complete_cold_start(&self) {
        if self.cold_start.swap(false, Ordering::SeqCst) {
            info!("Cold start completed");
        }
    }

    /// Re-verify every peer, then judge forks.
    pub async fn check_network_health(&self) -> SyncResult<NetworkStatus> {
        self.cleanse_peers(CleanseOptions {
            fast: false,
            force_ping: true,
            peer_count: None,
        })
        .await;
        self.check_for_fork().await
    }

    /// Judge forks from the verification results we already hold.
    pub async fn check_for_fork(&self) -> SyncResult<NetworkStatus> {
        let chain = self.communicator.chain();
        let our_height = chain.store.last_height().await?;
        let round = chain.milestones.round_info(our_height);
        let active = chain.delegates.active_delegates(&round).await?;
        let own_weight = self
            .config
            .local_delegates
            .iter()
            .filter(|key| active.contains(key))
            .count();

        let votes: Vec<PeerVote> = self
            .repository()
            .peers()
            .iter()
            .filter_map(|peer| {
                let p = peer.read();
                let verification = p.verification_result?;
                Some(PeerVote {
                    addr: p.addr,
                    height: p.height().unwrap_or(verification.their_height),
                    verification,
                    delegates: p.public_keys.iter().filter(|k| active.contains(k)).count(),
                })
            })
            .collect();

        if votes.is_empty() {
            debug!("No verified peers to judge forks");
            return Ok(NetworkStatus::not_forked());
        }
        Ok(health::evaluate(our_height, round.max_delegates, own_weight, &votes))
    }

    /// Blocks above `from_height`, see [`BlockDownloader`].
    pub async fn download_blocks_from_height(
        &self,
        from_height: u32,
        max_parallel: Option<usize>,
    ) -> SyncResult<Vec<Block>> {
        if self.repository().is_empty() {
            return Err(SyncError::NoPeers);
        }
        let max_parallel = max_parallel.unwrap_or(self.config.download.max_parallel);
        Ok(self
            .downloader
            .download_blocks_from_height(from_height, max_parallel)
            .await)
    }

    pub async fn download_transactions(&self) -> Vec<Transaction> {
        self.transactions.download_transactions().await
    }

    pub async fn broadcast_block(&self, block: &Block, from_forger: bool) -> usize {
        self.broadcaster.broadcast_block(block, from_forger).await
    }

    pub async fn broadcast_transactions(&self, transactions: &[Transaction]) -> usize {
        self.broadcaster.broadcast_transactions(transactions).await
    }

    fn log_peer_versions(&self) {
        let mut versions: BTreeMap<String, usize> = BTreeMap::new();
        for peer in self.repository().peers() {
            let version = peer.read().version.clone().unwrap_or_else(|| "unknown".into());
            *versions.entry(version).or_default() += 1;
        }
        for (version, count) in versions {
            info!(version = %version, peers = count, "Discovered peers by version");
        }
    }
}
