//! Network monitor tests: cleansing, discovery, block download, relay and
//! fork checks against a simulated network.

use crate::generators::{delegate_keys, test_transaction, ChainBuilder};
use crate::harness::{peer_addr, Behavior, SimPeer, TestContext};
use dpos_chain::Block;
use dpos_network::message::Rpc;
use dpos_network::NetworkEvent;
use dpos_sync::{Broadcaster, CleanseOptions, MonitorConfig, NetworkStatus, SyncError};
use std::time::{Duration, Instant};

fn fast_sweep() -> CleanseOptions {
    CleanseOptions {
        fast: true,
        force_ping: true,
        peer_count: None,
    }
}

fn quick_config() -> MonitorConfig {
    MonitorConfig {
        fast_ping_delay: Duration::from_millis(300),
        ..TestContext::quiet_monitor_config()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

// ============================================================================
// Cleansing
// ============================================================================

#[tokio::test]
async fn test_fast_cleanse_penalizes_hanging_peer() {
    let chain = ChainBuilder::unsigned().build(20);
    let ctx = TestContext::new(&chain, &[]);
    for n in 1..=9 {
        ctx.add_known_peer(peer_addr(n), SimPeer::new(chain.clone()));
    }
    let slow = peer_addr(10);
    ctx.add_known_peer(slow, SimPeer::new(chain.clone()).behavior(Behavior::Hang));
    let monitor = ctx.monitor(quick_config());

    let started = Instant::now();
    monitor.cleanse_peers(fast_sweep()).await;

    assert!(started.elapsed() < Duration::from_millis(1500));
    assert_eq!(ctx.repository.count(), 10);
    let peer = ctx.repository.peer(&slow).unwrap();
    assert_eq!(peer.write().infraction_count(), 1);
    for n in 1..=9 {
        let peer = ctx.repository.peer(&peer_addr(n)).unwrap();
        let p = peer.read();
        assert!(p.fast_verification_result.is_some());
        assert!(!p.stale);
    }
}

#[tokio::test]
async fn test_repeatedly_slow_peer_is_dropped() {
    let chain = ChainBuilder::unsigned().build(20);
    let ctx = TestContext::new(&chain, &[]);
    let slow = peer_addr(1);
    ctx.add_known_peer(slow, SimPeer::new(chain.clone()).behavior(Behavior::Hang));
    let monitor = ctx.monitor(quick_config());

    monitor.cleanse_peers(fast_sweep()).await;
    monitor.cleanse_peers(fast_sweep()).await;
    assert!(ctx.repository.has_peer(&slow));

    monitor.cleanse_peers(fast_sweep()).await;
    assert!(!ctx.repository.has_peer(&slow));
}

#[tokio::test]
async fn test_failed_ping_removes_peer() {
    let chain = ChainBuilder::unsigned().build(20);
    let ctx = TestContext::new(&chain, &[]);
    let good = peer_addr(1);
    let bad = peer_addr(2);
    ctx.add_known_peer(good, SimPeer::new(chain.clone()));
    ctx.add_known_peer(bad, SimPeer::new(chain.clone()).nethash(&"00".repeat(32)));
    let monitor = ctx.monitor(quick_config());
    let mut events = ctx.events.subscribe();

    monitor.cleanse_peers(CleanseOptions::default()).await;

    assert!(ctx.repository.has_peer(&good));
    assert!(!ctx.repository.has_peer(&bad));
    assert!(ctx.network.disconnects().contains(&bad));
    assert!(matches!(events.try_recv(), Ok(NetworkEvent::PeerRemoved(a)) if a == bad));
}

#[tokio::test]
async fn test_cleanse_sample_size() {
    let chain = ChainBuilder::unsigned().build(5);
    let ctx = TestContext::new(&chain, &[]);
    for n in 1..=6 {
        ctx.add_known_peer(peer_addr(n), SimPeer::new(chain.clone()));
    }
    let monitor = ctx.monitor(quick_config());

    monitor
        .cleanse_peers(CleanseOptions {
            peer_count: Some(2),
            ..fast_sweep()
        })
        .await;

    assert_eq!(ctx.network.requests(Rpc::GetStatus), 2);
}

#[tokio::test]
async fn test_disconnect_peer() {
    let chain = ChainBuilder::unsigned().build(5);
    let ctx = TestContext::new(&chain, &[]);
    let addr = peer_addr(1);
    ctx.add_known_peer(addr, SimPeer::new(chain.clone()));
    let monitor = ctx.monitor(quick_config());
    let mut events = ctx.events.subscribe();

    monitor.disconnect_peer(peer_addr(9)).await;
    assert!(events.try_recv().is_err());

    monitor.disconnect_peer(addr).await;
    assert!(!ctx.repository.has_peer(&addr));
    assert!(matches!(events.try_recv(), Ok(NetworkEvent::PeerRemoved(a)) if a == addr));
}

#[tokio::test]
async fn test_disconnect_request_is_handled_by_listener() {
    let chain = ChainBuilder::unsigned().build(5);
    let ctx = TestContext::new(&chain, &[]);
    let addr = peer_addr(1);
    ctx.add_known_peer(addr, SimPeer::new(chain.clone()));
    let monitor = ctx.monitor(MonitorConfig {
        skip_discovery: true,
        ..quick_config()
    });

    let listener = monitor.boot().await.unwrap();
    ctx.events.publish(NetworkEvent::PeerDisconnect {
        addr,
        reason: "test".to_string(),
    });

    assert!(wait_until(|| !ctx.repository.has_peer(&addr)).await);
    monitor.shutdown();
    listener.await.unwrap();
}

// ============================================================================
// Discovery and Seeding
// ============================================================================

#[tokio::test]
async fn test_seed_peers_fill_repository() {
    let chain = ChainBuilder::unsigned().build(10);
    let ctx = TestContext::new(&chain, &[]);
    ctx.add_remote(peer_addr(1), SimPeer::new(chain.clone()));
    ctx.add_remote(peer_addr(2), SimPeer::new(chain.clone()).behavior(Behavior::Refuse));
    let monitor = ctx.monitor(MonitorConfig {
        seed_peers: vec![peer_addr(1), peer_addr(2)],
        minimum_network_reach: 2,
        ..quick_config()
    });

    assert_eq!(monitor.populate_seed_peers().await, 1);
    assert!(ctx.repository.peer(&peer_addr(1)).unwrap().read().seed);
    assert!(!monitor.has_minimum_peers());
    // Known seeds are not contacted again.
    assert_eq!(monitor.populate_seed_peers().await, 0);
    assert_eq!(ctx.network.requests_to(peer_addr(1), Rpc::GetStatus), 1);
}

#[tokio::test]
async fn test_ignore_minimum_network_reach() {
    let chain = ChainBuilder::unsigned().build(10);
    let ctx = TestContext::new(&chain, &[]);
    let monitor = ctx.monitor(MonitorConfig {
        ignore_minimum_network_reach: true,
        ..quick_config()
    });
    assert!(monitor.has_minimum_peers());
}

#[tokio::test]
async fn test_discover_peers_from_informant() {
    let chain = ChainBuilder::unsigned().build(10);
    let ctx = TestContext::new(&chain, &[]);
    let (b, c) = (peer_addr(2), peer_addr(3));
    ctx.add_known_peer(peer_addr(1), SimPeer::new(chain.clone()).knows(&[b, c]));
    ctx.add_remote(b, SimPeer::new(chain.clone()));
    ctx.add_remote(c, SimPeer::new(chain.clone()));
    let monitor = ctx.monitor(quick_config());

    assert!(monitor.discover_peers(false).await);
    assert!(ctx.repository.has_peer(&b));
    assert!(ctx.repository.has_peer(&c));
}

#[tokio::test]
async fn test_status_update_falls_back_to_seeds() {
    let chain = ChainBuilder::unsigned().build(10);
    let ctx = TestContext::new(&chain, &[]);
    let seed = peer_addr(5);
    ctx.add_known_peer(peer_addr(1), SimPeer::new(chain.clone()).knows(&[peer_addr(2)]));
    ctx.add_remote(peer_addr(2), SimPeer::new(chain.clone()));
    ctx.add_remote(seed, SimPeer::new(chain.clone()));
    let config = MonitorConfig {
        seed_peers: vec![seed],
        ..quick_config()
    };
    let monitor = ctx.monitor(config.clone());

    let next = monitor.update_network_status(true).await;

    assert_eq!(next, config.low_reach_interval);
    assert_eq!(ctx.repository.count(), 3);
    assert!(ctx.repository.peer(&seed).unwrap().read().seed);
}

#[tokio::test]
async fn test_disabled_discovery() {
    let chain = ChainBuilder::unsigned().build(10);
    let ctx = TestContext::new(&chain, &[]);
    ctx.add_known_peer(peer_addr(1), SimPeer::new(chain.clone()).knows(&[peer_addr(2)]));
    let config = MonitorConfig {
        disable_discovery: true,
        ..quick_config()
    };
    let monitor = ctx.monitor(config.clone());

    assert_eq!(monitor.update_network_status(false).await, config.status_interval);
    assert_eq!(ctx.network.requests(Rpc::GetPeers), 0);
}

#[tokio::test]
async fn test_cold_start() {
    let chain = ChainBuilder::unsigned().build(1);
    let ctx = TestContext::new(&chain, &[]);
    let monitor = ctx.monitor(MonitorConfig {
        network_start: true,
        ..quick_config()
    });

    assert!(monitor.is_cold_start());
    monitor.update_network_status(true).await;
    assert!(monitor.is_cold_start());
    monitor.complete_cold_start();
    assert!(!monitor.is_cold_start());
}

#[tokio::test]
async fn test_network_height_is_median() {
    let builder = ChainBuilder::unsigned();
    let chain = builder.build(30);
    let ctx = TestContext::new(&chain, &[]);
    let monitor = ctx.monitor(quick_config());
    assert_eq!(monitor.network_height(), 0);

    for (n, height) in [(1u8, 10usize), (2, 30), (3, 20)] {
        ctx.add_known_peer(peer_addr(n), SimPeer::new(chain[..height].to_vec()));
    }
    assert_eq!(monitor.network_height(), 20);
}

// ============================================================================
// Block Download
// ============================================================================

#[tokio::test]
async fn test_download_without_peers() {
    let chain = ChainBuilder::unsigned().build(1);
    let ctx = TestContext::new(&chain, &[]);
    let monitor = ctx.monitor(quick_config());

    let result = monitor.download_blocks_from_height(1, None).await;
    assert!(matches!(result, Err(SyncError::NoPeers)));
}

#[tokio::test]
async fn test_download_keeps_chunks_after_a_failed_one() {
    let builder = ChainBuilder::unsigned();
    let network_chain = builder.build(1600);
    let ctx = TestContext::new(&network_chain[..1], &[]);
    let peers: Vec<_> = (1..=4).map(peer_addr).collect();
    for addr in &peers {
        ctx.add_known_peer(
            *addr,
            SimPeer::new(network_chain.clone())
                .failing_blocks_after(801, Duration::from_millis(200)),
        );
    }
    let monitor = ctx.monitor(quick_config());

    let blocks = monitor.download_blocks_from_height(1, None).await.unwrap();

    let heights: Vec<u32> = blocks.iter().map(Block::height).collect();
    assert_eq!(heights, (2..=801).collect::<Vec<_>>());
    assert!(monitor.downloader().is_cached(1201));
    assert_eq!(monitor.downloader().chunk_size(), 400);

    for addr in &peers {
        ctx.network.update_peer(*addr, |sim| sim.failing_blocks.clear());
    }
    let before = ctx.network.requests(Rpc::GetBlocks);
    let blocks = monitor.download_blocks_from_height(801, None).await.unwrap();

    assert_eq!(blocks.first().map(Block::height), Some(802));
    assert_eq!(blocks.last().map(Block::height), Some(1600));
    assert_eq!(blocks.len(), 799);
    assert_eq!(ctx.network.requests(Rpc::GetBlocks) - before, 1);
    assert!(!monitor.downloader().is_cached(1201));
}

#[tokio::test]
async fn test_download_chunk_size_shrinks_on_failure() {
    let builder = ChainBuilder::unsigned();
    let network_chain = builder.build(100);
    let ctx = TestContext::new(&network_chain[..1], &[]);
    let addr = peer_addr(1);
    ctx.add_known_peer(
        addr,
        SimPeer::new(network_chain.clone()).failing_blocks_after(1, Duration::ZERO),
    );
    let monitor = ctx.monitor(quick_config());

    assert!(monitor.download_blocks_from_height(1, None).await.unwrap().is_empty());
    assert_eq!(monitor.downloader().chunk_size(), 40);
    assert!(monitor.download_blocks_from_height(1, None).await.unwrap().is_empty());
    assert_eq!(monitor.downloader().chunk_size(), 4);

    ctx.network.update_peer(addr, |sim| sim.failing_blocks.clear());
    let blocks = monitor.download_blocks_from_height(1, None).await.unwrap();
    let heights: Vec<u32> = blocks.iter().map(Block::height).collect();
    assert_eq!(heights, vec![2, 3, 4, 5]);
    assert_eq!(monitor.downloader().chunk_size(), 400);
    assert_eq!(ctx.network.block_limits(), vec![400, 40, 4]);

    let blocks = monitor.download_blocks_from_height(5, None).await.unwrap();
    assert_eq!(blocks.len(), 95);
    assert_eq!(ctx.network.block_limits().last(), Some(&400));
}

#[tokio::test]
async fn test_download_skips_forked_peers() {
    let keys = delegate_keys(5);
    let ours = ChainBuilder::signed(&keys).build(30);
    let forked = ChainBuilder::signed(&keys).salt(1).fork(&ours, 12, 60);
    let ctx = TestContext::new(&ours, &keys);
    let addr = peer_addr(1);
    let peer = ctx.add_known_peer(addr, SimPeer::new(forked));
    ctx.communicator
        .ping(&peer, Duration::from_secs(5), ctx.chain.milestones.as_ref(), true, false)
        .await
        .unwrap();
    assert!(peer.read().is_forked());
    let monitor = ctx.monitor(quick_config());
    let before = ctx.network.requests(Rpc::GetBlocks);

    let blocks = monitor.download_blocks_from_height(30, None).await.unwrap();

    assert!(blocks.is_empty());
    assert_eq!(ctx.network.requests(Rpc::GetBlocks), before);
}

// ============================================================================
// Relay
// ============================================================================

#[tokio::test]
async fn test_repeat_block_broadcast_waits_for_window() {
    let chain = ChainBuilder::unsigned().build(10);
    let ctx = TestContext::new(&chain, &[]);
    for n in 1..=3 {
        ctx.add_known_peer(peer_addr(n), SimPeer::new(chain.clone()));
    }
    let broadcaster =
        Broadcaster::new(ctx.communicator.clone()).with_window(Duration::from_millis(200));
    let tip = Block::from_header(chain[9].clone()).unwrap();

    assert_eq!(broadcaster.broadcast_block(&tip, false).await, 3);
    let started = Instant::now();
    assert_eq!(broadcaster.broadcast_block(&tip, false).await, 3);
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(ctx.network.requests(Rpc::PostBlock), 6);
}

#[tokio::test]
async fn test_repeat_broadcast_skipped_when_tip_moved() {
    let builder = ChainBuilder::unsigned();
    let chain = builder.build(10);
    let next = builder.extend(chain.clone(), 11);
    let ctx = TestContext::new(&chain, &[]);
    ctx.add_known_peer(peer_addr(1), SimPeer::new(chain.clone()));
    let broadcaster =
        Broadcaster::new(ctx.communicator.clone()).with_window(Duration::from_millis(100));
    let block = Block::from_header(next[10].clone()).unwrap();

    assert_eq!(broadcaster.broadcast_block(&block, false).await, 1);
    assert_eq!(broadcaster.broadcast_block(&block, false).await, 0);
    assert_eq!(ctx.network.requests(Rpc::PostBlock), 1);
}

#[tokio::test]
async fn test_forged_block_is_not_delayed() {
    let chain = ChainBuilder::unsigned().build(10);
    let ctx = TestContext::new(&chain, &[]);
    ctx.add_known_peer(peer_addr(1), SimPeer::new(chain.clone()));
    let broadcaster =
        Broadcaster::new(ctx.communicator.clone()).with_window(Duration::from_secs(5));
    let tip = Block::from_header(chain[9].clone()).unwrap();

    let started = Instant::now();
    broadcaster.broadcast_block(&tip, true).await;
    broadcaster.broadcast_block(&tip, false).await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(ctx.network.requests(Rpc::PostBlock), 2);
}

#[tokio::test]
async fn test_transaction_broadcast_sample() {
    let chain = ChainBuilder::unsigned().build(5);
    let ctx = TestContext::new(&chain, &[]);
    for n in 1..=5 {
        ctx.add_known_peer(peer_addr(n), SimPeer::new(chain.clone()));
    }
    let broadcaster = Broadcaster::new(ctx.communicator.clone()).with_max_peers_broadcast(2);

    let sent = broadcaster
        .broadcast_transactions(&[test_transaction(1), test_transaction(2)])
        .await;

    assert_eq!(sent, 2);
    assert_eq!(ctx.network.requests(Rpc::PostTransactions), 2);
}

#[tokio::test]
async fn test_transaction_download_dedups() {
    let chain = ChainBuilder::unsigned().build(5);
    let ctx = TestContext::new(&chain, &[]);
    let (tx1, tx2, tx3) = (test_transaction(1), test_transaction(2), test_transaction(3));
    ctx.add_known_peer(
        peer_addr(1),
        SimPeer::new(chain.clone()).pool(vec![tx1.to_hex(), tx2.to_hex()]),
    );
    ctx.add_known_peer(
        peer_addr(2),
        SimPeer::new(chain.clone()).pool(vec![tx2.to_hex(), tx3.to_hex()]),
    );
    // Behind us: not asked.
    ctx.add_known_peer(
        peer_addr(3),
        SimPeer::new(chain[..3].to_vec()).pool(vec![test_transaction(4).to_hex()]),
    );
    let monitor = ctx.monitor(quick_config());

    let mut ids: Vec<String> = monitor
        .download_transactions()
        .await
        .into_iter()
        .map(|tx| tx.id)
        .collect();
    ids.sort();
    let mut expected = vec![tx1.id, tx2.id, tx3.id];
    expected.sort();
    assert_eq!(ids, expected);
    assert_eq!(
        ctx.network.requests_to(peer_addr(3), Rpc::GetUnconfirmedTransactions),
        0
    );

    assert!(monitor.download_transactions().await.is_empty());
}

// ============================================================================
// Network Health
// ============================================================================

#[tokio::test]
async fn test_health_check_reports_fork() {
    let keys = delegate_keys(5);
    let ours = ChainBuilder::signed(&keys).build(30);
    let theirs = ChainBuilder::signed(&keys).salt(1).fork(&ours, 12, 35);
    let ctx = TestContext::new(&ours, &keys);
    for n in 1..=3 {
        ctx.add_known_peer(peer_addr(n), SimPeer::new(theirs.clone()));
    }
    let monitor = ctx.monitor(quick_config());

    let status = monitor.check_network_health().await.unwrap();

    assert_eq!(status, NetworkStatus::rollback(18));
}

#[tokio::test]
async fn test_health_check_on_canonical_chain() {
    let keys = delegate_keys(5);
    let builder = ChainBuilder::signed(&keys);
    let ours = builder.build(30);
    let ahead = builder.extend(ours.clone(), 35);
    let forked = ChainBuilder::signed(&keys).salt(1).fork(&ours, 12, 35);
    let ctx = TestContext::new(&ours, &keys);
    for n in 1..=3 {
        ctx.add_known_peer(peer_addr(n), SimPeer::new(ahead.clone()));
    }
    ctx.add_known_peer(peer_addr(4), SimPeer::new(forked));
    let monitor = ctx.monitor(quick_config());

    let status = monitor.check_network_health().await.unwrap();

    assert_eq!(status, NetworkStatus::not_forked());
}

#[tokio::test]
async fn test_fork_check_without_verified_peers() {
    let chain = ChainBuilder::unsigned().build(10);
    let ctx = TestContext::new(&chain, &[]);
    ctx.add_known_peer(peer_addr(1), SimPeer::new(chain.clone()));
    let monitor = ctx.monitor(quick_config());

    assert_eq!(monitor.check_for_fork().await.unwrap(), NetworkStatus::not_forked());
}
