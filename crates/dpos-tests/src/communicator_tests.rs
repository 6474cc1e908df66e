//! Communicator tests: handshake checks, error accounting and the RPC
//! helpers.

use crate::generators::{delegate_keys, public_key_hex, test_transaction, ChainBuilder};
use crate::harness::{peer_addr, permissive_rate_limits, Behavior, SimPeer, TestContext};
use dpos_chain::Block;
use dpos_network::message::Rpc;
use dpos_network::{
    CommunicatorConfig, GetBlocksOptions, NetworkError, NetworkEvent, RateLimit, SharedPeer,
};
use std::time::Duration;

const PING_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_nethash_mismatch_fails_ping() {
    let chain = ChainBuilder::unsigned().build(10);
    let ctx = TestContext::new(&chain, &[]);
    let peer = ctx.add_known_peer(
        peer_addr(1),
        SimPeer::new(chain.clone()).nethash(&"00".repeat(32)),
    );

    let result = ctx
        .communicator
        .ping(&peer, PING_TIMEOUT, ctx.chain.milestones.as_ref(), true, false)
        .await;

    assert!(matches!(result, Err(NetworkError::VerificationFailed(_))));
    assert!(peer.read().last_pinged.is_none());
}

#[tokio::test]
async fn test_incompatible_version_fails_ping() {
    let chain = ChainBuilder::unsigned().build(10);
    let ctx = TestContext::new(&chain, &[]);
    let peer = ctx.add_known_peer(peer_addr(1), SimPeer::new(chain.clone()).version("2.6.0"));

    let result = ctx
        .communicator
        .ping(&peer, PING_TIMEOUT, ctx.chain.milestones.as_ref(), true, false)
        .await;

    assert!(matches!(result, Err(NetworkError::VerificationFailed(_))));
}

#[tokio::test]
async fn test_recent_ping_is_cached() {
    let chain = ChainBuilder::unsigned().build(10);
    let ctx = TestContext::new(&chain, &[]);
    let addr = peer_addr(1);
    let peer = ctx.add_known_peer(addr, SimPeer::new(chain.clone()));
    let milestones = ctx.chain.milestones.clone();

    ctx.communicator
        .ping(&peer, PING_TIMEOUT, milestones.as_ref(), false, false)
        .await
        .unwrap();
    let cached = ctx
        .communicator
        .ping(&peer, PING_TIMEOUT, milestones.as_ref(), false, false)
        .await
        .unwrap();
    assert_eq!(cached.map(|s| s.height), Some(10));
    assert_eq!(ctx.network.requests_to(addr, Rpc::GetStatus), 1);

    ctx.communicator
        .ping(&peer, PING_TIMEOUT, milestones.as_ref(), true, false)
        .await
        .unwrap();
    assert_eq!(ctx.network.requests_to(addr, Rpc::GetStatus), 2);
}

#[tokio::test]
async fn test_identities_credit_delegates() {
    let keys = delegate_keys(5);
    let chain = ChainBuilder::signed(&keys).build(12);
    let ctx = TestContext::new(&chain, &keys);
    let addr = peer_addr(1);
    let slot = ctx.current_slot();
    let peer = ctx.add_known_peer(
        addr,
        SimPeer::new(chain.clone()).identities(&keys[..2], slot),
    );

    ctx.communicator
        .ping(&peer, PING_TIMEOUT, ctx.chain.milestones.as_ref(), true, false)
        .await
        .unwrap();

    let p = peer.read();
    assert!(p.is_active_block_producer());
    assert_eq!(p.public_keys.len(), 2);
    drop(p);
    assert_eq!(ctx.repository.delegate_host(&public_key_hex(&keys[0])), Some(addr));
}

#[tokio::test]
async fn test_identities_outside_slot_are_ignored() {
    let keys = delegate_keys(5);
    let chain = ChainBuilder::signed(&keys).build(12);
    let ctx = TestContext::new(&chain, &keys);
    let slot = ctx.current_slot();
    let peer = ctx.add_known_peer(
        peer_addr(1),
        SimPeer::new(chain.clone()).identities(&keys[..1], slot.saturating_sub(10)),
    );

    ctx.communicator
        .ping(&peer, PING_TIMEOUT, ctx.chain.milestones.as_ref(), true, false)
        .await
        .unwrap();

    assert!(!peer.read().is_active_block_producer());
}

#[tokio::test]
async fn test_identities_with_overflowing_slot_are_ignored() {
    let keys = delegate_keys(5);
    let chain = ChainBuilder::signed(&keys).build(12);
    let ctx = TestContext::new(&chain, &keys);
    let peer = ctx.add_known_peer(
        peer_addr(1),
        SimPeer::new(chain.clone()).identities(&keys[..1], u32::MAX),
    );

    let state = ctx
        .communicator
        .ping(&peer, PING_TIMEOUT, ctx.chain.milestones.as_ref(), true, false)
        .await
        .unwrap();

    assert_eq!(state.map(|s| s.height), Some(12));
    assert!(!peer.read().is_active_block_producer());
    assert_eq!(ctx.repository.delegate_host(&public_key_hex(&keys[0])), None);
}

// ============================================================================
// Delegate Attribution
// ============================================================================

async fn force_ping(ctx: &TestContext, peer: &SharedPeer) {
    ctx.communicator
        .ping(peer, PING_TIMEOUT, ctx.chain.milestones.as_ref(), true, false)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_forked_claimant_does_not_take_delegate_from_canonical_holder() {
    let keys = delegate_keys(5);
    let builder = ChainBuilder::signed(&keys);
    let ours = builder.build(30);
    let forked = builder.clone().salt(1).fork(&ours, 12, 35);
    let ctx = TestContext::new(&ours, &keys);
    let slot = ctx.current_slot();
    let delegate = public_key_hex(&keys[0]);

    let holder = ctx.add_known_peer(peer_addr(1), SimPeer::new(ours.clone()).identities(&keys[..1], slot));
    force_ping(&ctx, &holder).await;
    assert_eq!(ctx.repository.delegate_host(&delegate), Some(peer_addr(1)));

    let claimant = ctx.add_known_peer(peer_addr(2), SimPeer::new(forked).identities(&keys[..1], slot));
    force_ping(&ctx, &claimant).await;

    assert!(claimant.read().is_forked());
    assert_eq!(ctx.repository.delegate_host(&delegate), Some(peer_addr(1)));
}

#[tokio::test]
async fn test_canonical_claimant_takes_delegate_over() {
    let keys = delegate_keys(5);
    let ours = ChainBuilder::signed(&keys).build(30);
    let ctx = TestContext::new(&ours, &keys);
    let slot = ctx.current_slot();
    let delegate = public_key_hex(&keys[0]);

    let holder = ctx.add_known_peer(peer_addr(1), SimPeer::new(ours.clone()).identities(&keys[..1], slot));
    force_ping(&ctx, &holder).await;
    let claimant = ctx.add_known_peer(peer_addr(2), SimPeer::new(ours.clone()).identities(&keys[..1], slot));
    force_ping(&ctx, &claimant).await;

    assert!(!claimant.read().is_forked());
    assert_eq!(ctx.repository.delegate_host(&delegate), Some(peer_addr(2)));
}

#[tokio::test]
async fn test_any_claimant_takes_delegate_from_forked_holder() {
    let keys = delegate_keys(5);
    let builder = ChainBuilder::signed(&keys);
    let ours = builder.build(30);
    let ctx = TestContext::new(&ours, &keys);
    let slot = ctx.current_slot();
    let delegate = public_key_hex(&keys[0]);

    let holder = ctx.add_known_peer(
        peer_addr(1),
        SimPeer::new(builder.clone().salt(1).fork(&ours, 12, 35)).identities(&keys[..1], slot),
    );
    force_ping(&ctx, &holder).await;
    assert!(holder.read().is_forked());
    assert_eq!(ctx.repository.delegate_host(&delegate), Some(peer_addr(1)));

    let claimant = ctx.add_known_peer(
        peer_addr(2),
        SimPeer::new(builder.clone().salt(2).fork(&ours, 20, 36)).identities(&keys[..1], slot),
    );
    force_ping(&ctx, &claimant).await;

    assert!(claimant.read().is_forked());
    assert_eq!(ctx.repository.delegate_host(&delegate), Some(peer_addr(2)));
}

// ============================================================================
// Error Accounting
// ============================================================================

#[tokio::test]
async fn test_sequential_errors_request_disconnect() {
    let chain = ChainBuilder::unsigned().build(5);
    let ctx = TestContext::new(&chain, &[]);
    let addr = peer_addr(1);
    let peer = ctx.add_known_peer(addr, SimPeer::new(chain.clone()).behavior(Behavior::Refuse));
    let mut events = ctx.events.subscribe();

    for _ in 0..2 {
        assert!(ctx.communicator.get_peers(&peer).await.is_err());
    }
    assert_eq!(peer.read().sequential_error_counter, 2);
    assert!(events.try_recv().is_err());

    assert!(ctx.communicator.get_peers(&peer).await.is_err());
    match events.try_recv() {
        Ok(NetworkEvent::PeerDisconnect { addr: reported, .. }) => assert_eq!(reported, addr),
        other => panic!("expected disconnect request, got {:?}", other),
    }
}

#[tokio::test]
async fn test_success_resets_error_counter() {
    let chain = ChainBuilder::unsigned().build(5);
    let ctx = TestContext::new(&chain, &[]);
    let addr = peer_addr(1);
    let peer = ctx.add_known_peer(addr, SimPeer::new(chain.clone()).behavior(Behavior::Refuse));

    assert!(ctx.communicator.get_peers(&peer).await.is_err());
    assert_eq!(peer.read().sequential_error_counter, 1);

    ctx.network.update_peer(addr, |sim| sim.behavior = Behavior::Honest);
    ctx.communicator.get_peers(&peer).await.unwrap();
    assert_eq!(peer.read().sequential_error_counter, 0);
}

#[tokio::test]
async fn test_malformed_reply_is_logged_only() {
    let chain = ChainBuilder::unsigned().build(5);
    let ctx = TestContext::new(&chain, &[]);
    let peer = ctx.add_known_peer(peer_addr(1), SimPeer::new(chain.clone()).behavior(Behavior::Garbage));
    let mut events = ctx.events.subscribe();

    for _ in 0..5 {
        let result = ctx.communicator.get_peers(&peer).await;
        assert!(matches!(result, Err(NetworkError::ProtocolViolation { .. })));
    }
    assert_eq!(peer.read().sequential_error_counter, 0);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_block_download_errors_never_disconnect() {
    let chain = ChainBuilder::unsigned().build(5);
    let ctx = TestContext::new(&chain, &[]);
    let peer = ctx.add_known_peer(peer_addr(1), SimPeer::new(chain.clone()).behavior(Behavior::Refuse));
    let mut events = ctx.events.subscribe();

    for _ in 0..5 {
        let result = ctx
            .communicator
            .get_peer_blocks(&peer, GetBlocksOptions::new(1, 10))
            .await;
        assert!(result.is_err());
    }
    assert!(events.try_recv().is_err());
}

// ============================================================================
// RPC Helpers
// ============================================================================

#[tokio::test]
async fn test_get_peer_blocks() {
    let chain = ChainBuilder::unsigned().build(50);
    let ctx = TestContext::new(&chain[..1], &[]);
    let peer = ctx.add_known_peer(peer_addr(1), SimPeer::new(chain.clone()));

    let blocks = ctx
        .communicator
        .get_peer_blocks(&peer, GetBlocksOptions::new(10, 5))
        .await
        .unwrap();

    let heights: Vec<u32> = blocks.iter().map(Block::height).collect();
    assert_eq!(heights, vec![11, 12, 13, 14, 15]);
    assert_eq!(blocks[0].id(), chain[10].id);
}

#[tokio::test]
async fn test_has_common_blocks_limits_ids() {
    let chain = ChainBuilder::unsigned().build(20);
    let ctx = TestContext::new(&chain, &[]);
    let addr = peer_addr(1);
    let peer = ctx.add_known_peer(addr, SimPeer::new(chain.clone()));

    let ids: Vec<String> = chain.iter().take(11).map(|b| b.id.clone()).collect();
    let result = ctx
        .communicator
        .has_common_blocks(&peer, &ids, PING_TIMEOUT)
        .await;
    assert!(matches!(result, Err(NetworkError::InvalidMessage(_))));
    assert_eq!(ctx.network.requests_to(addr, Rpc::GetCommonBlocks), 0);

    let common = ctx
        .communicator
        .has_common_blocks(&peer, &ids[..10], PING_TIMEOUT)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(common.height, 10);
}

#[tokio::test]
async fn test_unconfirmed_transactions_skip_undecodable() {
    let chain = ChainBuilder::unsigned().build(5);
    let ctx = TestContext::new(&chain, &[]);
    let pool = vec![
        test_transaction(1).to_hex(),
        "not hex".to_string(),
        test_transaction(2).to_hex(),
    ];
    let peer = ctx.add_known_peer(peer_addr(1), SimPeer::new(chain.clone()).pool(pool));

    let transactions = ctx
        .communicator
        .get_unconfirmed_transactions(&peer)
        .await
        .unwrap();

    assert_eq!(transactions, vec![test_transaction(1), test_transaction(2)]);
}

#[tokio::test]
async fn test_rate_limit_delays_requests() {
    let chain = ChainBuilder::unsigned().build(5);
    let mut limits = permissive_rate_limits();
    limits
        .rules
        .insert(Rpc::GetPeers, RateLimit::new(1, Duration::from_millis(300)));
    let ctx = TestContext::with_config(&chain, &[], CommunicatorConfig::default(), limits);
    let peer = ctx.add_known_peer(peer_addr(1), SimPeer::new(chain.clone()));

    let started = std::time::Instant::now();
    ctx.communicator.get_peers(&peer).await.unwrap();
    assert!(!ctx.communicator.would_throttle_on_download(&peer));
    assert!(ctx.communicator.would_throttle_on_fetching_peers(&peer));
    ctx.communicator.get_peers(&peer).await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(250));
}
