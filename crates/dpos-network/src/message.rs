//! P2P request and reply messages.
//!
//! Every remote procedure is named by a flat string key. Requests carry the
//! caller's `{port, version}` headers next to the payload. Replies decode
//! strictly: unknown or missing fields and out-of-bounds values are
//! protocol violations.

use crate::error::{NetworkError, NetworkResult};
use dpos_chain::{blake2b_256, BlockHeader, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Maximum peers in a `getPeers` reply.
pub const MAX_PEERS_IN_REPLY: usize = 2000;

/// Maximum blocks in a `getBlocks` reply.
pub const MAX_BLOCKS_IN_REPLY: usize = 400;

/// Maximum transactions in a `getUnconfirmedTransactions` reply.
pub const MAX_TRANSACTIONS_IN_REPLY: usize = 10_000;

/// Maximum ids in a `getCommonBlocks` request.
pub const MAX_COMMON_BLOCK_IDS: usize = 10;

/// Default maximum reply size.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Maximum reply size for block downloads.
pub const BLOCKS_MAX_PAYLOAD: usize = 20 * 1024 * 1024;

/// Remote procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Rpc {
    GetStatus,
    GetPeers,
    GetCommonBlocks,
    GetBlocks,
    PostBlock,
    GetUnconfirmedTransactions,
    PostTransactions,
}

impl Rpc {
    pub const ALL: [Rpc; 7] = [
        Rpc::GetStatus,
        Rpc::GetPeers,
        Rpc::GetCommonBlocks,
        Rpc::GetBlocks,
        Rpc::PostBlock,
        Rpc::GetUnconfirmedTransactions,
        Rpc::PostTransactions,
    ];

    /// Wire name.
    pub fn name(&self) -> &'static str {
        match self {
            Rpc::GetStatus => "p2p.peer.getStatus",
            Rpc::GetPeers => "p2p.peer.getPeers",
            Rpc::GetCommonBlocks => "p2p.peer.getCommonBlocks",
            Rpc::GetBlocks => "p2p.blocks.getBlocks",
            Rpc::PostBlock => "p2p.blocks.postBlock",
            Rpc::GetUnconfirmedTransactions => "p2p.transactions.getUnconfirmedTransactions",
            Rpc::PostTransactions => "p2p.transactions.postTransactions",
        }
    }

    /// Parse a wire name.
    pub fn from_name(name: &str) -> Option<Rpc> {
        Rpc::ALL.into_iter().find(|rpc| rpc.name() == name)
    }
}

impl std::fmt::Display for Rpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Headers injected into every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestHeaders {
    pub port: u16,
    pub version: String,
}

/// Request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request<T> {
    pub data: T,
    pub headers: RequestHeaders,
}

/// Payload of requests without parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmptyRequest {}

/// `getCommonBlocks` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommonBlocksRequest {
    pub ids: Vec<String>,
}

/// `getBlocks` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct GetBlocksRequest {
    /// Blocks are returned from `last_block_height + 1`.
    pub last_block_height: u32,
    pub block_limit: u32,
    pub headers_only: bool,
}

/// `postBlock` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostBlockRequest {
    pub block: BlockHeader,
}

/// `postTransactions` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostTransactionsRequest {
    pub transactions: Vec<String>,
}

/// A reply type with bounds beyond what its shape expresses.
pub trait ReplySchema: DeserializeOwned + Send {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Strictly decode and validate a reply.
pub fn decode_reply<R: ReplySchema>(rpc: Rpc, payload: &[u8], max_payload: usize) -> NetworkResult<R> {
    if payload.len() > max_payload {
        return Err(NetworkError::ProtocolViolation {
            rpc,
            reason: format!("reply of {} bytes exceeds {}", payload.len(), max_payload),
        });
    }
    let reply: R = serde_json::from_slice(payload).map_err(|e| NetworkError::ProtocolViolation {
        rpc,
        reason: e.to_string(),
    })?;
    reply
        .validate()
        .map_err(|reason| NetworkError::ProtocolViolation { rpc, reason })?;
    Ok(reply)
}

/// Chain state a peer claims in its status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PeerChainState {
    pub height: u32,
    /// Whether the peer's delegate may forge in the current slot.
    pub allowed: bool,
    pub current_slot: u32,
    pub header: BlockHeader,
}

/// Network identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkInfo {
    pub name: String,
    pub nethash: String,
}

/// A sibling service running next to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginInfo {
    pub port: u16,
    pub enabled: bool,
}

/// Peer node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    pub version: String,
    pub network: NetworkInfo,
    pub plugins: BTreeMap<String, PluginInfo>,
}

/// `getStatus` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct StatusReply {
    pub state: PeerChainState,
    pub config: PeerConfig,
    /// Delegates the peer forges for.
    pub public_keys: Vec<String>,
    /// One signature per key over [`StatusReply::signed_digest`].
    pub signatures: Vec<String>,
}

#[derive(Serialize)]
struct SignedStatus<'a> {
    state: &'a PeerChainState,
    config: &'a PeerConfig,
}

impl StatusReply {
    /// Digest of the canonical `{state, config}` serialization.
    pub fn signed_digest(&self) -> NetworkResult<[u8; 32]> {
        let bytes = serde_json::to_vec(&SignedStatus {
            state: &self.state,
            config: &self.config,
        })?;
        Ok(blake2b_256(&bytes))
    }
}

impl ReplySchema for StatusReply {
    fn validate(&self) -> Result<(), String> {
        self.state.header.validate().map_err(|e| e.to_string())?;
        if self.state.header.transactions.is_some() {
            return Err("status header carries transactions".into());
        }
        if self.public_keys.len() != self.signatures.len() {
            return Err(format!(
                "{} public keys but {} signatures",
                self.public_keys.len(),
                self.signatures.len()
            ));
        }
        if let Some(key) = self.public_keys.iter().find(|k| !is_hex_of_len(k, PUBLIC_KEY_LENGTH)) {
            return Err(format!("bad public key {}", key));
        }
        if self.signatures.iter().any(|s| !is_hex_of_len(s, SIGNATURE_LENGTH)) {
            return Err("bad signature".into());
        }
        if self.config.network.nethash.is_empty() {
            return Err("empty nethash".into());
        }
        Ok(())
    }
}

/// A peer address in a `getPeers` reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerAddress {
    pub ip: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn to_socket_addr(&self) -> Option<std::net::SocketAddr> {
        self.ip
            .parse::<IpAddr>()
            .ok()
            .map(|ip| std::net::SocketAddr::new(ip, self.port))
    }
}

/// `getPeers` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeersReply(pub Vec<PeerAddress>);

impl ReplySchema for PeersReply {
    fn validate(&self) -> Result<(), String> {
        if self.0.len() > MAX_PEERS_IN_REPLY {
            return Err(format!("{} peers exceeds {}", self.0.len(), MAX_PEERS_IN_REPLY));
        }
        if let Some(bad) = self.0.iter().find(|p| p.to_socket_addr().is_none()) {
            return Err(format!("bad ip {}", bad.ip));
        }
        Ok(())
    }
}

/// Highest common block reported by a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommonBlock {
    pub height: u32,
    pub id: String,
}

/// `getCommonBlocks` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommonBlocksReply {
    pub common: Option<CommonBlock>,
}

impl ReplySchema for CommonBlocksReply {}

/// `getBlocks` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlocksReply(pub Vec<BlockHeader>);

impl ReplySchema for BlocksReply {
    fn validate(&self) -> Result<(), String> {
        if self.0.len() > MAX_BLOCKS_IN_REPLY {
            return Err(format!("{} blocks exceeds {}", self.0.len(), MAX_BLOCKS_IN_REPLY));
        }
        for block in &self.0 {
            block.validate().map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

/// `postBlock` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostBlockReply {
    pub status: bool,
    pub height: u32,
}

impl ReplySchema for PostBlockReply {}

/// `getUnconfirmedTransactions` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct UnconfirmedTransactionsReply {
    pub pool_size: u32,
    pub transactions: Vec<String>,
}

impl ReplySchema for UnconfirmedTransactionsReply {
    fn validate(&self) -> Result<(), String> {
        if self.transactions.len() > MAX_TRANSACTIONS_IN_REPLY {
            return Err(format!(
                "{} transactions exceeds {}",
                self.transactions.len(),
                MAX_TRANSACTIONS_IN_REPLY
            ));
        }
        Ok(())
    }
}

/// Acknowledgement of a post.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AckReply {}

impl ReplySchema for AckReply {}

fn is_hex_of_len(value: &str, bytes: usize) -> bool {
    value.len() == bytes * 2 && value.bytes().all(|b| b.is_ascii_hexdigit())
}
