//! # dpos-network
//!
//! Peer networking for the DPoS relay node.
//!
//! This crate provides:
//! - The per-peer record and the peer repository
//! - Typed, strictly validated P2P messages
//! - A rate-limited RPC communicator with error classification
//! - Chain verification of peers' claimed state (8-ary common block search)
//! - The peer acceptance pipeline and connectivity checks
//! - A framed TCP transport

mod codec;
mod communicator;
pub mod discovery;
mod error;
mod events;
pub mod message;
mod penalties;
mod peer;
mod processor;
mod rate_limit;
mod recent;
mod repository;
mod transport;
mod verifier;

pub use codec::{Frame, FrameCodec, FrameKind, MAX_FRAME_SIZE};
pub use communicator::{CommunicatorConfig, GetBlocksOptions, PeerCommunicator};
pub use error::{NetworkError, NetworkResult, TransportErrorKind};
pub use events::{EventBus, NetworkEvent, EVENT_CHANNEL_CAPACITY};
pub use message::{PeerAddress, PeerChainState, Rpc, StatusReply};
pub use penalties::{ErrorPolicy, DEFAULT_MAX_SEQUENTIAL_ERRORS};
pub use peer::{
    FastVerificationResult, Peer, SharedPeer, VerificationResult, INFRACTION_TTL,
    MAX_INFRACTIONS, RECENTLY_PINGED,
};
pub use processor::{is_routable, AcceptOptions, PeerProcessor, ProcessorConfig};
pub use rate_limit::{RateLimit, RateLimitConfig, RateLimiter};
pub use recent::RecentTable;
pub use repository::{same_subnet, PeerRepository};
pub use transport::{TcpTransport, TcpTransportConfig, Transport};
pub use verifier::{probe_heights, ChainContext, PeerVerifier, SEARCH_ARITY};

/// Default P2P port.
pub const DEFAULT_PORT: u16 = 4002;
