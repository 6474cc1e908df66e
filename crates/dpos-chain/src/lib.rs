//! # dpos-chain
//!
//! Chain data and collaborator contracts for the DPoS relay node.
//!
//! This crate provides:
//! - Block header, block and transaction wire types
//! - Round, milestone and slot calculations
//! - `ChainStore`, `DelegateProvider` and `BlockCrypto` contracts
//! - In-memory implementations used by the node and tests

pub mod block;
pub mod crypto;
mod error;
pub mod round;
mod store;

pub use block::{Block, BlockHeader, Transaction, MAX_TRANSACTION_BYTES};
pub use crypto::{blake2b_256, BlockCrypto, Secp256k1Crypto, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
pub use error::{ChainError, ChainResult};
pub use round::{BlockTimeLookup, Milestone, Milestones, RoundInfo, Slots};
pub use store::{ChainStore, DelegateProvider, MemoryChainStore, StaticDelegates};
