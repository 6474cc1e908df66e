//! # dpos-tests
//!
//! Integration tests for the DPoS relay node.
//!
//! This crate provides:
//! - Deterministic chain and key generators
//! - An in-process simulated peer network
//! - Tests for peer verification, the communicator and peer acceptance
//! - Tests for the network monitor: cleansing, download, relay and forks
//! - Property-based tests for the common block search

pub mod generators;
pub mod harness;


#[cfg(test)]
mod communicator_tests;


#[cfg(test)]
mod monitor_tests;


pub use generators::*;
pub use harness::*;
