//! Pivot reconciler - tracks cross-chain pool operations hop by hop
//!
//! A deposit, withdrawal or pivot of a pool may cross up to two bridges
//! before it takes effect. The reconciler resolves which bridges are
//! involved, discovers each bridge's identifier for the operation and polls
//! public indexers until every hop is confirmed.

pub mod api;
pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod indexer;
pub mod metrics;

#[cfg(test)]
pub(crate) mod test_utils;
