//! External indexers consulted while reconciling hops
//!
//! This module provides:
//! - Log search over a chain explorer (bridge deposits, relay fills, pivots)
//! - Message status lookup for the message bridge
//!
//! Both are read-only and idempotent, so every caller may retry freely.

pub mod explorer;
pub mod message;

pub use explorer::ExplorerLogIndexer;
pub use message::HttpMessageIndexer;

use crate::error::ReconcilerResult;

use async_trait::async_trait;
use ethers::types::{Address, Log, H256};

/// A raw event log, either from a receipt or from an explorer search
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexedLog {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Vec<u8>,
    pub transaction_hash: H256,
    pub block_number: u64,
    /// Block timestamp in seconds, zero when the source does not report it
    pub timestamp: u64,
}

impl From<&Log> for IndexedLog {
    fn from(log: &Log) -> Self {
        Self {
            address: log.address,
            topics: log.topics.clone(),
            data: log.data.to_vec(),
            transaction_hash: log.transaction_hash.unwrap_or_default(),
            block_number: log.block_number.map(|b| b.as_u64()).unwrap_or(0),
            timestamp: 0,
        }
    }
}

/// Filter for an explorer log search. Set topics are AND-combined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub chain_id: u64,
    pub address: Address,
    pub topics: [Option<H256>; 4],
    pub from_block: u64,
}

impl LogQuery {
    pub fn new(chain_id: u64, address: Address, topic0: H256, from_block: u64) -> Self {
        Self {
            chain_id,
            address,
            topics: [Some(topic0), None, None, None],
            from_block,
        }
    }

    /// Additionally require `topic` at position `index`; out-of-range indexes are ignored
    pub fn with_topic(mut self, index: usize, topic: H256) -> Self {
        if let Some(slot) = self.topics.get_mut(index) {
            *slot = Some(topic);
        }
        self
    }
}

/// Bridge log indexer, one logical endpoint per chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LogIndexer: Send + Sync {
    /// All logs matching `query`, in the order the indexer returns them
    async fn get_logs(&self, query: &LogQuery) -> ReconcilerResult<Vec<IndexedLog>>;
}

/// Delivery state reported by the message-status indexer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    InFlight,
    Delivered,
    Failed,
}

/// Structured status record for one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageStatus {
    pub state: MessageState,
    pub destination_chain_id: Option<u64>,
    pub destination_tx_hash: Option<H256>,
}

impl MessageStatus {
    /// Delivered and carrying the destination transaction needed for chaining
    pub fn is_delivered(&self) -> bool {
        self.state == MessageState::Delivered && self.destination_tx_hash.is_some()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageStatusIndexer: Send + Sync {
    /// Status of a message, `None` while the indexer has not seen it yet
    async fn message_status(&self, message_id: H256) -> ReconcilerResult<Option<MessageStatus>>;
}

/// Parse `0x`-prefixed hex or plain decimal quantities as explorers return them
pub(crate) fn parse_quantity(value: &str) -> Option<u64> {
    let value = value.trim();
    match value.strip_prefix("0x") {
        Some("") => Some(0),
        Some(hex_digits) => u64::from_str_radix(hex_digits, 16).ok(),
        None => value.parse().ok(),
    }
}
