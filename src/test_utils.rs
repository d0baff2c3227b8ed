//! Shared test fixtures: bridge log builders and in-memory chain and indexer fakes

use crate::chain::{ChainRpc, PoolState};
use crate::config::{ChainContracts, ChainDirectory, PollingConfig};
use crate::coordination::topology::{Operation, OperationKind};
use crate::coordination::ReconcilerContext;
use crate::error::{ReconcilerError, ReconcilerResult};
use crate::events::EventCatalog;
use crate::indexer::{IndexedLog, LogIndexer, LogQuery, MessageStatus, MessageStatusIndexer};

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const OPTIMISM: u64 = 10;
pub const BASE: u64 = 8453;
pub const ARBITRUM: u64 = 42161;

pub fn pool() -> Address {
    Address::repeat_byte(0x90)
}

pub fn user() -> Address {
    Address::repeat_byte(0xab)
}

pub fn operation(kind: OperationKind, origin: u64, destination: u64, settlement: u64) -> Operation {
    Operation {
        kind,
        origin_chain_id: origin,
        destination_chain_id: destination,
        settlement_chain_id: settlement,
        pool_address: pool(),
        user_address: match kind {
            OperationKind::Pivot => None,
            _ => Some(user()),
        },
    }
}

/// Two data words: the account left-padded, then an amount
pub fn account_payload(account: Address) -> Vec<u8> {
    let mut data = vec![0u8; 64];
    data[12..32].copy_from_slice(account.as_bytes());
    U256::from(1_000_000u64).to_big_endian(&mut data[32..64]);
    data
}

/// Asset-bridge deposit with `id` in topic 2 and `account` in the payload
pub fn deposit_log(id: u64, account: Address, timestamp: u64) -> IndexedLog {
    let catalog = EventCatalog::default();
    IndexedLog {
        topics: vec![
            catalog.asset_deposit.topic,
            H256::from_low_u64_be(BASE),
            H256::from_low_u64_be(id),
            H256::zero(),
        ],
        data: account_payload(account),
        transaction_hash: H256::from_low_u64_be(0xd000 + id),
        block_number: timestamp,
        timestamp,
        ..Default::default()
    }
}

/// Relay fill of deposit `id` originating on `origin_chain`
pub fn fill_log(id: u64, origin_chain: u64, tx_hash: H256) -> IndexedLog {
    let catalog = EventCatalog::default();
    IndexedLog {
        topics: vec![
            catalog.relay_filled.topic,
            H256::from_low_u64_be(origin_chain),
            H256::from_low_u64_be(id),
            H256::repeat_byte(0x11),
        ],
        data: vec![0u8; 64],
        transaction_hash: tx_hash,
        ..Default::default()
    }
}

/// Message-bridge send with `id` in topic 1 and `account` in the payload
pub fn message_log(id: H256, account: Address, timestamp: u64) -> IndexedLog {
    let catalog = EventCatalog::default();
    IndexedLog {
        topics: vec![catalog.message_sent.topic, id],
        data: account_payload(account),
        block_number: timestamp,
        timestamp,
        ..Default::default()
    }
}

pub fn pivot_log(nonce: u64, tx_hash: H256) -> IndexedLog {
    let catalog = EventCatalog::default();
    IndexedLog {
        topics: vec![catalog.pivot_initiated.topic, H256::from_low_u64_be(nonce)],
        data: vec![0u8; 96],
        transaction_hash: tx_hash,
        ..Default::default()
    }
}

/// In-memory receipts and pool state
#[derive(Default)]
pub struct FakeChain {
    receipts: Mutex<HashMap<(u64, H256), Vec<IndexedLog>>>,
    pool_state: Mutex<Option<PoolState>>,
}

impl FakeChain {
    pub fn set_receipt(&self, chain_id: u64, tx_hash: H256, logs: Vec<IndexedLog>) {
        self.receipts.lock().unwrap().insert((chain_id, tx_hash), logs);
    }

    pub fn set_pool_state(&self, state: PoolState) {
        *self.pool_state.lock().unwrap() = Some(state);
    }
}

#[async_trait]
impl ChainRpc for FakeChain {
    async fn transaction_logs(
        &self,
        chain_id: u64,
        tx_hash: H256,
    ) -> ReconcilerResult<Option<Vec<IndexedLog>>> {
        Ok(self.receipts.lock().unwrap().get(&(chain_id, tx_hash)).cloned())
    }

    async fn pool_state(&self, chain_id: u64, _pool: Address) -> ReconcilerResult<PoolState> {
        self.pool_state
            .lock()
            .unwrap()
            .ok_or(ReconcilerError::ChainConnection {
                chain_id,
                message: "pool state not scripted".to_string(),
            })
    }
}

/// In-memory explorer. Filters by chain, emitting contract and topics.
#[derive(Default)]
pub struct FakeLogIndexer {
    logs: Mutex<Vec<(u64, IndexedLog)>>,
    queries: Mutex<Vec<LogQuery>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl FakeLogIndexer {
    /// Index `log` on `chain_id`. Logs without an address are attributed to
    /// the contract that emits them in [`test_directory`].
    pub fn push(&self, chain_id: u64, mut log: IndexedLog) {
        if log.address.is_zero() {
            log.address = default_emitter(chain_id, &log);
        }
        self.logs.lock().unwrap().push((chain_id, log));
    }

    /// Answer every query with a server error while set
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<LogQuery> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl LogIndexer for FakeLogIndexer {
    async fn get_logs(&self, query: &LogQuery) -> ReconcilerResult<Vec<IndexedLog>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query.clone());

        if self.failing.load(Ordering::SeqCst) {
            return Err(ReconcilerError::Indexer {
                indexer: format!("explorer:{}", query.chain_id),
                message: "HTTP 500 Internal Server Error".to_string(),
            });
        }

        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|(chain_id, log)| {
                *chain_id == query.chain_id
                    && log.address == query.address
                    && query
                        .topics
                        .iter()
                        .enumerate()
                        .all(|(i, topic)| topic.map_or(true, |t| log.topics.get(i) == Some(&t)))
            })
            .map(|(_, log)| log.clone())
            .collect())
    }
}

/// Asset-bridge events come from the chain's spoke pool, everything else from the pool
fn default_emitter(chain_id: u64, log: &IndexedLog) -> Address {
    let catalog = EventCatalog::default();
    let asset_topics = [catalog.asset_deposit.topic, catalog.relay_filled.topic];
    match (test_directory().get(chain_id), log.topics.first()) {
        (Ok(chain), Some(topic)) if asset_topics.contains(topic) => chain.asset_bridge,
        _ => pool(),
    }
}

#[derive(Default)]
pub struct FakeMessageIndexer {
    statuses: Mutex<HashMap<H256, MessageStatus>>,
    calls: AtomicUsize,
}

impl FakeMessageIndexer {
    pub fn set(&self, message_id: H256, status: MessageStatus) {
        self.statuses.lock().unwrap().insert(message_id, status);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageStatusIndexer for FakeMessageIndexer {
    async fn message_status(&self, message_id: H256) -> ReconcilerResult<Option<MessageStatus>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.statuses.lock().unwrap().get(&message_id).cloned())
    }
}

pub fn test_directory() -> ChainDirectory {
    let contracts = |chain_id: u64, name: &str, byte: u8| ChainContracts {
        chain_id,
        name: name.to_string(),
        asset_bridge: Address::repeat_byte(byte),
        message_sender: None,
        pivot_emitter: None,
        search_from_block: 100,
    };
    ChainDirectory::new([
        contracts(OPTIMISM, "optimism", 0x10),
        contracts(BASE, "base", 0x20),
        contracts(ARBITRUM, "arbitrum", 0x30),
    ])
}

/// Context wired to fakes, with default poll timings
pub struct TestHarness {
    pub ctx: Arc<ReconcilerContext>,
    pub chain: Arc<FakeChain>,
    pub logs: Arc<FakeLogIndexer>,
    pub messages: Arc<FakeMessageIndexer>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_polling(PollingConfig::default())
    }

    pub fn with_polling(polling: PollingConfig) -> Self {
        let chain = Arc::new(FakeChain::default());
        let logs = Arc::new(FakeLogIndexer::default());
        let messages = Arc::new(FakeMessageIndexer::default());
        let ctx = Arc::new(ReconcilerContext::new(
            Arc::new(test_directory()),
            Arc::new(EventCatalog::default()),
            chain.clone(),
            logs.clone(),
            messages.clone(),
            polling,
        ));
        Self {
            ctx,
            chain,
            logs,
            messages,
        }
    }
}
