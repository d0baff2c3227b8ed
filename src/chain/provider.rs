//! Chain provider with multi-RPC support and automatic failover

use crate::config::ChainConfig;
use crate::error::{ReconcilerError, ReconcilerResult};
use crate::indexer::IndexedLog;

use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use sha3::{Digest, Keccak256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    chain_id: u64,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(config: &ChainConfig) -> ReconcilerResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(ReconcilerError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            chain_id: config.chain_id,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.chain_id, next);
    }

    /// Receipt logs of a transaction, `None` while it is not mined
    pub async fn transaction_logs(&self, tx_hash: H256) -> ReconcilerResult<Option<Vec<IndexedLog>>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_transaction_receipt(tx_hash).await {
                Ok(receipt) => {
                    return Ok(receipt.map(|r| r.logs.iter().map(IndexedLog::from).collect()))
                }
                Err(e) => {
                    warn!(
                        "Failed to get receipt {:?} from chain {}: {}",
                        tx_hash, self.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(ReconcilerError::ChainConnection {
            chain_id: self.chain_id,
            message: "All providers failed to get receipt".to_string(),
        })
    }

    /// Call a no-argument view returning a single word
    pub async fn call_word(&self, contract: Address, signature: &str) -> ReconcilerResult<U256> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(contract)
            .data(Bytes::from(selector(signature).to_vec()))
            .into();

        for _ in 0..self.http_providers.len() {
            match self.http().call(&tx, None).await {
                Ok(output) if output.len() >= 32 => {
                    return Ok(U256::from_big_endian(&output[..32]));
                }
                Ok(output) => {
                    return Err(ReconcilerError::EventDecoding(format!(
                        "{} on chain {} returned {} bytes",
                        signature,
                        self.chain_id,
                        output.len()
                    )))
                }
                Err(e) => {
                    warn!(
                        "Failed to call {} on chain {}: {}",
                        signature, self.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(ReconcilerError::ChainConnection {
            chain_id: self.chain_id,
            message: format!("All providers failed to call {}", signature),
        })
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.http().get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Health check failed for chain {}: {}", self.chain_id, e);
                self.failover();
                false
            }
        }
    }

    /// Get chain ID
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }
}

/// 4-byte function selector of a canonical signature
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = Keccak256::digest(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}
