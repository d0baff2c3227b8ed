//! Chain module - read-only RPC access to every configured chain
//!
//! This module provides:
//! - Multi-RPC provider management with automatic failover
//! - Receipt log retrieval for identifier extraction
//! - Pool contract reads used by session recovery

pub mod provider;

pub use provider::ChainProvider;

use crate::config::Settings;
use crate::error::{ReconcilerError, ReconcilerResult};
use crate::indexer::IndexedLog;

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::{Address, H256, U256};
use std::sync::Arc;
use tracing::info;

/// View returning the pool's latest pivot nonce
pub const PIVOT_NONCE_METHOD: &str = "pivotNonce()";
/// View returning the chain id the pool's funds are currently invested on
pub const POSITION_CHAIN_METHOD: &str = "positionChainId()";

/// On-chain pool state relevant to pivot recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    pub pivot_nonce: U256,
    pub position_chain_id: u64,
}

/// Read-only chain access with per-chain endpoint selection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Receipt logs of `tx_hash` on `chain_id`, `None` while not mined
    async fn transaction_logs(
        &self,
        chain_id: u64,
        tx_hash: H256,
    ) -> ReconcilerResult<Option<Vec<IndexedLog>>>;

    /// Pivot nonce and position chain of `pool` on its settlement chain
    async fn pool_state(&self, chain_id: u64, pool: Address) -> ReconcilerResult<PoolState>;
}

/// Manages providers for all configured chains
pub struct ChainRegistry {
    /// Chain providers indexed by chain ID
    providers: DashMap<u64, Arc<ChainProvider>>,
}

impl ChainRegistry {
    /// Create providers for all enabled chains
    pub fn new(settings: &Settings) -> ReconcilerResult<Self> {
        let providers = DashMap::new();

        for (_, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} (ID: {})",
                chain_config.name, chain_config.chain_id
            );
            let provider = ChainProvider::new(chain_config)?;
            providers.insert(chain_config.chain_id, Arc::new(provider));
        }

        Ok(Self { providers })
    }

    /// Get provider for a specific chain
    pub fn get_provider(&self, chain_id: u64) -> ReconcilerResult<Arc<ChainProvider>> {
        self.providers
            .get(&chain_id)
            .map(|p| p.clone())
            .ok_or(ReconcilerError::UnknownChain { chain_id })
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let providers: Vec<Arc<ChainProvider>> =
            self.providers.iter().map(|e| e.value().clone()).collect();

        let mut results = Vec::new();
        for provider in providers {
            let healthy = provider.health_check().await;
            results.push((provider.chain_id(), healthy));
            crate::metrics::record_chain_health(provider.chain_id(), healthy);
        }
        results.sort_unstable_by_key(|(chain_id, _)| *chain_id);
        results
    }
}

#[async_trait]
impl ChainRpc for ChainRegistry {
    async fn transaction_logs(
        &self,
        chain_id: u64,
        tx_hash: H256,
    ) -> ReconcilerResult<Option<Vec<IndexedLog>>> {
        self.get_provider(chain_id)?.transaction_logs(tx_hash).await
    }

    async fn pool_state(&self, chain_id: u64, pool: Address) -> ReconcilerResult<PoolState> {
        let provider = self.get_provider(chain_id)?;
        let pivot_nonce = provider.call_word(pool, PIVOT_NONCE_METHOD).await?;
        let position_chain = provider.call_word(pool, POSITION_CHAIN_METHOD).await?;

        if position_chain > U256::from(u64::MAX) {
            return Err(ReconcilerError::EventDecoding(format!(
                "pool {:?} reports position chain {} out of range",
                pool, position_chain
            )));
        }

        Ok(PoolState {
            pivot_nonce,
            position_chain_id: position_chain.as_u64(),
        })
    }
}
