//! Hop identifier discovery from receipts and from historical log search

use super::{references_account, EventCatalog, HopIdentifier};
use crate::coordination::topology::Medium;
use crate::error::ReconcilerResult;
use crate::indexer::{IndexedLog, LogIndexer, LogQuery};

use ethers::types::{Address, H256};
use std::sync::Arc;
use tracing::{debug, warn};

/// Parameters of a historical send-event search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub chain_id: u64,
    /// Contract emitting the send event
    pub contract: Address,
    /// Account whose address must appear in the event payload
    pub account: Address,
    pub medium: Medium,
    pub since_block: u64,
}

/// Decodes hop identifiers, isolating the raw account matching rule from the
/// rest of the engine
pub struct IdentifierExtractor {
    catalog: Arc<EventCatalog>,
    logs: Arc<dyn LogIndexer>,
}

impl IdentifierExtractor {
    pub fn new(catalog: Arc<EventCatalog>, logs: Arc<dyn LogIndexer>) -> Self {
        Self { catalog, logs }
    }

    /// Identifier of the first `medium` send event in a receipt, if any
    pub fn from_receipt(&self, receipt_logs: &[IndexedLog], medium: Medium) -> Option<HopIdentifier> {
        let spec = self.catalog.send_event(medium);
        receipt_logs
            .iter()
            .filter(|log| spec.matches(log))
            .find_map(|log| spec.identifier.word(log))
            .map(|word| HopIdentifier::from_word(medium, word))
    }

    /// Identifier of the most recent send event referencing `query.account`
    pub async fn from_history(&self, query: &HistoryQuery) -> ReconcilerResult<Option<HopIdentifier>> {
        let spec = self.catalog.send_event(query.medium);
        let logs = self
            .logs
            .get_logs(&LogQuery::new(
                query.chain_id,
                query.contract,
                spec.topic,
                query.since_block,
            ))
            .await?;

        let latest = logs
            .iter()
            .filter(|log| spec.matches(log) && references_account(log, query.account))
            .max_by_key(|log| (log.timestamp, log.block_number));

        let identifier = latest
            .and_then(|log| spec.identifier.word(log))
            .map(|word| HopIdentifier::from_word(query.medium, word));

        debug!(
            "History search on chain {} for {:?}: {} candidates, found {:?}",
            query.chain_id,
            query.account,
            logs.len(),
            identifier
        );
        Ok(identifier)
    }

    /// The pivot-initiation log carrying `nonce`.
    ///
    /// Exactly one such log exists per nonce; if the indexer returns several
    /// (reorg leftovers), the most recent wins.
    pub async fn pivot_log(
        &self,
        chain_id: u64,
        emitter: Address,
        nonce: H256,
        since_block: u64,
    ) -> ReconcilerResult<Option<IndexedLog>> {
        let spec = &self.catalog.pivot_initiated;
        let mut query = LogQuery::new(chain_id, emitter, spec.topic, since_block);
        if let Some(index) = spec.identifier.topic_index() {
            query = query.with_topic(index, nonce);
        }

        let logs = self.logs.get_logs(&query).await?;
        let matching: Vec<&IndexedLog> = logs
            .iter()
            .filter(|log| spec.matches(log) && spec.identifier.word(log) == Some(nonce))
            .collect();

        if matching.len() > 1 {
            warn!(
                "Chain {}: {} pivot logs for nonce {:?}, using the latest",
                chain_id,
                matching.len(),
                nonce
            );
        }

        Ok(matching
            .into_iter()
            .max_by_key(|log| (log.timestamp, log.block_number))
            .cloned())
    }
}
