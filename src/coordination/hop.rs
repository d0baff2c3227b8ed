//! Per-hop state and the status poller driving it to fulfillment

use super::topology::{HopSpec, Medium};
use super::ReconcilerContext;
use crate::error::ReconcilerResult;
use crate::events::HopIdentifier;
use crate::indexer::LogQuery;

use chrono::{DateTime, Utc};
use ethers::types::H256;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Hop progress. Ordered so that status can only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HopStatus {
    Unknown,
    Pending,
    Fulfilled,
}

/// One bridge leg of an operation
#[derive(Debug, Clone, PartialEq)]
pub struct Hop {
    spec: HopSpec,
    identifier: Option<HopIdentifier>,
    status: HopStatus,
    pending_since: Option<DateTime<Utc>>,
    fulfilled_at: Option<DateTime<Utc>>,
}

impl Hop {
    pub fn new(spec: HopSpec) -> Self {
        Self {
            spec,
            identifier: None,
            status: HopStatus::Unknown,
            pending_since: None,
            fulfilled_at: None,
        }
    }

    pub fn spec(&self) -> &HopSpec {
        &self.spec
    }

    pub fn identifier(&self) -> Option<HopIdentifier> {
        self.identifier
    }

    pub fn status(&self) -> HopStatus {
        self.status
    }

    /// Record the discovered identifier and move to pending.
    ///
    /// Returns false if an identifier was already set; it is never replaced.
    pub fn assign_identifier(&mut self, identifier: HopIdentifier) -> bool {
        if let Some(existing) = self.identifier {
            if existing != identifier {
                warn!(
                    "Hop {} keeps identifier {} and ignores {}",
                    self.spec.index, existing, identifier
                );
            }
            return false;
        }
        self.identifier = Some(identifier);
        self.advance(HopStatus::Pending);
        true
    }

    /// Move forward to `next`; backward moves are ignored
    pub fn advance(&mut self, next: HopStatus) -> bool {
        if next <= self.status {
            return false;
        }
        let now = Utc::now();
        if next == HopStatus::Pending {
            self.pending_since = Some(now);
        }
        if next == HopStatus::Fulfilled {
            self.fulfilled_at = Some(now);
        }
        self.status = next;
        true
    }

    pub fn snapshot(&self) -> HopSnapshot {
        HopSnapshot {
            index: self.spec.index,
            medium: self.spec.medium,
            label: self.spec.medium.label().to_string(),
            description: self.spec.description(),
            source_chain_id: self.spec.source_chain_id,
            destination_chain_id: self.spec.destination_chain_id,
            identifier: self.identifier.map(|id| id.to_string()),
            status: self.status,
            pending_since: self.pending_since,
            fulfilled_at: self.fulfilled_at,
        }
    }
}

/// Render-ready view of one hop
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HopSnapshot {
    pub index: usize,
    pub medium: Medium,
    pub label: String,
    pub description: String,
    pub source_chain_id: u64,
    pub destination_chain_id: u64,
    pub identifier: Option<String>,
    pub status: HopStatus,
    pub pending_since: Option<DateTime<Utc>>,
    pub fulfilled_at: Option<DateTime<Utc>>,
}

/// Result of a single indexer round-trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    NotYet,
    /// Hop confirmed; `next` seeds the following hop when its send event was found
    Fulfilled { next: Option<HopIdentifier> },
}

/// Polls the indexer matching a hop's medium until the hop is fulfilled
pub struct HopPoller<'a> {
    ctx: &'a ReconcilerContext,
    spec: HopSpec,
    identifier: HopIdentifier,
    /// Medium of the following hop, if any
    next_medium: Option<Medium>,
}

impl<'a> HopPoller<'a> {
    pub fn new(
        ctx: &'a ReconcilerContext,
        spec: HopSpec,
        identifier: HopIdentifier,
        next_medium: Option<Medium>,
    ) -> Self {
        Self {
            ctx,
            spec,
            identifier,
            next_medium,
        }
    }

    /// Poll until fulfilled. Failures count as "not yet"; there is no retry limit.
    ///
    /// Each poll completes before the next timer starts, so polls of one hop
    /// never overlap.
    pub async fn run(&self) -> Option<HopIdentifier> {
        let medium = self.spec.medium;
        tokio::time::sleep(self.ctx.polling.initial_delay(medium)).await;

        loop {
            crate::metrics::record_poll(medium);
            match self.poll_once().await {
                Ok(PollOutcome::Fulfilled { next }) => {
                    info!(
                        "Hop {} ({}) fulfilled for {}",
                        self.spec.index,
                        medium.as_str(),
                        self.identifier
                    );
                    return next;
                }
                Ok(PollOutcome::NotYet) => {
                    debug!("Hop {} ({}) not yet fulfilled", self.spec.index, self.identifier);
                }
                Err(e) => {
                    warn!(
                        "Poll for hop {} ({}) failed, retrying on schedule: {}",
                        self.spec.index, self.identifier, e
                    );
                    crate::metrics::record_poll_failure(medium);
                }
            }

            tokio::time::sleep(self.ctx.polling.poll_interval(medium)).await;
        }
    }

    /// One indexer round-trip for this hop
    pub async fn poll_once(&self) -> ReconcilerResult<PollOutcome> {
        match self.spec.medium {
            Medium::AssetBridge => self.poll_fill().await,
            Medium::MessageBridge => self.poll_message().await,
        }
    }

    async fn poll_fill(&self) -> ReconcilerResult<PollOutcome> {
        let destination = self.ctx.directory.get(self.spec.destination_chain_id)?;
        let catalog = &self.ctx.catalog;
        let event = &catalog.relay_filled;
        let deposit_word = self.identifier.as_word();

        let mut query = LogQuery::new(
            destination.chain_id,
            destination.asset_bridge,
            event.topic,
            destination.search_from_block,
        );
        if let Some(index) = event.identifier.topic_index() {
            query = query.with_topic(index, deposit_word);
        }

        let logs = self.ctx.logs.get_logs(&query).await?;
        let origin_word = H256::from_low_u64_be(self.spec.source_chain_id);
        let fill = logs.iter().find(|log| {
            event.matches(log)
                && event.identifier.word(log) == Some(deposit_word)
                && catalog
                    .relay_origin_chain
                    .map_or(true, |field| field.word(log) == Some(origin_word))
        });

        match fill {
            Some(fill) => {
                self.chained(self.spec.destination_chain_id, fill.transaction_hash)
                    .await
            }
            None => Ok(PollOutcome::NotYet),
        }
    }

    async fn poll_message(&self) -> ReconcilerResult<PollOutcome> {
        let status = self
            .ctx
            .messages
            .message_status(self.identifier.as_word())
            .await?;

        let Some(status) = status.filter(|s| s.is_delivered()) else {
            return Ok(PollOutcome::NotYet);
        };
        let Some(tx_hash) = status.destination_tx_hash else {
            return Ok(PollOutcome::NotYet);
        };

        if let Some(reported) = status.destination_chain_id {
            if reported != self.spec.destination_chain_id {
                warn!(
                    "Message {} delivered to chain {}, expected {}",
                    self.identifier, reported, self.spec.destination_chain_id
                );
            }
        }

        self.chained(self.spec.destination_chain_id, tx_hash).await
    }

    /// Decode the next hop's identifier from the fulfilling transaction.
    ///
    /// Without a receipt the hop stays pending, so the next hop never starts
    /// before its seed could have been read.
    async fn chained(&self, chain_id: u64, tx_hash: H256) -> ReconcilerResult<PollOutcome> {
        let Some(next_medium) = self.next_medium else {
            return Ok(PollOutcome::Fulfilled { next: None });
        };

        match self.ctx.rpc.transaction_logs(chain_id, tx_hash).await? {
            Some(receipt) => Ok(PollOutcome::Fulfilled {
                next: self.ctx.extractor.from_receipt(&receipt, next_medium),
            }),
            None => {
                debug!(
                    "Fulfilling tx {:?} on chain {} has no receipt yet",
                    tx_hash, chain_id
                );
                Ok(PollOutcome::NotYet)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::topology::resolve;
    use crate::indexer::{MessageState, MessageStatus};
    use crate::test_utils::{fill_log, message_log, TestHarness};
    use ethers::types::{Address, U256};

    #[test]
    fn test_status_never_regresses() {
        let mut hop = Hop::new(resolve(10, 8453, 10)[0]);
        assert_eq!(hop.status(), HopStatus::Unknown);

        assert!(hop.assign_identifier(HopIdentifier::DepositId(U256::from(1))));
        assert_eq!(hop.status(), HopStatus::Pending);

        assert!(hop.advance(HopStatus::Fulfilled));
        assert!(!hop.advance(HopStatus::Pending));
        assert!(!hop.advance(HopStatus::Unknown));
        assert_eq!(hop.status(), HopStatus::Fulfilled);
    }

    #[test]
    fn test_identifier_is_immutable() {
        let mut hop = Hop::new(resolve(10, 8453, 10)[0]);
        hop.assign_identifier(HopIdentifier::DepositId(U256::from(1)));
        assert!(!hop.assign_identifier(HopIdentifier::DepositId(U256::from(2))));
        assert_eq!(hop.identifier(), Some(HopIdentifier::DepositId(U256::from(1))));
        assert_eq!(hop.snapshot().identifier.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_fill_requires_matching_origin() {
        let harness = TestHarness::new();
        let spec = resolve(42161, 10, 42161)[0];
        harness.logs.push(10, fill_log(9, 8453, H256::repeat_byte(1)));

        let poller = HopPoller::new(
            &harness.ctx,
            spec,
            HopIdentifier::DepositId(U256::from(9)),
            None,
        );
        assert_eq!(poller.poll_once().await.unwrap(), PollOutcome::NotYet);

        harness.logs.push(10, fill_log(9, 42161, H256::repeat_byte(2)));
        assert_eq!(
            poller.poll_once().await.unwrap(),
            PollOutcome::Fulfilled { next: None }
        );
    }

    #[tokio::test]
    async fn test_fill_chains_next_identifier() {
        let harness = TestHarness::new();
        let spec = resolve(10, 8453, 42161)[0];
        let fill_tx = H256::repeat_byte(0xf1);
        harness.logs.push(42161, fill_log(3, 10, fill_tx));

        let poller = HopPoller::new(
            &harness.ctx,
            spec,
            HopIdentifier::DepositId(U256::from(3)),
            Some(Medium::MessageBridge),
        );

        // Receipt of the fill not available yet
        assert_eq!(poller.poll_once().await.unwrap(), PollOutcome::NotYet);

        harness.chain.set_receipt(
            42161,
            fill_tx,
            vec![message_log(H256::repeat_byte(0x77), Address::zero(), 0)],
        );
        assert_eq!(
            poller.poll_once().await.unwrap(),
            PollOutcome::Fulfilled {
                next: Some(HopIdentifier::MessageId(H256::repeat_byte(0x77)))
            }
        );
    }

    #[tokio::test]
    async fn test_message_needs_terminal_delivery() {
        let harness = TestHarness::new();
        let spec = resolve(10, 10, 42161)[0];
        let message_id = H256::repeat_byte(0x55);
        let poller = HopPoller::new(&harness.ctx, spec, HopIdentifier::MessageId(message_id), None);

        assert_eq!(poller.poll_once().await.unwrap(), PollOutcome::NotYet);

        harness.messages.set(
            message_id,
            MessageStatus {
                state: MessageState::InFlight,
                destination_chain_id: None,
                destination_tx_hash: None,
            },
        );
        assert_eq!(poller.poll_once().await.unwrap(), PollOutcome::NotYet);

        harness.messages.set(
            message_id,
            MessageStatus {
                state: MessageState::Delivered,
                destination_chain_id: Some(42161),
                destination_tx_hash: Some(H256::repeat_byte(0xd0)),
            },
        );
        assert_eq!(
            poller.poll_once().await.unwrap(),
            PollOutcome::Fulfilled { next: None }
        );
    }

    #[tokio::test]
    async fn test_poll_errors_propagate_to_run_loop() {
        let harness = TestHarness::new();
        harness.logs.set_failing(true);
        let spec = resolve(42161, 10, 42161)[0];
        let poller = HopPoller::new(&harness.ctx, spec, HopIdentifier::DepositId(U256::from(1)), None);

        assert!(poller.poll_once().await.unwrap_err().is_retryable());
    }
}
