//! Recovery of a hop identifier when no transaction hash is known
//!
//! Used after a restart or when a session is opened for an operation that
//! was submitted elsewhere.

use super::topology::{HopSpec, Operation, OperationKind};
use super::ReconcilerContext;
use crate::error::{ReconcilerError, ReconcilerResult};
use crate::events::{HistoryQuery, HopIdentifier};

use ethers::types::{Address, H256};
use tracing::{debug, info, warn};

/// Result of one recovery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Identifier of the first hop
    Recovered(HopIdentifier),
    /// The operation already took effect; nothing to track
    Complete,
    /// The originating transaction is not visible yet; retry later
    AwaitingOrigin,
}

impl RecoveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryOutcome::Recovered(_) => "recovered",
            RecoveryOutcome::Complete => "complete",
            RecoveryOutcome::AwaitingOrigin => "awaiting_origin",
        }
    }
}

pub struct RecoveryBootstrapper<'a> {
    ctx: &'a ReconcilerContext,
}

impl<'a> RecoveryBootstrapper<'a> {
    pub fn new(ctx: &'a ReconcilerContext) -> Self {
        Self { ctx }
    }

    /// Find the first hop's identifier. Errors are treated as "not visible yet".
    pub async fn recover(&self, operation: &Operation, first_hop: &HopSpec) -> RecoveryOutcome {
        let outcome = match self.try_recover(operation, first_hop).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    "Recovery of {} for pool {:?} failed: {}",
                    operation.kind, operation.pool_address, e
                );
                RecoveryOutcome::AwaitingOrigin
            }
        };
        crate::metrics::record_recovery(outcome.as_str());
        outcome
    }

    async fn try_recover(
        &self,
        operation: &Operation,
        first_hop: &HopSpec,
    ) -> ReconcilerResult<RecoveryOutcome> {
        match operation.kind {
            OperationKind::Deposit | OperationKind::Withdraw => {
                let account = operation.user_address.ok_or_else(|| {
                    ReconcilerError::InvalidOperation(format!(
                        "{} requires a user address",
                        operation.kind
                    ))
                })?;
                let found = self.search_history(operation, first_hop, account).await?;
                Ok(found.map_or(RecoveryOutcome::AwaitingOrigin, RecoveryOutcome::Recovered))
            }
            OperationKind::Pivot => self.recover_pivot(operation, first_hop).await,
        }
    }

    /// Pool state is read on the settlement chain; the pivot log on the origin chain.
    async fn recover_pivot(
        &self,
        operation: &Operation,
        first_hop: &HopSpec,
    ) -> ReconcilerResult<RecoveryOutcome> {
        let state = self
            .ctx
            .rpc
            .pool_state(operation.settlement_chain_id, operation.pool_address)
            .await?;

        if state.position_chain_id == operation.destination_chain_id {
            info!(
                "Pool {:?} already positioned on chain {}",
                operation.pool_address, state.position_chain_id
            );
            return Ok(RecoveryOutcome::Complete);
        }

        let origin = self.ctx.directory.get(operation.origin_chain_id)?;
        let emitter = origin.pivot_emitter.unwrap_or(operation.pool_address);
        let mut nonce = [0u8; 32];
        state.pivot_nonce.to_big_endian(&mut nonce);

        let Some(log) = self
            .ctx
            .extractor
            .pivot_log(origin.chain_id, emitter, H256::from(nonce), origin.search_from_block)
            .await?
        else {
            debug!(
                "No pivot log for nonce {} on chain {} yet",
                state.pivot_nonce, origin.chain_id
            );
            return Ok(RecoveryOutcome::AwaitingOrigin);
        };

        let receipt = self
            .ctx
            .rpc
            .transaction_logs(origin.chain_id, log.transaction_hash)
            .await?;

        Ok(receipt
            .and_then(|logs| self.ctx.extractor.from_receipt(&logs, first_hop.medium))
            .map_or(RecoveryOutcome::AwaitingOrigin, RecoveryOutcome::Recovered))
    }

    /// Identifier of a later hop whose seed could not be chained from the
    /// previous hop's fulfilling receipt. The pool contract sends these, so
    /// the pool address is the account searched for.
    pub async fn recover_chained(
        &self,
        operation: &Operation,
        hop: &HopSpec,
    ) -> ReconcilerResult<Option<HopIdentifier>> {
        self.search_history(operation, hop, operation.pool_address).await
    }

    async fn search_history(
        &self,
        operation: &Operation,
        hop: &HopSpec,
        account: Address,
    ) -> ReconcilerResult<Option<HopIdentifier>> {
        let source = self.ctx.directory.get(hop.source_chain_id)?;
        self.ctx
            .extractor
            .from_history(&HistoryQuery {
                chain_id: source.chain_id,
                contract: source.send_emitter(hop.medium, operation.pool_address),
                account,
                medium: hop.medium,
                since_block: source.search_from_block,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::PoolState;
    use crate::test_utils::*;
    use ethers::types::U256;

    #[tokio::test]
    async fn test_deposit_recovered_from_history() {
        let harness = TestHarness::new();
        harness.logs.push(OPTIMISM, deposit_log(4, user(), 100));
        harness.logs.push(OPTIMISM, deposit_log(5, user(), 200));

        let op = operation(OperationKind::Deposit, OPTIMISM, ARBITRUM, ARBITRUM);
        let outcome = RecoveryBootstrapper::new(&harness.ctx)
            .recover(&op, &op.hop_plan()[0])
            .await;
        assert_eq!(
            outcome,
            RecoveryOutcome::Recovered(HopIdentifier::DepositId(U256::from(5)))
        );
    }

    #[tokio::test]
    async fn test_errors_await_origin() {
        let harness = TestHarness::new();
        harness.logs.set_failing(true);

        let op = operation(OperationKind::Withdraw, OPTIMISM, ARBITRUM, ARBITRUM);
        let outcome = RecoveryBootstrapper::new(&harness.ctx)
            .recover(&op, &op.hop_plan()[0])
            .await;
        assert_eq!(outcome, RecoveryOutcome::AwaitingOrigin);
    }

    #[tokio::test]
    async fn test_pivot_already_positioned() {
        let harness = TestHarness::new();
        harness.chain.set_pool_state(PoolState {
            pivot_nonce: U256::from(3),
            position_chain_id: BASE,
        });

        let op = operation(OperationKind::Pivot, OPTIMISM, BASE, ARBITRUM);
        let outcome = RecoveryBootstrapper::new(&harness.ctx)
            .recover(&op, &op.hop_plan()[0])
            .await;
        assert_eq!(outcome, RecoveryOutcome::Complete);
        assert_eq!(harness.logs.calls(), 0);
    }

    #[tokio::test]
    async fn test_pivot_follows_nonce_to_receipt() {
        let harness = TestHarness::new();
        harness.chain.set_pool_state(PoolState {
            pivot_nonce: U256::from(7),
            position_chain_id: OPTIMISM,
        });
        let pivot_tx = H256::repeat_byte(0x70);
        harness.logs.push(OPTIMISM, pivot_log(6, H256::repeat_byte(0x60)));
        harness.logs.push(OPTIMISM, pivot_log(7, pivot_tx));
        harness
            .chain
            .set_receipt(OPTIMISM, pivot_tx, vec![deposit_log(31, pool(), 0)]);

        let op = operation(OperationKind::Pivot, OPTIMISM, BASE, ARBITRUM);
        let outcome = RecoveryBootstrapper::new(&harness.ctx)
            .recover(&op, &op.hop_plan()[0])
            .await;
        assert_eq!(
            outcome,
            RecoveryOutcome::Recovered(HopIdentifier::DepositId(U256::from(31)))
        );
    }

    #[tokio::test]
    async fn test_chained_searches_pool_sends() {
        let harness = TestHarness::new();
        let message_id = H256::repeat_byte(0x42);
        harness.logs.push(ARBITRUM, message_log(H256::repeat_byte(0x41), user(), 10));
        harness.logs.push(ARBITRUM, message_log(message_id, pool(), 20));

        let op = operation(OperationKind::Deposit, OPTIMISM, BASE, ARBITRUM);
        let found = RecoveryBootstrapper::new(&harness.ctx)
            .recover_chained(&op, &op.hop_plan()[1])
            .await
            .unwrap();
        assert_eq!(found, Some(HopIdentifier::MessageId(message_id)));

        let query = harness.logs.queries().pop().unwrap();
        assert_eq!(query.chain_id, ARBITRUM);
        assert_eq!(query.address, pool());
    }

    #[tokio::test]
    async fn test_chained_ignores_router_logs() {
        let harness = TestHarness::new();
        let router = Address::repeat_byte(0x31);
        let mut routed = message_log(H256::repeat_byte(0x42), pool(), 20);
        routed.address = router;
        harness.logs.push(ARBITRUM, routed);

        let op = operation(OperationKind::Deposit, OPTIMISM, BASE, ARBITRUM);
        let found = RecoveryBootstrapper::new(&harness.ctx)
            .recover_chained(&op, &op.hop_plan()[1])
            .await
            .unwrap();
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn test_deposit_searches_spoke_pool() {
        let harness = TestHarness::new();
        let op = operation(OperationKind::Deposit, OPTIMISM, ARBITRUM, ARBITRUM);
        RecoveryBootstrapper::new(&harness.ctx)
            .recover(&op, &op.hop_plan()[0])
            .await;

        let query = harness.logs.queries().pop().unwrap();
        assert_eq!(query.chain_id, OPTIMISM);
        assert_eq!(query.address, harness.ctx.directory.get(OPTIMISM).unwrap().asset_bridge);
        assert_eq!(query.topics[0], Some(harness.ctx.catalog.asset_deposit.topic));
    }
}
