//! Operation classification and hop planning
//!
//! Pure functions over chain ids; no I/O. Whether a chain id is actually
//! configured is checked by the caller against the chain directory.

use crate::error::{ReconcilerError, ReconcilerResult};

use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What the user or pivot trigger asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Deposit,
    Withdraw,
    Pivot,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Deposit => "deposit",
            OperationKind::Withdraw => "withdraw",
            OperationKind::Pivot => "pivot",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = ReconcilerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "deposit" => Ok(OperationKind::Deposit),
            "withdraw" => Ok(OperationKind::Withdraw),
            "pivot" => Ok(OperationKind::Pivot),
            other => Err(ReconcilerError::InvalidOperation(format!(
                "unknown operation kind: {}",
                other
            ))),
        }
    }
}

/// One deposit, withdrawal or pivot request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    pub origin_chain_id: u64,
    pub destination_chain_id: u64,
    /// Chain hosting the pool contract's authoritative state
    pub settlement_chain_id: u64,
    pub pool_address: Address,
    /// Depositing or withdrawing account, absent for pivots
    pub user_address: Option<Address>,
}

impl Operation {
    /// Check the fields required by the operation kind
    pub fn validate(&self) -> ReconcilerResult<()> {
        match self.kind {
            OperationKind::Deposit | OperationKind::Withdraw if self.user_address.is_none() => {
                Err(ReconcilerError::InvalidOperation(format!(
                    "{} requires a user address",
                    self.kind
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn chain_ids(&self) -> [u64; 3] {
        [
            self.origin_chain_id,
            self.destination_chain_id,
            self.settlement_chain_id,
        ]
    }

    pub fn topology(&self) -> Topology {
        classify(
            self.origin_chain_id,
            self.destination_chain_id,
            self.settlement_chain_id,
        )
    }

    pub fn hop_plan(&self) -> Vec<HopSpec> {
        resolve(
            self.origin_chain_id,
            self.destination_chain_id,
            self.settlement_chain_id,
        )
    }
}

/// Cross-chain primitive carrying a hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Medium {
    AssetBridge,
    MessageBridge,
}

impl Medium {
    /// Human-readable label for progress rendering
    pub fn label(&self) -> &'static str {
        match self {
            Medium::AssetBridge => "Asset bridge",
            Medium::MessageBridge => "Message bridge",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Medium::AssetBridge => "asset_bridge",
            Medium::MessageBridge => "message_bridge",
        }
    }
}

/// How origin, destination and settlement chains relate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// All three chains equal: no hops
    SameChain,
    /// One hop toward the settlement chain
    SingleInbound,
    /// One hop away from the settlement chain
    SingleOutbound,
    /// Three distinct chains: two hops through the settlement chain
    Triangular,
}

/// Planned hop of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HopSpec {
    pub index: usize,
    pub medium: Medium,
    pub source_chain_id: u64,
    pub destination_chain_id: u64,
    /// True for asset-bridge hops; selects the fill indexer over the message indexer
    pub transfers_value: bool,
}

impl HopSpec {
    fn new(index: usize, medium: Medium, source_chain_id: u64, destination_chain_id: u64) -> Self {
        Self {
            index,
            medium,
            source_chain_id,
            destination_chain_id,
            transfers_value: medium == Medium::AssetBridge,
        }
    }

    pub fn description(&self) -> String {
        format!(
            "{}: chain {} to chain {}",
            self.medium.label(),
            self.source_chain_id,
            self.destination_chain_id
        )
    }
}

/// Classify by chain-id equality alone
pub fn classify(origin: u64, destination: u64, settlement: u64) -> Topology {
    match (origin == destination, origin == settlement, destination == settlement) {
        (true, true, _) => Topology::SameChain,
        (false, true, false) => Topology::SingleOutbound,
        (true, false, _) | (false, false, true) => Topology::SingleInbound,
        (false, false, false) => Topology::Triangular,
        // origin == settlement and destination == settlement imply origin == destination
        (false, true, true) => Topology::SameChain,
    }
}

/// Ordered hop plan for an operation. Total over any chain ids.
///
/// Value always reaches the settlement chain before anything leaves it:
/// - outbound: the pool bridges funds from the settlement chain
/// - inbound from a position chain that is also the destination: only state
///   needs to reach the pool, so a message suffices
/// - inbound from a third chain into the settlement chain: funds are bridged
/// - triangular: funds are bridged into the settlement chain, whose receipt
///   then sends the confirming message on to the destination
pub fn resolve(origin: u64, destination: u64, settlement: u64) -> Vec<HopSpec> {
    match classify(origin, destination, settlement) {
        Topology::SameChain => Vec::new(),
        Topology::SingleOutbound => vec![HopSpec::new(0, Medium::AssetBridge, settlement, destination)],
        Topology::SingleInbound if origin == destination => {
            vec![HopSpec::new(0, Medium::MessageBridge, origin, settlement)]
        }
        Topology::SingleInbound => vec![HopSpec::new(0, Medium::AssetBridge, origin, settlement)],
        Topology::Triangular => vec![
            HopSpec::new(0, Medium::AssetBridge, origin, settlement),
            HopSpec::new(1, Medium::MessageBridge, settlement, destination),
        ],
    }
}
