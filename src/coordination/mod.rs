//! Reconciliation engine for multi-hop pool operations
//!
//! The engine:
//! 1. Resolves an operation's chain topology into an ordered hop plan
//! 2. Discovers each hop's bridge identifier, from a receipt or from history
//! 3. Polls the matching indexer until the hop is fulfilled, chaining the next
//!    hop's identifier out of the fulfilling transaction
//! 4. Publishes progress snapshots and refresh notifications per session

pub mod engine;
pub mod hop;
pub mod recovery;
pub mod session;
pub mod topology;

pub use engine::{Reconciler, SessionKey};
pub use hop::{Hop, HopPoller, HopSnapshot, HopStatus, PollOutcome};
pub use recovery::{RecoveryBootstrapper, RecoveryOutcome};
pub use session::{ReconciliationSession, RefreshCallback, SessionPhase, SessionProgress, SessionView};
pub use topology::{HopSpec, Medium, Operation, OperationKind, Topology};

use crate::chain::ChainRpc;
use crate::config::{ChainDirectory, PollingConfig};
use crate::events::{EventCatalog, IdentifierExtractor};
use crate::indexer::{LogIndexer, MessageStatusIndexer};

use std::sync::Arc;

/// Shared, read-only dependencies of every session
pub struct ReconcilerContext {
    pub directory: Arc<ChainDirectory>,
    pub catalog: Arc<EventCatalog>,
    pub extractor: IdentifierExtractor,
    pub rpc: Arc<dyn ChainRpc>,
    pub logs: Arc<dyn LogIndexer>,
    pub messages: Arc<dyn MessageStatusIndexer>,
    pub polling: PollingConfig,
}

impl ReconcilerContext {
    pub fn new(
        directory: Arc<ChainDirectory>,
        catalog: Arc<EventCatalog>,
        rpc: Arc<dyn ChainRpc>,
        logs: Arc<dyn LogIndexer>,
        messages: Arc<dyn MessageStatusIndexer>,
        polling: PollingConfig,
    ) -> Self {
        Self {
            extractor: IdentifierExtractor::new(catalog.clone(), logs.clone()),
            directory,
            catalog,
            rpc,
            logs,
            messages,
            polling,
        }
    }
}
