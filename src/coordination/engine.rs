//! Session registry: at most one live session per pool and operation kind

use super::session::{ReconciliationSession, RefreshCallback};
use super::topology::{Operation, OperationKind};
use super::ReconcilerContext;
use crate::error::{ReconcilerError, ReconcilerResult};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers::types::{Address, H256};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};
use tracing::{debug, info};

/// Finished sessions stay queryable this long before being pruned
const FINISHED_RETENTION_SECS: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub pool: Address,
    pub kind: OperationKind,
}

impl SessionKey {
    pub fn of(operation: &Operation) -> Self {
        Self {
            pool: operation.pool_address,
            kind: operation.kind,
        }
    }
}

/// Owns all reconciliation sessions of the process
pub struct Reconciler {
    /// Shared dependencies handed to each session
    ctx: Arc<ReconcilerContext>,
    sessions: DashMap<SessionKey, ReconciliationSession>,
    /// Shutdown flag
    shutdown: Arc<RwLock<bool>>,
}

impl Reconciler {
    pub fn new(ctx: Arc<ReconcilerContext>) -> Self {
        Self {
            ctx,
            sessions: DashMap::new(),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub fn context(&self) -> &Arc<ReconcilerContext> {
        &self.ctx
    }

    /// Start tracking `operation`, replacing a finished session for the same key.
    ///
    /// The session is started outside the map lock so that the refresh
    /// callback may query the reconciler.
    pub fn track(
        &self,
        operation: Operation,
        known_tx_hash: Option<H256>,
        refresh: RefreshCallback,
    ) -> ReconcilerResult<ReconciliationSession> {
        let key = SessionKey::of(&operation);
        if self.session(key.pool, key.kind).map_or(false, |s| !s.is_finished()) {
            return Err(already_active(key));
        }

        let session = ReconciliationSession::start(self.ctx.clone(), operation, known_tx_hash, refresh)?;

        match self.sessions.entry(key) {
            Entry::Occupied(entry) if !entry.get().is_finished() => {
                // Lost a race against a concurrent track call
                session.stop();
                Err(already_active(key))
            }
            Entry::Occupied(mut entry) => {
                entry.insert(session.clone());
                Ok(session)
            }
            Entry::Vacant(entry) => {
                entry.insert(session.clone());
                Ok(session)
            }
        }
    }

    pub fn session(&self, pool: Address, kind: OperationKind) -> Option<ReconciliationSession> {
        self.sessions
            .get(&SessionKey { pool, kind })
            .map(|s| s.value().clone())
    }

    /// Stop a session; returns false if none exists for the key
    pub fn stop(&self, pool: Address, kind: OperationKind) -> bool {
        match self.session(pool, kind) {
            Some(session) => {
                session.stop();
                true
            }
            None => false,
        }
    }

    pub fn sessions(&self) -> Vec<ReconciliationSession> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|e| !e.value().is_finished()).count()
    }

    pub fn stop_all(&self) {
        for session in self.sessions() {
            session.stop();
        }
    }

    /// Drop sessions that finished more than the retention period ago
    pub fn prune_finished(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::seconds(FINISHED_RETENTION_SECS);
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| !(session.is_finished() && session.updated_at() < cutoff));
        before - self.sessions.len()
    }

    /// Housekeeping loop
    pub async fn run(&self) -> ReconcilerResult<()> {
        let mut cleanup_interval = interval(Duration::from_secs(60));

        info!("Reconciler started");

        loop {
            if *self.shutdown.read().await {
                break;
            }

            cleanup_interval.tick().await;
            let pruned = self.prune_finished();
            if pruned > 0 {
                debug!("Pruned {} finished sessions", pruned);
            }
            crate::metrics::set_active_sessions(self.active_count());
        }

        info!("Reconciler stopped");
        Ok(())
    }

    /// Stop the housekeeping loop and every session
    pub async fn shutdown(&self) {
        *self.shutdown.write().await = true;
        self.stop_all();
        info!("Reconciler shutdown initiated");
    }
}

fn already_active(key: SessionKey) -> ReconcilerError {
    ReconcilerError::SessionAlreadyActive {
        pool: format!("{:?}", key.pool),
        kind: key.kind.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::SessionPhase;
    use crate::test_utils::*;

    fn reconciler() -> (TestHarness, Reconciler) {
        let harness = TestHarness::new();
        let reconciler = Reconciler::new(harness.ctx.clone());
        (harness, reconciler)
    }

    fn noop() -> RefreshCallback {
        Arc::new(|| {})
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_active_session_rejected() {
        let (_harness, reconciler) = reconciler();
        let op = operation(OperationKind::Deposit, OPTIMISM, ARBITRUM, ARBITRUM);

        reconciler.track(op.clone(), None, noop()).unwrap();
        let err = reconciler.track(op.clone(), None, noop()).err().unwrap();
        assert!(matches!(err, ReconcilerError::SessionAlreadyActive { .. }));

        // A different kind on the same pool is independent
        let withdraw = operation(OperationKind::Withdraw, OPTIMISM, ARBITRUM, ARBITRUM);
        assert!(reconciler.track(withdraw, None, noop()).is_ok());
        assert_eq!(reconciler.active_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_session_can_be_replaced() {
        let (_harness, reconciler) = reconciler();
        let op = operation(OperationKind::Deposit, OPTIMISM, ARBITRUM, ARBITRUM);

        let first = reconciler.track(op.clone(), None, noop()).unwrap();
        assert!(reconciler.stop(pool(), OperationKind::Deposit));
        assert_eq!(first.phase(), SessionPhase::Stopped);

        let second = reconciler.track(op, None, noop()).unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(
            reconciler.session(pool(), OperationKind::Deposit).map(|s| s.id()),
            Some(second.id())
        );
        assert!(!reconciler.stop(Address::repeat_byte(0x01), OperationKind::Pivot));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_operation_not_registered() {
        let (_harness, reconciler) = reconciler();
        let mut op = operation(OperationKind::Deposit, OPTIMISM, ARBITRUM, ARBITRUM);
        op.user_address = None;

        assert!(reconciler.track(op, None, noop()).err().unwrap().is_configuration());
        assert!(reconciler.sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_and_prune() {
        let (_harness, reconciler) = reconciler();
        reconciler
            .track(operation(OperationKind::Deposit, BASE, BASE, BASE), None, noop())
            .unwrap();
        reconciler
            .track(operation(OperationKind::Pivot, OPTIMISM, ARBITRUM, ARBITRUM), None, noop())
            .unwrap();

        reconciler.stop_all();
        assert_eq!(reconciler.active_count(), 0);
        // Retained until the retention period passes
        assert_eq!(reconciler.prune_finished(), 0);
        assert_eq!(reconciler.sessions().len(), 2);
    }
}
