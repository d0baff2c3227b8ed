//! One reconciliation session: a single operation tracked hop by hop
//!
//! A session owns two tasks: the driver, which walks the hop plan in order,
//! and the refresher, which notifies the caller periodically while hops are
//! outstanding. Progress is published through a watch channel so readers
//! never block the pollers.

use super::hop::{Hop, HopPoller, HopSnapshot, HopStatus};
use super::recovery::{RecoveryBootstrapper, RecoveryOutcome};
use super::topology::{HopSpec, Operation, Topology};
use super::ReconcilerContext;
use crate::error::ReconcilerResult;
use crate::events::HopIdentifier;

use chrono::{DateTime, Utc};
use ethers::types::H256;
use serde::Serialize;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Notification that fresh state may be available
pub type RefreshCallback = Arc<dyn Fn() + Send + Sync>;

thread_local! {
    /// Session whose refresh callback is running on this thread
    static REFRESHING: Cell<Option<Uuid>> = Cell::new(None);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Locating the first hop's identifier
    Resolving,
    /// The originating transaction is not visible yet
    AwaitingOrigin,
    /// At least one hop is being polled
    Tracking,
    Complete,
    Stopped,
}

impl SessionPhase {
    pub fn is_finished(&self) -> bool {
        matches!(self, SessionPhase::Complete | SessionPhase::Stopped)
    }
}

/// Published state of a session
#[derive(Debug, Clone)]
pub struct SessionProgress {
    pub phase: SessionPhase,
    pub hops: Vec<Hop>,
    pub updated_at: DateTime<Utc>,
}

/// Serializable view for the API
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub id: Uuid,
    pub operation: Operation,
    pub topology: Topology,
    pub phase: SessionPhase,
    pub hops: Vec<HopSnapshot>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct SessionInner {
    id: Uuid,
    operation: Operation,
    topology: Topology,
    ctx: Arc<ReconcilerContext>,
    progress: watch::Sender<SessionProgress>,
    refresh: RefreshCallback,
    stopped: AtomicBool,
    /// Held while a refresh callback runs
    callback_gate: Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: DateTime<Utc>,
}

/// Handle to a running session. Cloning shares the same session.
#[derive(Clone)]
pub struct ReconciliationSession {
    inner: Arc<SessionInner>,
}

impl ReconciliationSession {
    /// Validate `operation` and begin tracking it.
    ///
    /// Must be called from within a tokio runtime. The refresh callback fires
    /// once before this returns.
    pub fn start(
        ctx: Arc<ReconcilerContext>,
        operation: Operation,
        known_tx_hash: Option<H256>,
        refresh: RefreshCallback,
    ) -> ReconcilerResult<Self> {
        operation.validate()?;
        for chain_id in operation.chain_ids() {
            ctx.directory.get(chain_id)?;
        }

        let plan = operation.hop_plan();
        let topology = operation.topology();
        let (progress, _) = watch::channel(SessionProgress {
            phase: SessionPhase::Resolving,
            hops: plan.iter().copied().map(Hop::new).collect(),
            updated_at: Utc::now(),
        });

        let inner = Arc::new(SessionInner {
            id: Uuid::new_v4(),
            operation,
            topology,
            ctx,
            progress,
            refresh,
            stopped: AtomicBool::new(false),
            callback_gate: Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
            started_at: Utc::now(),
        });

        info!(
            "Session {} started: {} for pool {:?} ({:?}, {} hops)",
            inner.id,
            inner.operation.kind,
            inner.operation.pool_address,
            topology,
            plan.len()
        );
        crate::metrics::record_session_started(inner.operation.kind.as_str());
        inner.fire_refresh();

        if plan.is_empty() {
            inner.set_phase(SessionPhase::Complete);
            return Ok(Self { inner });
        }

        let driver = tokio::spawn(SessionInner::drive(inner.clone(), plan, known_tx_hash));
        let refresher = tokio::spawn(SessionInner::refresh_while_pending(inner.clone()));
        inner.lock_tasks().extend([driver, refresher]);

        Ok(Self { inner })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn operation(&self) -> &Operation {
        &self.inner.operation
    }

    pub fn topology(&self) -> Topology {
        self.inner.topology
    }

    /// Current hop snapshots, in plan order
    pub fn snapshot(&self) -> Vec<HopSnapshot> {
        self.inner.progress.borrow().hops.iter().map(Hop::snapshot).collect()
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.progress.borrow().phase
    }

    pub fn is_finished(&self) -> bool {
        self.phase().is_finished()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.inner.progress.borrow().updated_at
    }

    pub fn view(&self) -> SessionView {
        let progress = self.inner.progress.borrow();
        SessionView {
            id: self.inner.id,
            operation: self.inner.operation.clone(),
            topology: self.inner.topology,
            phase: progress.phase,
            hops: progress.hops.iter().map(Hop::snapshot).collect(),
            started_at: self.inner.started_at,
            updated_at: progress.updated_at,
        }
    }

    /// Receiver notified on every progress change
    pub fn subscribe(&self) -> watch::Receiver<SessionProgress> {
        self.inner.progress.subscribe()
    }

    /// Cancel all timers. Idempotent; no callback fires afterwards.
    ///
    /// A refresh callback already running on another thread finishes before
    /// this returns. Calling `stop` from inside the callback is allowed.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if REFRESHING.with(Cell::get) != Some(self.inner.id) {
            drop(self.inner.lock_gate());
        }

        for task in self.inner.lock_tasks().drain(..) {
            task.abort();
        }

        self.inner.progress.send_if_modified(|progress| {
            if progress.phase.is_finished() {
                return false;
            }
            progress.phase = SessionPhase::Stopped;
            progress.updated_at = Utc::now();
            true
        });
        info!("Session {} stopped", self.inner.id);
    }
}

impl SessionInner {
    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        // A poisoned lock only means another thread panicked mid-push
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_gate(&self) -> MutexGuard<'_, ()> {
        self.callback_gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn fire_refresh(&self) {
        let _gate = self.lock_gate();
        if self.is_stopped() {
            return;
        }
        crate::metrics::record_refresh();
        let outer = REFRESHING.with(|r| r.replace(Some(self.id)));
        (self.refresh)();
        REFRESHING.with(|r| r.set(outer));
    }

    /// Apply `change` unless stopped; `change` reports whether anything moved
    fn update(&self, change: impl FnOnce(&mut SessionProgress) -> bool) -> bool {
        self.progress.send_if_modified(|progress| {
            // Checked under the channel lock, which `stop` also takes
            if self.is_stopped() {
                return false;
            }
            let changed = change(progress);
            if changed {
                progress.updated_at = Utc::now();
            }
            changed
        })
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.update(|progress| {
            if progress.phase == phase || progress.phase.is_finished() {
                return false;
            }
            debug!("Session {} phase {:?} -> {:?}", self.id, progress.phase, phase);
            progress.phase = phase;
            true
        });
    }

    fn advance_hop(&self, index: usize, status: HopStatus) {
        self.update(|progress| {
            progress
                .hops
                .get_mut(index)
                .map_or(false, |hop| hop.advance(status))
        });
    }

    fn assign_identifier(&self, index: usize, identifier: HopIdentifier) -> HopIdentifier {
        let mut effective = identifier;
        self.update(|progress| match progress.hops.get_mut(index) {
            Some(hop) => {
                let assigned = hop.assign_identifier(identifier);
                effective = hop.identifier().unwrap_or(identifier);
                assigned
            }
            None => false,
        });
        effective
    }

    async fn drive(self: Arc<Self>, plan: Vec<HopSpec>, known_tx_hash: Option<H256>) {
        let Some(first) = plan.first() else {
            return;
        };

        let mut seed = match self.locate_origin(first, known_tx_hash).await {
            Some(identifier) => Some(identifier),
            None => {
                // Already took effect on chain
                self.update(|progress| {
                    progress
                        .hops
                        .iter_mut()
                        .fold(false, |moved, hop| hop.advance(HopStatus::Fulfilled) || moved)
                });
                self.finish().await;
                return;
            }
        };

        for spec in &plan {
            let identifier = match seed.take() {
                Some(identifier) => identifier,
                None => self.await_chained(spec).await,
            };
            let identifier = self.assign_identifier(spec.index, identifier);
            self.set_phase(SessionPhase::Tracking);
            info!(
                "Session {} hop {} pending: {} {}",
                self.id,
                spec.index,
                spec.medium.label(),
                identifier
            );

            let next_medium = plan.get(spec.index + 1).map(|next| next.medium);
            let started = std::time::Instant::now();
            seed = HopPoller::new(&self.ctx, *spec, identifier, next_medium)
                .run()
                .await;

            self.advance_hop(spec.index, HopStatus::Fulfilled);
            crate::metrics::record_hop_fulfilled(spec.medium, started.elapsed());
            if next_medium.is_some() && seed.is_none() {
                warn!(
                    "Session {}: hop {} fulfilled without a chained identifier, searching history",
                    self.id, spec.index
                );
            }
        }

        self.finish().await;
    }

    async fn finish(&self) {
        self.set_phase(SessionPhase::Complete);
        info!("Session {} complete", self.id);
        tokio::time::sleep(self.ctx.polling.completion_refresh_delay()).await;
        self.fire_refresh();
    }

    /// Identifier of the first hop, or `None` if the operation is already complete.
    ///
    /// A known transaction hash is trusted exclusively until its receipt shows
    /// up; history is only consulted when that receipt lacks the send event.
    async fn locate_origin(&self, first: &HopSpec, known_tx_hash: Option<H256>) -> Option<HopIdentifier> {
        let interval = self.ctx.polling.poll_interval(first.medium);
        let bootstrapper = RecoveryBootstrapper::new(&self.ctx);

        loop {
            let use_history = match known_tx_hash {
                None => true,
                Some(tx_hash) => {
                    match self.ctx.rpc.transaction_logs(first.source_chain_id, tx_hash).await {
                        Ok(Some(logs)) => match self.ctx.extractor.from_receipt(&logs, first.medium) {
                            Some(identifier) => return Some(identifier),
                            None => {
                                debug!(
                                    "Receipt of {:?} has no {} send event",
                                    tx_hash,
                                    first.medium.as_str()
                                );
                                true
                            }
                        },
                        Ok(None) => false,
                        Err(e) => {
                            warn!("Receipt lookup for {:?} failed: {}", tx_hash, e);
                            false
                        }
                    }
                }
            };

            if use_history {
                match bootstrapper.recover(&self.operation, first).await {
                    RecoveryOutcome::Recovered(identifier) => return Some(identifier),
                    RecoveryOutcome::Complete => return None,
                    RecoveryOutcome::AwaitingOrigin => {}
                }
            }

            self.set_phase(SessionPhase::AwaitingOrigin);
            tokio::time::sleep(interval).await;
        }
    }

    /// Search history for a later hop's identifier until it shows up
    async fn await_chained(&self, spec: &HopSpec) -> HopIdentifier {
        let interval = self.ctx.polling.poll_interval(spec.medium);
        let bootstrapper = RecoveryBootstrapper::new(&self.ctx);

        loop {
            match bootstrapper.recover_chained(&self.operation, spec).await {
                Ok(Some(identifier)) => return identifier,
                Ok(None) => debug!("Session {} hop {} send not indexed yet", self.id, spec.index),
                Err(e) => warn!("Session {} hop {} history search failed: {}", self.id, spec.index, e),
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn refresh_while_pending(self: Arc<Self>) {
        let interval = self.ctx.polling.refresh_interval();
        loop {
            tokio::time::sleep(interval).await;
            let finished = self.progress.borrow().phase.is_finished();
            if finished {
                break;
            }
            self.fire_refresh();
        }
    }
}
