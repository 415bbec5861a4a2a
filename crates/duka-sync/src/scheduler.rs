//! # Sync Scheduler
//!
//! Drains the device ledger into the remote ledger.
//!
//! ## Record State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   Pending ──attempt──► Syncing ──ok──► removed (or Synced history)      │
//! │      ▲                    │                                             │
//! │      │   fail,            │ fail, attempts >= max                       │
//! │      │   attempts < max   ▼                                             │
//! │      └────────────────  Failed (terminal, logged once)                  │
//! │                           │                                             │
//! │                           └── retry_failed() ──► Pending, attempts 0    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Triggers
//! ```text
//! capture() while online ───────────────► attempt(id)        (spawned)
//! interval tick (30s) ──────────────────► sync_all_pending()
//! connectivity offline → online ─settle─► sync_all_pending()
//! ```
//!
//! One loop task owns the timer. Within a pass, distinct records are
//! attempted concurrently; the same id is never attempted twice at once.
//!
//! ## Failure Logging
//! ```text
//! transient (stock conflict, timeout, network)
//!     attempts 1..max-1  debug
//!     final attempt      error, once
//! fatal (validation, schema)
//!     first occurrence   error, once
//!     later attempts     debug
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{CommitError, SyncError, SyncResult};
use crate::hooks::{NoOpHooks, SaleEventHooks};
use crate::ledger::{ListFilter, LocalSaleLedger, SalePatch};
use crate::remote::{CommitReceipt, RemoteSaleProcessor};
use crate::retry::RetryPolicy;
use duka_core::validation::validate_payload;
use duka_core::{FailureClass, SalePayload, SaleRecord, SyncState, MAX_SYNC_ATTEMPTS};

// =============================================================================
// Options
// =============================================================================

/// Timing and retry knobs of the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// When false, `start()` does nothing and captures are not attempted.
    pub enabled: bool,
    pub interval: Duration,
    pub settle_delay: Duration,
    pub commit_timeout: Duration,
    pub max_attempts: u32,
    pub retry: RetryPolicy,
    /// Keep committed records as `Synced` history instead of deleting them.
    pub retain_synced: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        SchedulerOptions {
            enabled: true,
            interval: Duration::from_secs(30),
            settle_delay: Duration::from_secs(1),
            commit_timeout: Duration::from_secs(15),
            max_attempts: MAX_SYNC_ATTEMPTS,
            retry: RetryPolicy::default(),
            retain_synced: false,
        }
    }
}

impl SchedulerOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        SchedulerOptions {
            enabled: config.sync.enabled,
            interval: config.sync.interval(),
            settle_delay: config.sync.settle_delay(),
            commit_timeout: config.sync.commit_timeout(),
            max_attempts: config.sync.max_attempts,
            retry: RetryPolicy::from(&config.sync),
            retain_synced: config.ledger.retain_synced,
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Result of one attempt on one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Committed (or already committed) and taken off the queue.
    Synced(CommitReceipt),
    /// Failed, back to `Pending` for a later pass.
    Retrying(FailureClass),
    /// Failed for the last time, now `Failed`.
    Exhausted,
    /// Another attempt on this id is running.
    InFlight,
    /// Not `Pending`, or no longer in the ledger.
    Skipped,
}

/// What one `sync_all_pending` pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    pub skipped: usize,
    pub exhausted: usize,
}

impl SyncRunReport {
    pub fn has_work(&self) -> bool {
        self.attempted > 0
    }

    fn tally(&mut self, outcome: AttemptOutcome) {
        match outcome {
            AttemptOutcome::Synced(_) => {
                self.attempted += 1;
                self.synced += 1;
            }
            AttemptOutcome::Retrying(_) => {
                self.attempted += 1;
                self.failed += 1;
            }
            AttemptOutcome::Exhausted => {
                self.attempted += 1;
                self.exhausted += 1;
            }
            AttemptOutcome::InFlight | AttemptOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Snapshot for the pending indicator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub online: bool,
    pub running: bool,
    pub pending_count: usize,
    pub in_flight: usize,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct RunState {
    running: bool,
    last_run_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

// =============================================================================
// Single-flight Guard
// =============================================================================

/// Holds an id in the in-flight set until dropped.
struct InFlight<'a> {
    set: &'a StdMutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.id);
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Long-lived service draining the ledger. Share it as `Arc<SyncScheduler>`.
///
/// ## Usage
/// ```rust,ignore
/// let scheduler = Arc::new(
///     SyncScheduler::new(ledger, remote, connectivity, SchedulerOptions::from_config(&config))
///         .with_hooks(Arc::new(ReceiptSender::new())),
/// );
/// scheduler.start().await?;
///
/// let sale_id = scheduler.capture(payload).await?;
///
/// scheduler.shutdown().await;
/// ```
pub struct SyncScheduler {
    ledger: Arc<LocalSaleLedger>,
    remote: Arc<dyn RemoteSaleProcessor>,
    connectivity: ConnectivityMonitor,
    hooks: Arc<dyn SaleEventHooks>,
    options: SchedulerOptions,
    in_flight: StdMutex<HashSet<String>>,
    state: RwLock<RunState>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new(
        ledger: Arc<LocalSaleLedger>,
        remote: Arc<dyn RemoteSaleProcessor>,
        connectivity: ConnectivityMonitor,
        options: SchedulerOptions,
    ) -> Self {
        SyncScheduler {
            ledger,
            remote,
            connectivity,
            hooks: Arc::new(NoOpHooks),
            options,
            in_flight: StdMutex::new(HashSet::new()),
            state: RwLock::new(RunState::default()),
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn SaleEventHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn ledger(&self) -> &Arc<LocalSaleLedger> {
        &self.ledger
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawns the loop. A second call while it runs is a no-op.
    pub async fn start(self: &Arc<Self>) -> SyncResult<()> {
        if !self.options.enabled {
            info!("Sync disabled, scheduler not started");
            return Ok(());
        }

        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("Sync scheduler already running");
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.lock().await = Some(shutdown_tx);
        self.state.write().await.running = true;

        let this = Arc::clone(self);
        let connectivity_rx = self.connectivity.subscribe();
        *task = Some(tokio::spawn(this.run(shutdown_rx, connectivity_rx)));

        info!(
            interval_secs = self.options.interval.as_secs(),
            max_attempts = self.options.max_attempts,
            "Sync scheduler started"
        );
        Ok(())
    }

    /// Stops the loop and waits for it. In-flight attempts spawned by
    /// `capture` finish on their own.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(()).await;
        }
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Sync scheduler task ended abnormally");
            }
        }
        self.state.write().await.running = false;
    }

    async fn run(
        self: Arc<Self>,
        mut shutdown_rx: mpsc::Receiver<()>,
        mut connectivity_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(self.options.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watching = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.connectivity.is_online() {
                        self.run_pass("timer").await;
                    }
                }

                changed = connectivity_rx.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    let online = *connectivity_rx.borrow_and_update();
                    if !online {
                        continue;
                    }
                    debug!(settle_ms = self.options.settle_delay.as_millis() as u64, "Online again, settling");
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.settle_delay) => {}
                        _ = shutdown_rx.recv() => {
                            info!("Sync scheduler received shutdown signal");
                            break;
                        }
                    }
                    if self.connectivity.is_online() {
                        self.run_pass("connectivity").await;
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("Sync scheduler received shutdown signal");
                    break;
                }
            }
        }

        self.state.write().await.running = false;
        info!("Sync scheduler stopped");
    }

    async fn run_pass(&self, trigger: &str) {
        if let Err(e) = self.sync_all_pending().await {
            error!(trigger, error = %e, "Sync pass failed");
            self.state.write().await.last_error = Some(e.to_string());
        }
    }

    // =========================================================================
    // Capture
    // =========================================================================

    /// Validates and queues a sale, then tries it right away when online.
    ///
    /// Returns the sale id as soon as the record is durable.
    pub async fn capture(self: &Arc<Self>, payload: SalePayload) -> SyncResult<String> {
        validate_payload(&payload)?;
        let sale_id = self.ledger.append(payload).await?;

        if self.options.enabled && self.connectivity.is_online() {
            let this = Arc::clone(self);
            let id = sale_id.clone();
            tokio::spawn(async move {
                if let Err(e) = this.attempt(&id).await {
                    warn!(sale_id = %id, error = %e, "Immediate sync attempt failed");
                }
            });
        }

        Ok(sale_id)
    }

    // =========================================================================
    // Draining
    // =========================================================================

    /// One pass: debounced cleanup, then every due record concurrently.
    pub async fn sync_all_pending(&self) -> SyncResult<SyncRunReport> {
        let mut report = SyncRunReport::default();

        if !self.connectivity.is_online() {
            debug!("Offline, skipping sync pass");
            return Ok(report);
        }

        if let Err(e) = self.ledger.maybe_cleanup().await {
            warn!(error = %e, "Ledger cleanup failed");
        }

        let now = Utc::now();
        let (due, waiting): (Vec<SaleRecord>, Vec<SaleRecord>) = self
            .ledger
            .list(ListFilter::RetryEligible)
            .await
            .into_iter()
            .partition(|r| self.options.retry.is_due(r, now));
        report.skipped += waiting.len();

        let outcomes = join_all(due.iter().map(|r| self.attempt(&r.id))).await;

        let mut last_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(outcome) => report.tally(outcome),
                Err(e) => {
                    warn!(error = %e, "Sync attempt aborted");
                    report.skipped += 1;
                    last_error = Some(e.to_string());
                }
            }
        }

        {
            let mut state = self.state.write().await;
            state.last_run_at = Some(Utc::now());
            if last_error.is_some() {
                state.last_error = last_error;
            } else if report.has_work() && report.failed == 0 && report.exhausted == 0 {
                state.last_error = None;
            }
        }

        if report.has_work() {
            info!(
                attempted = report.attempted,
                synced = report.synced,
                failed = report.failed,
                exhausted = report.exhausted,
                skipped = report.skipped,
                "Sync pass complete"
            );
        }
        Ok(report)
    }

    fn claim(&self, id: &str) -> Option<InFlight<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(id.to_string()) {
            return None;
        }
        Some(InFlight {
            set: &self.in_flight,
            id: id.to_string(),
        })
    }

    /// Attempts one record. A second call for an id already in flight
    /// returns [`AttemptOutcome::InFlight`] without touching anything.
    pub async fn attempt(&self, id: &str) -> SyncResult<AttemptOutcome> {
        let Some(_guard) = self.claim(id) else {
            debug!(sale_id = %id, "Sale already syncing, skipping");
            return Ok(AttemptOutcome::InFlight);
        };

        let Some(record) = self.ledger.get(id).await else {
            return Ok(AttemptOutcome::Skipped);
        };
        if record.sync_state != SyncState::Pending {
            return Ok(AttemptOutcome::Skipped);
        }
        // Direct callers bypass the pass-level due filter
        if !self.options.retry.is_due(&record, Utc::now()) {
            debug!(sale_id = %id, attempts = record.attempts, "Backoff not elapsed, skipping");
            return Ok(AttemptOutcome::Skipped);
        }
        if record.attempts >= self.options.max_attempts {
            // max_attempts lowered since this record last ran
            self.settle(id, self.exhaust_patch(&record, record.attempts, None)).await;
            return Ok(AttemptOutcome::Exhausted);
        }

        self.ledger
            .update(id, SalePatch::state(SyncState::Syncing).last_attempt_at(Utc::now()))
            .await?;

        let result = match timeout(self.options.commit_timeout, self.remote.commit(id, &record.payload)).await {
            Ok(result) => result,
            Err(_) => Err(CommitError::timeout(self.options.commit_timeout)),
        };

        match result {
            Ok(receipt) => {
                self.complete(&record, receipt).await;
                Ok(AttemptOutcome::Synced(receipt))
            }
            Err(err) => Ok(self.fail(&record, err).await),
        }
    }

    async fn complete(&self, record: &SaleRecord, receipt: CommitReceipt) {
        if self.options.retain_synced {
            let patch = SalePatch::state(SyncState::Synced)
                .attempts(record.attempts + 1)
                .clear_error();
            self.settle(&record.id, patch).await;
        } else if let Err(e) = self.ledger.remove(&record.id).await {
            error!(sale_id = %record.id, error = %e, "Synced sale could not be removed from ledger");
            self.settle(&record.id, SalePatch::state(SyncState::Pending)).await;
        }

        info!(
            sale_id = %record.id,
            sale_number = %record.payload.sale_number,
            receipt = %receipt,
            "Sale synced"
        );

        if let Err(e) = self.hooks.on_sale_committed(record, &receipt).await {
            debug!(sale_id = %record.id, error = %e, "on_sale_committed hook failed");
        }
    }

    async fn fail(&self, record: &SaleRecord, err: CommitError) -> AttemptOutcome {
        let attempts = record.attempts + 1;
        let class = err.failure_class();

        if attempts >= self.options.max_attempts {
            self.settle(&record.id, self.exhaust_patch(record, attempts, Some(&err))).await;
            return AttemptOutcome::Exhausted;
        }

        let mut patch = SalePatch::state(SyncState::Pending)
            .attempts(attempts)
            .last_error(err.to_string())
            .failure_class(class);

        match class {
            FailureClass::Fatal if !record.error_logged => {
                error!(
                    sale_id = %record.id,
                    attempts,
                    kind = %err.kind,
                    error = %err.message,
                    "Sale rejected by remote ledger, will retry"
                );
                patch = patch.error_logged(true);
            }
            _ => debug!(
                sale_id = %record.id,
                attempts,
                kind = %err.kind,
                error = %err.message,
                "Sale sync failed, will retry"
            ),
        }

        self.settle(&record.id, patch).await;
        AttemptOutcome::Retrying(class)
    }

    /// Patch moving a record to `Failed`, logging it if nothing was
    /// logged for it yet.
    fn exhaust_patch(&self, record: &SaleRecord, attempts: u32, err: Option<&CommitError>) -> SalePatch {
        let mut patch = SalePatch::state(SyncState::Failed)
            .attempts(attempts)
            .error_logged(true);
        if let Some(err) = err {
            patch = patch.last_error(err.to_string()).failure_class(err.failure_class());
        }

        let last_error = err
            .map(|e| e.to_string())
            .or_else(|| record.last_error.clone())
            .unwrap_or_default();

        if record.error_logged {
            debug!(sale_id = %record.id, attempts, "Sale sync failed permanently");
        } else {
            error!(
                sale_id = %record.id,
                sale_number = %record.payload.sale_number,
                attempts,
                error = %last_error,
                "Sale sync failed permanently"
            );
        }
        patch
    }

    /// Applies a final patch. A record that vanished meanwhile (cleared,
    /// evicted) is not an error; a failed write is retried as a plain
    /// reset to `Pending` so nothing stays `Syncing`.
    async fn settle(&self, id: &str, patch: SalePatch) {
        match self.ledger.update(id, patch).await {
            Ok(_) => {}
            Err(SyncError::Ledger(crate::error::LedgerError::NotFound(_))) => {
                debug!(sale_id = %id, "Sale left the ledger during sync");
            }
            Err(e) => {
                error!(sale_id = %id, error = %e, "Could not record sync result");
                if let Err(e) = self.ledger.update(id, SalePatch::state(SyncState::Pending)).await {
                    error!(sale_id = %id, error = %e, "Could not reset sale to pending");
                }
            }
        }
    }

    // =========================================================================
    // Operator Actions and Status
    // =========================================================================

    /// Puts a terminally `Failed` record back in the queue with a clean slate.
    ///
    /// Returns `false` if the record is not `Failed`.
    pub async fn retry_failed(&self, id: &str) -> SyncResult<bool> {
        match self.ledger.get(id).await {
            Some(record) if record.sync_state == SyncState::Failed => {}
            _ => return Ok(false),
        }

        let patch = SalePatch::state(SyncState::Pending)
            .attempts(0)
            .clear_error()
            .error_logged(false);
        self.ledger.update(id, patch).await?;
        info!(sale_id = %id, "Failed sale queued for retry");
        Ok(true)
    }

    /// True while an attempt on `id` is running on this device.
    pub fn is_syncing(&self, id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }

    pub async fn is_running(&self) -> bool {
        self.state.read().await.running
    }

    pub async fn status(&self) -> SyncStatus {
        let state = self.state.read().await;
        SyncStatus {
            online: self.connectivity.is_online(),
            running: state.running,
            pending_count: self.ledger.pending_count().await,
            in_flight: self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len(),
            last_run_at: state.last_run_at,
            last_error: state.last_error.clone(),
        }
    }
}
