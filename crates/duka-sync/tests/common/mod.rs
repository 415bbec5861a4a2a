//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use duka_core::retention::RetentionPolicy;
use duka_core::{
    CustomerAggregate, FinanceAccount, LineItem, Money, NewStockMovement, PaymentLeg,
    ProductVariant, SalePayload, StockMovement,
};
use duka_db::{Database, DbConfig};
use duka_sync::{
    CommitError, CommitReceipt, ConnectivityMonitor, FinanceStore, LocalSaleLedger,
    MemoryLedgerStore, MovementLedger, QuotaGovernor, RemoteSaleProcessor, RetryPolicy,
    SaleStore, SchedulerOptions, SqliteRemoteLedger, SyncError, SyncResult, SyncScheduler,
};

// =============================================================================
// Remote Ledger
// =============================================================================

pub const RICE: &str = "v-rice";
pub const OIL: &str = "v-oil";
pub const CASH: &str = "acc-cash";
pub const MPESA: &str = "acc-mpesa";
pub const CUSTOMER: &str = "cust-1";

/// Remote ledger with rice at 10, oil at 20, two empty accounts and one
/// customer with no history.
pub async fn remote() -> Arc<SqliteRemoteLedger> {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    seed(&db).await;
    Arc::new(SqliteRemoteLedger::new(db))
}

pub async fn seed(db: &Database) {
    for (id, quantity) in [(RICE, 10), (OIL, 20)] {
        db.inventory()
            .insert_variant(&ProductVariant {
                id: id.into(),
                product_id: product_of(id),
                sku: id.to_uppercase(),
                name: id.into(),
                quantity,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
    }
    for id in [CASH, MPESA] {
        db.finance()
            .insert_account(&FinanceAccount {
                id: id.into(),
                name: id.into(),
                balance: 0,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
    }
    db.customers()
        .insert(&CustomerAggregate {
            id: CUSTOMER.into(),
            name: "Wanjiru".into(),
            total_spent: 0,
            loyalty_points: 0,
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
}

fn product_of(variant: &str) -> String {
    format!("p-{}", variant.trim_start_matches("v-"))
}

// =============================================================================
// Payloads
// =============================================================================

pub fn line(variant: &str, quantity: i64, unit_price: i64) -> LineItem {
    LineItem {
        id: uuid::Uuid::new_v4().to_string(),
        product_id: product_of(variant),
        variant_id: Some(variant.into()),
        sku: variant.to_uppercase(),
        name: variant.into(),
        quantity,
        unit_price: Money::new(unit_price),
        line_total: Money::new(unit_price * quantity),
    }
}

pub fn payload(sale_number: &str, items: Vec<LineItem>, payments: &[(&str, i64)]) -> SalePayload {
    let total: Money = items.iter().map(|i| i.line_total).sum();
    SalePayload {
        sale_number: sale_number.into(),
        customer_id: Some(CUSTOMER.into()),
        items,
        subtotal: total,
        tax: Money::zero(),
        discount: Money::zero(),
        total,
        payments: payments
            .iter()
            .map(|(account, amount)| PaymentLeg {
                account_id: (*account).into(),
                method: if *account == MPESA { "mpesa" } else { "cash" }.into(),
                amount: Money::new(*amount),
            })
            .collect(),
        sold_by: "cashier-1".into(),
        sold_at: Utc::now(),
        notes: None,
    }
}

/// One rice line paid in cash.
pub fn rice_sale(sale_number: &str, quantity: i64) -> SalePayload {
    payload(sale_number, vec![line(RICE, quantity, 1_000)], &[(CASH, 1_000 * quantity)])
}

// =============================================================================
// Device Side
// =============================================================================

pub async fn memory_ledger() -> Arc<LocalSaleLedger> {
    ledger_over(Arc::new(MemoryLedgerStore::new()), RetentionPolicy::default(), usize::MAX).await
}

pub async fn ledger_over(
    store: Arc<MemoryLedgerStore>,
    policy: RetentionPolicy,
    budget: usize,
) -> Arc<LocalSaleLedger> {
    let governor = Arc::new(QuotaGovernor::new(policy, budget, Duration::from_secs(300)));
    Arc::new(LocalSaleLedger::init(store, governor).await.unwrap())
}

/// Options for fast tests: no backoff, short settle, short timeout.
pub fn fast_options() -> SchedulerOptions {
    SchedulerOptions {
        enabled: true,
        interval: Duration::from_secs(3600),
        settle_delay: Duration::from_millis(10),
        commit_timeout: Duration::from_secs(5),
        max_attempts: 3,
        retry: RetryPolicy::immediate(),
        retain_synced: false,
    }
}

pub fn scheduler(
    ledger: Arc<LocalSaleLedger>,
    remote: Arc<dyn RemoteSaleProcessor>,
    online: bool,
) -> Arc<SyncScheduler> {
    Arc::new(SyncScheduler::new(
        ledger,
        remote,
        ConnectivityMonitor::new(online),
        fast_options(),
    ))
}

/// Waits up to five seconds for the ledger to drain.
pub async fn drained(ledger: &LocalSaleLedger) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if ledger.is_empty().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Waits up to five seconds for an attempt on `sale_id` to start.
pub async fn syncing(scheduler: &SyncScheduler, sale_id: &str) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if scheduler.is_syncing(sale_id) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

// =============================================================================
// Scripted Remotes
// =============================================================================

/// What a scripted commit does before (or instead of) reaching the ledger.
#[derive(Debug, Clone)]
pub enum Script {
    /// Fail without touching the ledger.
    Fail(CommitError),
    /// Commit, then report failure as if the answer was lost.
    CommitThenFail(CommitError),
    /// Sleep, then commit.
    Delay(Duration),
}

/// Remote that plays queued scripts before delegating to the real ledger.
pub struct ScriptedRemote {
    inner: Arc<SqliteRemoteLedger>,
    scripts: Mutex<VecDeque<Script>>,
    fallback: Option<Script>,
    calls: AtomicUsize,
}

impl ScriptedRemote {
    pub fn new(inner: Arc<SqliteRemoteLedger>) -> Self {
        ScriptedRemote {
            inner,
            scripts: Mutex::new(VecDeque::new()),
            fallback: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Plays `script` on every call once the queue is empty.
    pub fn always(mut self, script: Script) -> Self {
        self.fallback = Some(script);
        self
    }

    /// Plays `script` on the next call, after anything queued earlier.
    pub fn queue(mut self, script: Script) -> Self {
        self.scripts.get_mut().push_back(script);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteSaleProcessor for ScriptedRemote {
    async fn commit(&self, sale_id: &str, payload: &SalePayload) -> Result<CommitReceipt, CommitError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().await.pop_front().or_else(|| self.fallback.clone());
        match script {
            None => self.inner.commit(sale_id, payload).await,
            Some(Script::Fail(err)) => Err(err),
            Some(Script::CommitThenFail(err)) => {
                self.inner.commit(sale_id, payload).await?;
                Err(err)
            }
            Some(Script::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                self.inner.commit(sale_id, payload).await
            }
        }
    }
}

/// Movement ledger with lookups hidden or writes failing on demand.
pub struct ScriptedMovements {
    pub inner: Arc<SqliteRemoteLedger>,
    pub hide_reference_id: bool,
    pub hide_reference_text: bool,
    pub hide_history: bool,
    pub fail_append: bool,
    pub fail_direct_write: bool,
    /// Any batch touching this variant is rejected whole.
    pub fail_variant: Option<String>,
}

impl ScriptedMovements {
    pub fn new(inner: Arc<SqliteRemoteLedger>) -> Self {
        ScriptedMovements {
            inner,
            hide_reference_id: false,
            hide_reference_text: false,
            hide_history: false,
            fail_append: false,
            fail_direct_write: false,
            fail_variant: None,
        }
    }
}

fn injected(what: &str) -> SyncError {
    SyncError::DatabaseError(format!("injected {} failure", what))
}

#[async_trait]
impl MovementLedger for ScriptedMovements {
    async fn find_out_by_reference_id(
        &self,
        variant_id: &str,
        sale_id: &str,
    ) -> SyncResult<Option<StockMovement>> {
        if self.hide_reference_id {
            return Ok(None);
        }
        self.inner.find_out_by_reference_id(variant_id, sale_id).await
    }

    async fn find_out_by_reference_text(
        &self,
        variant_id: &str,
        needle: &str,
    ) -> SyncResult<Option<StockMovement>> {
        if self.hide_reference_text {
            return Ok(None);
        }
        self.inner.find_out_by_reference_text(variant_id, needle).await
    }

    async fn out_movements(&self, variant_id: &str) -> SyncResult<Vec<StockMovement>> {
        if self.hide_history {
            return Ok(Vec::new());
        }
        self.inner.out_movements(variant_id).await
    }

    async fn current_quantity(&self, variant_id: &str) -> SyncResult<i64> {
        self.inner.current_quantity(variant_id).await
    }

    async fn append_movements(&self, movements: &[NewStockMovement]) -> SyncResult<Vec<StockMovement>> {
        if self.fail_append || movements.iter().any(|m| self.fails(&m.variant_id)) {
            return Err(injected("movement insert"));
        }
        self.inner.append_movements(movements).await
    }

    async fn set_quantities(&self, targets: &[(String, i64)]) -> SyncResult<()> {
        if self.fail_direct_write || targets.iter().any(|(id, _)| self.fails(id)) {
            return Err(injected("quantity write"));
        }
        self.inner.set_quantities(targets).await
    }
}

impl ScriptedMovements {
    fn fails(&self, variant_id: &str) -> bool {
        self.fail_variant.as_deref() == Some(variant_id)
    }
}

/// Sale store whose next `mark_sale_reversed` calls fail, as if the
/// connection dropped after stock and payments were already reversed.
pub struct FlakySales {
    pub inner: Arc<SqliteRemoteLedger>,
    failures: AtomicUsize,
}

impl FlakySales {
    pub fn failing_marks(inner: Arc<SqliteRemoteLedger>, failures: usize) -> Self {
        FlakySales {
            inner,
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl SaleStore for FlakySales {
    async fn load_sale(
        &self,
        sale_id: &str,
    ) -> SyncResult<Option<(duka_core::RemoteSale, Vec<duka_core::RemoteSaleItem>)>> {
        self.inner.load_sale(sale_id).await
    }

    async fn claim_sale_for_reversal(&self, sale_id: &str, at: DateTime<Utc>) -> SyncResult<bool> {
        self.inner.claim_sale_for_reversal(sale_id, at).await
    }

    async fn release_sale_reversal(&self, sale_id: &str, at: DateTime<Utc>) -> SyncResult<bool> {
        self.inner.release_sale_reversal(sale_id, at).await
    }

    async fn mark_sale_reversed(&self, sale_id: &str, notes: &str, at: DateTime<Utc>) -> SyncResult<bool> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(injected("sale status write"));
        }
        self.inner.mark_sale_reversed(sale_id, notes, at).await
    }
}

/// Finance store whose balance adjustments fail for one account.
pub struct FailingFinance {
    pub inner: Arc<SqliteRemoteLedger>,
    pub failing_account: String,
}

#[async_trait]
impl FinanceStore for FailingFinance {
    async fn transactions_for_sale(&self, sale_id: &str) -> SyncResult<Vec<duka_core::AccountTransaction>> {
        self.inner.transactions_for_sale(sale_id).await
    }

    async fn balance(&self, account_id: &str) -> SyncResult<Money> {
        self.inner.balance(account_id).await
    }

    async fn adjust_balance(&self, account_id: &str, delta: Money) -> SyncResult<Money> {
        if account_id == self.failing_account {
            return Err(injected("balance adjustment"));
        }
        self.inner.adjust_balance(account_id, delta).await
    }

    async fn mark_transaction_reversed(
        &self,
        transaction_id: &str,
        at: DateTime<Utc>,
        by: &str,
        reason: &str,
    ) -> SyncResult<bool> {
        self.inner.mark_transaction_reversed(transaction_id, at, by, reason).await
    }
}
