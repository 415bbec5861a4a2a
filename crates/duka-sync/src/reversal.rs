//! # Reversal Engine
//!
//! Undoes a committed sale on the remote ledger. The movement ledger is the
//! only source of truth for what stock looked like before the sale.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  reverse(sale_id, by, reason)                                           │
//! │                                                                         │
//! │  GUARDS (no writes)                                                     │
//! │    mid-sync on this device?   ──► MidSync                               │
//! │    sale missing?              ──► NotFound                              │
//! │    already reversed?          ──► AlreadyReversed                       │
//! │    claimed by a reversal?     ──► InProgress                            │
//! │    no line items?             ──► NoItems                               │
//! │                                                                         │
//! │  PLAN (reads only)                                                      │
//! │    group items by variant                                               │
//! │    per variant: reference_id ─► reference text ─► timestamp ─► degraded │
//! │                                                                         │
//! │  CLAIM   completed ─► reversing             lost race ──► Conflict      │
//! │                                                                         │
//! │  APPLY                                                                  │
//! │    stock      one batch of in-movements  failure ──► release, abort     │
//! │    payments   one net adjust / account   failure ──► warn, continue     │
//! │    customer   total_spent, points        failure ──► warn, continue     │
//! │    sale       reversing ─► reversed      lost race ──► Conflict         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every plan is computed before the first stock row is written, and the
//! stock rows for all variants land in one batch, so a failed lookup or a
//! failed write leaves stock untouched and the sale `completed`.
//!
//! Once stock is restored the sale stays `reversing` until it is marked
//! `reversed`. A reversal that dies in between cannot be retried into a
//! second customer or payment rollback: the retry stops at `InProgress`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::hooks::{NoOpHooks, SaleEventHooks};
use crate::remote::{CustomerStore, FinanceStore, MovementLedger, SaleStore};
use crate::scheduler::SyncScheduler;
use duka_core::reversal::{
    group_by_variant, net_by_account, restore_movement_note, reversal_note, rollback_customer,
    sale_reference_needles, select_by_timestamp, Baseline, MovementLookup, RestorePlan,
    VariantGroup,
};
use duka_core::{RemoteSale, StockMovement, SyncState};

use crate::error::ReversalError;

/// Default window after the sale time in which a stock-out row still counts.
pub const DEFAULT_TIMESTAMP_TOLERANCE_SECS: i64 = 60;

// =============================================================================
// Report
// =============================================================================

/// How one variant's stock was put back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum RestoreMethod {
    /// A compensating `in` movement was appended.
    Movement { movement_id: String },
    /// The movement insert failed; the quantity was written directly.
    DirectWrite,
    /// Stock was already at or above the target.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantRestoreReport {
    pub variant_id: String,
    pub sold_quantity: i64,
    pub previous_quantity: i64,
    pub restored_to: i64,
    pub delta: i64,
    /// `None` for a degraded restore.
    pub strategy: Option<MovementLookup>,
    pub method: RestoreMethod,
}

/// Summary of a completed reversal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReversalReport {
    pub sale_id: String,
    pub sale_number: String,
    /// Line items with a variant.
    pub items_restored: usize,
    /// Variants that received stock back.
    pub variants_restored: usize,
    pub transactions_reversed: usize,
    pub accounts_adjusted: usize,
    /// Variants restored without a baseline movement.
    pub degraded_variants: Vec<String>,
    pub customer_rolled_back: bool,
    pub restores: Vec<VariantRestoreReport>,
}

impl ReversalReport {
    pub fn is_degraded(&self) -> bool {
        !self.degraded_variants.is_empty()
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Reverses committed sales.
///
/// ## Usage
/// ```rust,ignore
/// let remote = Arc::new(SqliteRemoteLedger::new(db));
/// let engine = ReversalEngine::over(remote).with_scheduler(scheduler.clone());
///
/// let report = engine.reverse(&sale_id, "manager-1", "Customer returned goods").await?;
/// ```
pub struct ReversalEngine {
    sales: Arc<dyn SaleStore>,
    movements: Arc<dyn MovementLedger>,
    finance: Arc<dyn FinanceStore>,
    customers: Arc<dyn CustomerStore>,
    hooks: Arc<dyn SaleEventHooks>,
    scheduler: Option<Arc<SyncScheduler>>,
    tolerance: Duration,
}

impl ReversalEngine {
    pub fn new(
        sales: Arc<dyn SaleStore>,
        movements: Arc<dyn MovementLedger>,
        finance: Arc<dyn FinanceStore>,
        customers: Arc<dyn CustomerStore>,
    ) -> Self {
        ReversalEngine {
            sales,
            movements,
            finance,
            customers,
            hooks: Arc::new(NoOpHooks),
            scheduler: None,
            tolerance: Duration::seconds(DEFAULT_TIMESTAMP_TOLERANCE_SECS),
        }
    }

    /// Engine over one backend implementing every store.
    pub fn over<T>(remote: Arc<T>) -> Self
    where
        T: SaleStore + MovementLedger + FinanceStore + CustomerStore + 'static,
    {
        ReversalEngine::new(remote.clone(), remote.clone(), remote.clone(), remote)
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn SaleEventHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Lets the engine refuse sales this device is still syncing.
    pub fn with_scheduler(mut self, scheduler: Arc<SyncScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_timestamp_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    // =========================================================================
    // Reverse
    // =========================================================================

    pub async fn reverse(
        &self,
        sale_id: &str,
        reversed_by: &str,
        reason: &str,
    ) -> Result<ReversalReport, ReversalError> {
        if self.is_mid_sync(sale_id).await {
            return Err(ReversalError::MidSync(sale_id.to_string()));
        }

        let (sale, items) = self
            .sales
            .load_sale(sale_id)
            .await?
            .ok_or_else(|| ReversalError::NotFound(sale_id.to_string()))?;
        if sale.is_reversed() {
            return Err(ReversalError::AlreadyReversed(sale_id.to_string()));
        }
        if sale.is_reversing() {
            return Err(ReversalError::InProgress(sale_id.to_string()));
        }
        if items.is_empty() {
            return Err(ReversalError::NoItems(sale_id.to_string()));
        }

        let grouping = group_by_variant(&items);
        for item_id in &grouping.skipped {
            warn!(sale_id = %sale_id, item_id = %item_id, "Line item has no variant, stock not restored");
        }

        let mut plans = Vec::with_capacity(grouping.groups.len());
        for group in &grouping.groups {
            plans.push(self.plan_variant(&sale, group).await?);
        }

        let now = Utc::now();
        if !self.sales.claim_sale_for_reversal(sale_id, now).await? {
            return Err(ReversalError::Conflict {
                sale_id: sale_id.to_string(),
                reason: "sale was no longer completed when claiming it".into(),
            });
        }

        let mut report = ReversalReport {
            sale_id: sale.id.clone(),
            sale_number: sale.sale_number.clone(),
            items_restored: grouping.groups.iter().map(|g| g.item_count).sum(),
            ..Default::default()
        };

        // Stock
        let restores = match self.restore_stock(&sale, &plans, now).await {
            Ok(restores) => restores,
            Err(e) => {
                self.release_claim(sale_id).await;
                return Err(e);
            }
        };
        for (plan, restore) in plans.iter().zip(restores) {
            if restore.method != RestoreMethod::Skipped {
                report.variants_restored += 1;
            }
            if plan.is_degraded() {
                report.degraded_variants.push(plan.variant_id.clone());
            }
            report.restores.push(restore);
        }

        // Payments
        let (transactions, accounts) = self.reverse_payments(&sale, now, reversed_by, reason).await;
        report.transactions_reversed = transactions;
        report.accounts_adjusted = accounts;

        // Customer
        report.customer_rolled_back = self.rollback_customer(&sale).await;

        // Sale
        let notes = reversal_note(sale.notes.as_deref(), now, reversed_by, reason);
        if !self.sales.mark_sale_reversed(sale_id, &notes, now).await? {
            return Err(ReversalError::Conflict {
                sale_id: sale_id.to_string(),
                reason: "sale was no longer claimed when marking it reversed".into(),
            });
        }

        info!(
            sale_id = %sale_id,
            sale_number = %sale.sale_number,
            reversed_by,
            variants = report.variants_restored,
            transactions = report.transactions_reversed,
            degraded = report.degraded_variants.len(),
            "Sale reversed"
        );

        if let Err(e) = self.hooks.on_sale_reversed(&sale, &report).await {
            debug!(sale_id = %sale_id, error = %e, "on_sale_reversed hook failed");
        }

        Ok(report)
    }

    async fn release_claim(&self, sale_id: &str) {
        match self.sales.release_sale_reversal(sale_id, Utc::now()).await {
            Ok(true) => debug!(sale_id = %sale_id, "Reversal claim released"),
            Ok(false) => warn!(sale_id = %sale_id, "Reversal claim was already gone"),
            Err(e) => warn!(sale_id = %sale_id, error = %e, "Could not release reversal claim"),
        }
    }

    async fn is_mid_sync(&self, sale_id: &str) -> bool {
        let Some(scheduler) = &self.scheduler else {
            return false;
        };
        if scheduler.is_syncing(sale_id) {
            return true;
        }
        matches!(
            scheduler.ledger().get(sale_id).await,
            Some(record) if record.sync_state == SyncState::Syncing
        )
    }

    // =========================================================================
    // Stock
    // =========================================================================

    async fn plan_variant(&self, sale: &RemoteSale, group: &VariantGroup) -> Result<RestorePlan, ReversalError> {
        let current = self
            .movements
            .current_quantity(&group.variant_id)
            .await
            .map_err(|e| restore_failed(&group.variant_id, e))?;

        match self.locate_movement(sale, &group.variant_id).await? {
            Some((movement, strategy)) => {
                debug!(
                    sale_id = %sale.id,
                    variant_id = %group.variant_id,
                    %strategy,
                    baseline = movement.previous_quantity,
                    "Baseline movement found"
                );
                Ok(RestorePlan::from_movement(group, current, &movement, strategy))
            }
            None => {
                warn!(
                    sale_id = %sale.id,
                    variant_id = %group.variant_id,
                    current,
                    sold = group.quantity,
                    "No stock-out movement found for sale, restoring current + sold"
                );
                Ok(RestorePlan::degraded(group, current))
            }
        }
    }

    /// Tries each lookup in order; the first hit wins.
    async fn locate_movement(
        &self,
        sale: &RemoteSale,
        variant_id: &str,
    ) -> Result<Option<(StockMovement, MovementLookup)>, ReversalError> {
        for strategy in MovementLookup::ORDERED {
            let found = match strategy {
                MovementLookup::ReferenceId => self
                    .movements
                    .find_out_by_reference_id(variant_id, &sale.id)
                    .await
                    .map_err(|e| restore_failed(variant_id, e))?,
                MovementLookup::ReferenceText => {
                    let mut found = None;
                    for needle in sale_reference_needles(&sale.id) {
                        found = self
                            .movements
                            .find_out_by_reference_text(variant_id, &needle)
                            .await
                            .map_err(|e| restore_failed(variant_id, e))?;
                        if found.is_some() {
                            break;
                        }
                    }
                    found
                }
                MovementLookup::Timestamp => {
                    let movements = self
                        .movements
                        .out_movements(variant_id)
                        .await
                        .map_err(|e| restore_failed(variant_id, e))?;
                    select_by_timestamp(&movements, sale.created_at, self.tolerance).cloned()
                }
            };

            if let Some(movement) = found {
                return Ok(Some((movement, strategy)));
            }
        }
        Ok(None)
    }

    /// Writes every compensating movement in one batch. If the batch is
    /// rejected, every target quantity is written directly in one batch
    /// instead. Either way, all variants move or none do.
    async fn restore_stock(
        &self,
        sale: &RemoteSale,
        plans: &[RestorePlan],
        at: DateTime<Utc>,
    ) -> Result<Vec<VariantRestoreReport>, ReversalError> {
        let reference = format!("Reversal {}", sale.sale_number);
        let mut restores = Vec::with_capacity(plans.len());
        let mut movements = Vec::new();
        let mut moved = Vec::new();

        for (index, plan) in plans.iter().enumerate() {
            let strategy = match &plan.baseline {
                Baseline::Movement { strategy, .. } => Some(*strategy),
                Baseline::Degraded => None,
            };
            restores.push(VariantRestoreReport {
                variant_id: plan.variant_id.clone(),
                sold_quantity: plan.sold_quantity,
                previous_quantity: plan.current_quantity,
                restored_to: plan.current_quantity,
                delta: 0,
                strategy,
                method: RestoreMethod::Skipped,
            });

            let notes = restore_movement_note(&sale.sale_number, plan);
            match plan.compensating_movement(&sale.id, &reference, &notes, at) {
                Some(movement) => {
                    movements.push(movement);
                    moved.push(index);
                }
                None => info!(
                    sale_id = %sale.id,
                    variant_id = %plan.variant_id,
                    current = plan.current_quantity,
                    target = plan.target_quantity,
                    "Stock already at or above baseline, nothing to restore"
                ),
            }
        }

        if movements.is_empty() {
            return Ok(restores);
        }

        let methods: Vec<RestoreMethod> = match self.movements.append_movements(&movements).await {
            Ok(rows) => rows
                .into_iter()
                .map(|row| RestoreMethod::Movement { movement_id: row.id })
                .collect(),
            Err(e) => {
                warn!(
                    sale_id = %sale.id,
                    variants = movements.len(),
                    error = %e,
                    "Compensating movements failed, writing quantities directly"
                );
                let targets: Vec<(String, i64)> = moved
                    .iter()
                    .map(|&index| (plans[index].variant_id.clone(), plans[index].target_quantity))
                    .collect();
                if let Err(e) = self.movements.set_quantities(&targets).await {
                    let variants: Vec<&str> = targets.iter().map(|(id, _)| id.as_str()).collect();
                    return Err(restore_failed(&variants.join(", "), e));
                }
                vec![RestoreMethod::DirectWrite; moved.len()]
            }
        };

        for (&index, method) in moved.iter().zip(methods) {
            let plan = &plans[index];
            let restore = &mut restores[index];
            restore.method = method;
            restore.restored_to = plan.target_quantity;
            restore.delta = plan.delta();
        }
        Ok(restores)
    }

    // =========================================================================
    // Payments and Customer
    // =========================================================================

    /// Returns (transactions marked reversed, accounts adjusted).
    async fn reverse_payments(
        &self,
        sale: &RemoteSale,
        at: DateTime<Utc>,
        by: &str,
        reason: &str,
    ) -> (usize, usize) {
        let transactions = match self.finance.transactions_for_sale(&sale.id).await {
            Ok(transactions) => transactions,
            Err(e) => {
                warn!(sale_id = %sale.id, error = %e, "Could not load sale transactions, payments not reversed");
                return (0, 0);
            }
        };

        let netting = net_by_account(&transactions);
        if netting.is_empty() {
            debug!(sale_id = %sale.id, "No open transactions to reverse");
            return (0, 0);
        }

        let mut reversed = 0;
        let mut adjusted = 0;
        for (account_id, net) in &netting.per_account {
            if let Err(e) = self.finance.adjust_balance(account_id, -*net).await {
                warn!(
                    sale_id = %sale.id,
                    account_id = %account_id,
                    amount = %net,
                    error = %e,
                    "Account balance adjustment failed"
                );
                continue;
            }
            adjusted += 1;

            let open = transactions
                .iter()
                .filter(|tx| !tx.is_reversed() && &tx.account_id == account_id);
            for tx in open {
                match self.finance.mark_transaction_reversed(&tx.id, at, by, reason).await {
                    Ok(true) => reversed += 1,
                    Ok(false) => debug!(transaction_id = %tx.id, "Transaction already marked reversed"),
                    Err(e) => warn!(transaction_id = %tx.id, error = %e, "Could not mark transaction reversed"),
                }
            }
        }
        (reversed, adjusted)
    }

    async fn rollback_customer(&self, sale: &RemoteSale) -> bool {
        let Some(customer_id) = sale.customer_id.as_deref() else {
            return false;
        };

        let customer = match self.customers.get_customer(customer_id).await {
            Ok(Some(customer)) => customer,
            Ok(None) => {
                debug!(customer_id = %customer_id, "Customer gone, aggregate not rolled back");
                return false;
            }
            Err(e) => {
                warn!(customer_id = %customer_id, error = %e, "Could not load customer");
                return false;
            }
        };

        let rollback = rollback_customer(&customer, sale.total());
        match self
            .customers
            .set_customer_totals(customer_id, rollback.total_spent, rollback.loyalty_points)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(customer_id = %customer_id, error = %e, "Customer rollback failed");
                false
            }
        }
    }
}

fn restore_failed(variant_id: &str, err: impl std::fmt::Display) -> ReversalError {
    ReversalError::StockRestoreFailed {
        variant_id: variant_id.to_string(),
        reason: err.to_string(),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{RemoteSaleProcessor, SqliteRemoteLedger};
    use duka_core::{
        CustomerAggregate, FinanceAccount, LineItem, Money, PaymentLeg, ProductVariant, SalePayload,
    };
    use duka_db::{Database, DbConfig};

    async fn remote() -> Arc<SqliteRemoteLedger> {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        for (id, qty) in [("v-rice", 10), ("v-oil", 20)] {
            db.inventory()
                .insert_variant(&ProductVariant {
                    id: id.into(),
                    product_id: format!("p-{}", id),
                    sku: id.to_uppercase(),
                    name: id.into(),
                    quantity: qty,
                    updated_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        for id in ["acc-cash", "acc-mpesa"] {
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
                id: "cust-1".into(),
                name: "Amina".into(),
                total_spent: 0,
                loyalty_points: 0,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        Arc::new(SqliteRemoteLedger::new(db))
    }

    fn line(variant: &str, qty: i64, price: i64) -> LineItem {
        LineItem {
            id: uuid::Uuid::new_v4().to_string(),
            product_id: format!("p-{}", variant),
            variant_id: Some(variant.into()),
            sku: variant.to_uppercase(),
            name: variant.into(),
            quantity: qty,
            unit_price: Money::new(price),
            line_total: Money::new(price * qty),
        }
    }

    fn sale(number: &str, items: Vec<LineItem>, payments: Vec<(&str, i64)>) -> SalePayload {
        let total: Money = items.iter().map(|i| i.line_total).sum();
        SalePayload {
            sale_number: number.into(),
            customer_id: Some("cust-1".into()),
            items,
            subtotal: total,
            tax: Money::zero(),
            discount: Money::zero(),
            total,
            payments: payments
                .into_iter()
                .map(|(account, amount)| PaymentLeg {
                    account_id: account.into(),
                    method: "cash".into(),
                    amount: Money::new(amount),
                })
                .collect(),
            sold_by: "cashier-1".into(),
            sold_at: Utc::now(),
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_reverse_restores_everything() {
        let remote = remote().await;
        let payload = sale(
            "S-0001",
            vec![line("v-rice", 2, 1_000), line("v-rice", 3, 1_000)],
            vec![("acc-cash", 3_000), ("acc-cash", 2_000)],
        );
        remote.commit("sale-a", &payload).await.unwrap();
        assert_eq!(remote.current_quantity("v-rice").await.unwrap(), 5);

        let engine = ReversalEngine::over(remote.clone());
        let report = engine.reverse("sale-a", "manager-1", "Wrong item").await.unwrap();

        assert_eq!(report.items_restored, 2);
        assert_eq!(report.variants_restored, 1);
        assert_eq!(report.accounts_adjusted, 1);
        assert_eq!(report.transactions_reversed, 2);
        assert!(report.customer_rolled_back);
        assert!(!report.is_degraded());
        assert_eq!(report.restores[0].delta, 5);
        assert_eq!(report.restores[0].strategy, Some(MovementLookup::ReferenceId));

        assert_eq!(remote.current_quantity("v-rice").await.unwrap(), 10);
        assert_eq!(remote.balance("acc-cash").await.unwrap(), Money::zero());
        let customer = remote.get_customer("cust-1").await.unwrap().unwrap();
        assert_eq!(customer.total_spent, 0);
        assert_eq!(customer.loyalty_points, 0);

        let (sale, _) = remote.load_sale("sale-a").await.unwrap().unwrap();
        assert!(sale.is_reversed());
        assert!(sale.notes.unwrap().contains("[REVERSED]"));
    }

    #[tokio::test]
    async fn test_second_reversal_is_rejected_without_changes() {
        let remote = remote().await;
        remote
            .commit("sale-a", &sale("S-0001", vec![line("v-oil", 4, 500)], vec![("acc-cash", 2_000)]))
            .await
            .unwrap();

        let engine = ReversalEngine::over(remote.clone());
        engine.reverse("sale-a", "m", "r").await.unwrap();
        let movements_after_first = remote.out_movements("v-oil").await.unwrap().len();

        let err = engine.reverse("sale-a", "m", "r").await.unwrap_err();
        assert!(matches!(err, ReversalError::AlreadyReversed(_)));
        assert!(err.is_conflict());
        assert_eq!(remote.current_quantity("v-oil").await.unwrap(), 20);
        assert_eq!(remote.out_movements("v-oil").await.unwrap().len(), movements_after_first);
        assert_eq!(remote.balance("acc-cash").await.unwrap(), Money::zero());
    }

    #[tokio::test]
    async fn test_restores_to_baseline_not_current_plus_sold() {
        let remote = remote().await;
        remote
            .commit("sale-a", &sale("S-0001", vec![line("v-rice", 3, 100)], vec![("acc-cash", 300)]))
            .await
            .unwrap();
        remote
            .commit("sale-b", &sale("S-0002", vec![line("v-rice", 3, 100)], vec![("acc-cash", 300)]))
            .await
            .unwrap();
        assert_eq!(remote.current_quantity("v-rice").await.unwrap(), 4);

        let report = ReversalEngine::over(remote.clone())
            .reverse("sale-a", "m", "r")
            .await
            .unwrap();

        assert_eq!(report.restores[0].restored_to, 10);
        assert_eq!(report.restores[0].delta, 6);
        assert_eq!(remote.current_quantity("v-rice").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_unknown_sale() {
        let remote = remote().await;
        let err = ReversalEngine::over(remote)
            .reverse("sale-missing", "m", "r")
            .await
            .unwrap_err();
        assert!(matches!(err, ReversalError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_report_serializes_camel_case() {
        let report = ReversalReport {
            sale_id: "sale-a".into(),
            restores: vec![VariantRestoreReport {
                variant_id: "v-1".into(),
                sold_quantity: 3,
                previous_quantity: 4,
                restored_to: 10,
                delta: 6,
                strategy: Some(MovementLookup::ReferenceId),
                method: RestoreMethod::DirectWrite,
            }],
            ..Default::default()
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["saleId"], "sale-a");
        assert_eq!(json["restores"][0]["restoredTo"], 10);
        assert_eq!(json["restores"][0]["method"]["type"], "directWrite");
    }
}
