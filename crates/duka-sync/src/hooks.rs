//! # Sale Event Hooks
//!
//! Outbound notifications (receipts over SMS, dashboards, audit) hang off
//! these two calls. The engine awaits them but never acts on the result: a
//! failing hook is logged at debug and forgotten.

use async_trait::async_trait;

use crate::remote::CommitReceipt;
use crate::reversal::ReversalReport;
use duka_core::{RemoteSale, SaleRecord};

/// Error a hook may return. The engine only logs it.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

pub type HookResult = Result<(), HookError>;

#[async_trait]
pub trait SaleEventHooks: Send + Sync {
    /// A queued sale reached the remote ledger (or was already there).
    async fn on_sale_committed(&self, record: &SaleRecord, receipt: &CommitReceipt) -> HookResult;

    /// A committed sale was reversed.
    async fn on_sale_reversed(&self, sale: &RemoteSale, report: &ReversalReport) -> HookResult;
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpHooks;

#[async_trait]
impl SaleEventHooks for NoOpHooks {
    async fn on_sale_committed(&self, _record: &SaleRecord, _receipt: &CommitReceipt) -> HookResult {
        Ok(())
    }

    async fn on_sale_reversed(&self, _sale: &RemoteSale, _report: &ReversalReport) -> HookResult {
        Ok(())
    }
}
