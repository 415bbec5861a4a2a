//! # Repository Module
//!
//! One repository per table group. Each holds a pool clone and is created
//! on demand by [`crate::Database`].
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  DEVICE DATABASE                                                        │
//! │    LedgerBlobRepository   ledger_blobs (one serialized ledger per key)  │
//! │                                                                         │
//! │  REMOTE DATABASE                                                        │
//! │    InventoryRepository    product_variants, stock_movements             │
//! │    SaleRepository         sales, sale_items, commit_sale()              │
//! │    FinanceRepository      finance_accounts, account_transactions        │
//! │    CustomerRepository     customers                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Writes that must land together (the sale commit) go through the
//! crate-private connection helpers in each module, so they can share one
//! transaction.

pub mod customer;
pub mod finance;
pub mod inventory;
pub mod ledger;
pub mod sale;
