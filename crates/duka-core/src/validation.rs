//! # Validation Module
//!
//! Checks a captured sale before it is queued.
//!
//! A payload that fails here is rejected at the till, while the cashier can
//! still fix it. Anything that passes is queued and must never be silently
//! dropped; the remote processor may still reject it later (fatal failure),
//! but that is a different path.

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::types::SalePayload;
use crate::{MAX_ITEM_QUANTITY, MAX_SALE_ITEMS};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validates a device-generated sale id.
///
/// ## Rules
/// - Must not be empty
/// - At most 64 characters
/// - Letters, digits, hyphens and underscores only
///
/// ```rust
/// use duka_core::validation::validate_sale_id;
///
/// assert!(validate_sale_id("0b6f3c1e-7d2a-4a51-9a57-2f1c2f0e9b11").is_ok());
/// assert!(validate_sale_id("").is_err());
/// assert!(validate_sale_id("sale 1").is_err());
/// ```
pub fn validate_sale_id(id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "sale_id".to_string(),
        });
    }

    if id.len() > 64 {
        return Err(ValidationError::TooLong {
            field: "sale_id".to_string(),
            max: 64,
        });
    }

    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(ValidationError::InvalidFormat {
            field: "sale_id".to_string(),
            reason: "must contain only letters, numbers, hyphens, and underscores".to_string(),
        });
    }

    Ok(())
}

fn require(field: &str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }
    Ok(())
}

/// Validates a full sale payload.
///
/// ## Rules
/// - `sale_number` and `sold_by` present
/// - 1 to [`MAX_SALE_ITEMS`] line items
/// - every quantity in `1..=MAX_ITEM_QUANTITY`, prices not negative
/// - `total` not negative
/// - payment legs positive, tied to an account, and not more than `total`
pub fn validate_payload(payload: &SalePayload) -> CoreResult<()> {
    require("sale_number", &payload.sale_number)?;
    require("sold_by", &payload.sold_by)?;

    if payload.items.is_empty() {
        return Err(CoreError::EmptySale {
            sale_number: payload.sale_number.clone(),
        });
    }

    if payload.items.len() > MAX_SALE_ITEMS {
        return Err(CoreError::TooManyItems {
            max: MAX_SALE_ITEMS,
        });
    }

    for item in &payload.items {
        require("product_id", &item.product_id)?;

        if item.quantity <= 0 {
            return Err(ValidationError::MustBePositive {
                field: format!("quantity ({})", item.sku),
            }
            .into());
        }

        if item.quantity > MAX_ITEM_QUANTITY {
            return Err(CoreError::QuantityTooLarge {
                sku: item.sku.clone(),
                requested: item.quantity,
                max: MAX_ITEM_QUANTITY,
            });
        }

        if item.unit_price.is_negative() || item.line_total.is_negative() {
            return Err(ValidationError::MustNotBeNegative {
                field: format!("price ({})", item.sku),
            }
            .into());
        }

        if let Some(variant_id) = &item.variant_id {
            require("variant_id", variant_id)?;
        }
    }

    if payload.total.is_negative() {
        return Err(ValidationError::MustNotBeNegative {
            field: "total".to_string(),
        }
        .into());
    }

    for leg in &payload.payments {
        require("account_id", &leg.account_id)?;
        if !leg.amount.is_positive() {
            return Err(ValidationError::MustBePositive {
                field: format!("payment amount ({})", leg.method),
            }
            .into());
        }
    }

    let paid = payload.amount_paid();
    if paid > payload.total {
        return Err(CoreError::Overpayment {
            paid: paid.amount(),
            total: payload.total.amount(),
        });
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
