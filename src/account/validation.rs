//! Account-level request checks
//!
//! These run before a transfer reaches the engine. The engine re-checks
//! only what it cannot trust (amount sign, distinct accounts).

use super::models::{Account, Currency};

/// Validation errors for account and transfer requests
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("Unsupported currency: '{0}'")]
    UnsupportedCurrency(String),

    #[error("account [{account_id}] currency mismatch: {actual} vs {expected}")]
    CurrencyMismatch {
        account_id: i64,
        actual: Currency,
        expected: Currency,
    },

    #[error("account [{account_id}] doesn't belong to the authenticated user")]
    NotOwner { account_id: i64 },

    #[error("Invalid {field}: expected {min}-{max}, got {actual}")]
    OutOfRange {
        field: &'static str,
        min: i64,
        max: i64,
        actual: i64,
    },
}

/// Both accounts must hold the currency the request is denominated in
pub fn check_transfer_currency(
    from: &Account,
    to: &Account,
    currency: Currency,
) -> Result<(), ValidationError> {
    for account in [from, to] {
        if account.currency != currency {
            return Err(ValidationError::CurrencyMismatch {
                account_id: account.id,
                actual: account.currency,
                expected: currency,
            });
        }
    }
    Ok(())
}

/// Only the owner may move money out of an account
pub fn check_owner(account: &Account, username: &str) -> Result<(), ValidationError> {
    if account.owner != username {
        return Err(ValidationError::NotOwner {
            account_id: account.id,
        });
    }
    Ok(())
}

pub const MIN_PAGE_SIZE: i64 = 5;
pub const MAX_PAGE_SIZE: i64 = 10;

/// Convert a 1-based page request into `(limit, offset)`
pub fn page_to_limit_offset(page_id: i64, page_size: i64) -> Result<(i64, i64), ValidationError> {
    if page_id < 1 {
        return Err(ValidationError::OutOfRange {
            field: "page_id",
            min: 1,
            max: i64::MAX,
            actual: page_id,
        });
    }
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(ValidationError::OutOfRange {
            field: "page_size",
            min: MIN_PAGE_SIZE,
            max: MAX_PAGE_SIZE,
            actual: page_size,
        });
    }
    let offset = page_size
        .checked_mul(page_id - 1)
        .ok_or(ValidationError::OutOfRange {
            field: "page_id",
            min: 1,
            max: i64::MAX / page_size + 1,
            actual: page_id,
        })?;
    Ok((page_size, offset))
}
