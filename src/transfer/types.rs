//! Transfer records and engine input/output

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::account::{Account, Entry};

/// Immutable record of one movement of funds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Transfer {
    pub id: i64,
    pub from_account_id: i64,
    pub to_account_id: i64,
    /// Always positive
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct CreateTransferParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

/// Transfers between two accounts, in either direction
#[derive(Debug, Clone, Copy)]
pub struct ListTransfersParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Input of the transfer engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

impl TransferTxParams {
    pub fn new(from_account_id: i64, to_account_id: i64, amount: i64) -> Self {
        Self {
            from_account_id,
            to_account_id,
            amount,
        }
    }

    /// Account ids in lock order: lower id first.
    #[inline]
    pub fn lock_order(&self) -> (i64, i64) {
        if self.from_account_id < self.to_account_id {
            (self.from_account_id, self.to_account_id)
        } else {
            (self.to_account_id, self.from_account_id)
        }
    }
}

impl From<TransferTxParams> for CreateTransferParams {
    fn from(p: TransferTxParams) -> Self {
        Self {
            from_account_id: p.from_account_id,
            to_account_id: p.to_account_id,
            amount: p.amount,
        }
    }
}

/// Everything a committed transfer produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}
