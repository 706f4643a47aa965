//! Transfer Engine
//!
//! One transfer is one unit of work:
//!
//! ```text
//! insert transfer ─▶ insert debit + credit entries
//!        ─▶ lock min(from, to) ─▶ lock max(from, to)       [LocksAcquired]
//!        ─▶ source.balance >= amount ?                      [FundsChecked]
//!        ─▶ balance += delta on min id, then max id         [BalancesUpdated]
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Global lock order**: rows are locked by ascending account id, never by
//!    role. A→B and B→A running together request the same first lock, so no
//!    wait cycle can form.
//! 2. **Check under lock**: the funds check reads the locked row. An unlocked
//!    read could be invalidated by a concurrent debit before the lock.
//! 3. **Store-side arithmetic**: balances change through
//!    `balance = balance + delta`, in lock order.
//!
//! A rejected transfer still consumed transfer and entry ids, so committed
//! ids can have gaps.

use tracing::debug;

use super::state::TransferTxState;
use super::types::{TransferTxParams, TransferTxResult};
use crate::account::{Account, AddAccountBalanceParams, CreateEntryParams};
use crate::db::{Repository, StoreError};

/// Run the whole transfer on an open transaction handle. The caller owns
/// commit/rollback; see [`crate::store::Store::transfer_tx`].
pub async fn execute_transfer<R>(
    q: &mut R,
    arg: TransferTxParams,
) -> Result<TransferTxResult, StoreError>
where
    R: Repository + ?Sized,
{
    validate(&arg)?;
    let mut state = TransferTxState::Started;

    let transfer = q
        .create_transfer(arg.into())
        .await
        .map_err(missing_account)?;
    let from_entry = q
        .create_entry(CreateEntryParams {
            account_id: arg.from_account_id,
            amount: -arg.amount,
        })
        .await
        .map_err(missing_account)?;
    let to_entry = q
        .create_entry(CreateEntryParams {
            account_id: arg.to_account_id,
            amount: arg.amount,
        })
        .await
        .map_err(missing_account)?;
    debug!(transfer_id = transfer.id, %state, "Transfer and entries inserted");

    let (first_id, second_id) = arg.lock_order();
    let first = q.get_account_for_update(first_id).await?;
    let second = q.get_account_for_update(second_id).await?;
    state = advance(transfer.id, state, TransferTxState::LocksAcquired);

    let source = if first.id == arg.from_account_id {
        &first
    } else {
        &second
    };
    check_sufficient_funds(source, arg.amount)?;
    state = advance(transfer.id, state, TransferTxState::FundsChecked);

    let from_is_first = first_id == arg.from_account_id;
    let (first_delta, second_delta) = if from_is_first {
        (-arg.amount, arg.amount)
    } else {
        (arg.amount, -arg.amount)
    };
    let (first, second) = add_money(q, first_id, first_delta, second_id, second_delta).await?;
    advance(transfer.id, state, TransferTxState::BalancesUpdated);

    let (from_account, to_account) = if from_is_first {
        (first, second)
    } else {
        (second, first)
    };

    Ok(TransferTxResult {
        transfer,
        from_account,
        to_account,
        from_entry,
        to_entry,
    })
}

/// The engine does not trust its caller for these two.
fn validate(arg: &TransferTxParams) -> Result<(), StoreError> {
    if arg.amount <= 0 {
        return Err(StoreError::InvalidAmount);
    }
    if arg.from_account_id == arg.to_account_id {
        return Err(StoreError::SameAccount);
    }
    Ok(())
}

/// Overdraft guard. `account` must come from a locked read.
pub fn check_sufficient_funds(account: &Account, amount: i64) -> Result<(), StoreError> {
    if account.balance < amount {
        return Err(StoreError::InsufficientFunds {
            account_id: account.id,
            balance: account.balance,
            amount,
        });
    }
    Ok(())
}

/// Apply `amount1` to `account_id1`, then `amount2` to `account_id2`.
/// Callers pass the accounts in lock order.
async fn add_money<R>(
    q: &mut R,
    account_id1: i64,
    amount1: i64,
    account_id2: i64,
    amount2: i64,
) -> Result<(Account, Account), StoreError>
where
    R: Repository + ?Sized,
{
    let account1 = q
        .add_account_balance(AddAccountBalanceParams {
            id: account_id1,
            amount: amount1,
        })
        .await?;
    let account2 = q
        .add_account_balance(AddAccountBalanceParams {
            id: account_id2,
            amount: amount2,
        })
        .await?;
    Ok((account1, account2))
}

/// A foreign-key failure on insert means one of the accounts does not exist.
fn missing_account(err: StoreError) -> StoreError {
    match err {
        StoreError::ForeignKeyViolation(detail) => {
            StoreError::NotFound(format!("transfer references a missing account: {detail}"))
        }
        other => other,
    }
}

fn advance(transfer_id: i64, from: TransferTxState, to: TransferTxState) -> TransferTxState {
    debug_assert!(from.can_transition_to(to), "illegal transition {from} -> {to}");
    debug!(transfer_id, state = %to, "Transfer state advanced");
    to
}
