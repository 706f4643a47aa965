//! Ledger storage contract
//!
//! Implemented by transaction-scoped handles only. Every call made through a
//! handle runs inside that handle's transaction, so a unit of work can never
//! fall back to a non-transactional connection halfway through.

use async_trait::async_trait;

use super::error::StoreError;
use crate::account::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams, Entry,
    ListAccountsParams, ListEntriesParams, UpdateAccountParams,
};
use crate::transfer::types::{CreateTransferParams, ListTransfersParams, Transfer};
use crate::user::models::{
    CreateUserParams, CreateVerifyEmailParams, UpdateUserParams, UpdateVerifyEmailParams, User,
    VerifyEmail,
};

#[async_trait]
pub trait Repository: Send {
    // === Accounts ===
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, StoreError>;

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError>;

    /// Read the row and hold an exclusive lock on it until the transaction
    /// ends. Blocks while another transaction holds the lock.
    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError>;

    async fn list_accounts(&mut self, arg: ListAccountsParams) -> Result<Vec<Account>, StoreError>;

    async fn update_account(&mut self, arg: UpdateAccountParams) -> Result<Account, StoreError>;

    /// `balance = balance + amount` evaluated by the store, never a
    /// read-modify-write on the caller's side.
    async fn add_account_balance(
        &mut self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError>;

    async fn delete_account(&mut self, id: i64) -> Result<(), StoreError>;

    // === Entries ===
    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, StoreError>;

    async fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError>;

    async fn list_entries(&mut self, arg: ListEntriesParams) -> Result<Vec<Entry>, StoreError>;

    // === Transfers ===
    async fn create_transfer(&mut self, arg: CreateTransferParams)
    -> Result<Transfer, StoreError>;

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError>;

    async fn list_transfers(
        &mut self,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError>;

    // === Users ===
    async fn create_user(&mut self, arg: CreateUserParams) -> Result<User, StoreError>;

    async fn get_user(&mut self, username: &str) -> Result<User, StoreError>;

    async fn update_user(&mut self, arg: UpdateUserParams) -> Result<User, StoreError>;

    // === E-mail verification ===
    async fn create_verify_email(
        &mut self,
        arg: CreateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError>;

    /// Mark the row used. Only matches an unused, unexpired row with the
    /// given secret code; anything else is `NotFound`.
    async fn update_verify_email(
        &mut self,
        arg: UpdateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError>;
}
