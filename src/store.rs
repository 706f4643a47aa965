//! Store: a backend bound to the transaction executor
//!
//! The single place callers go through. Multi-step operations
//! (`transfer_tx`, `create_user_tx`, `verify_email_tx`) and single queries
//! all run inside [`exec_tx`], with the configured deadline.

use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{error, info, warn};

use crate::account::{
    Account, AddAccountBalanceParams, CreateAccountParams, Entry, ListAccountsParams,
    ListEntriesParams, UpdateAccountParams,
};
use crate::db::{Repository, StoreError, TxBackend, exec_tx};
use crate::transfer::{
    ListTransfersParams, Transfer, TransferTxParams, TransferTxResult, TransferTxState,
    execute_transfer,
};
use crate::user::models::{
    CreateUserParams, CreateVerifyEmailParams, UpdateUserParams, UpdateVerifyEmailParams, User,
    VerifyEmail,
};
use crate::user::tx::{
    CreateUserTxParams, CreateUserTxResult, VerifyEmailTxResult, create_user_in, verify_email_in,
};

pub struct Store<B> {
    backend: B,
    tx_timeout: Option<Duration>,
}

impl<B: TxBackend> Store<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            tx_timeout: None,
        }
    }

    /// Abort (and roll back) any unit of work running longer than `timeout`
    pub fn with_tx_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.tx_timeout = timeout;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run `f` atomically on a fresh transaction
    pub async fn exec_tx<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut B::Tx) -> BoxFuture<'c, Result<T, StoreError>> + Send,
    {
        exec_tx(&self.backend, self.tx_timeout, f).await
    }

    /// Move `amount` from one account to another. See [`crate::transfer::engine`].
    pub async fn transfer_tx(&self, arg: TransferTxParams) -> Result<TransferTxResult, StoreError> {
        let result = self
            .exec_tx(move |q| Box::pin(execute_transfer(q, arg)))
            .await;

        match &result {
            Ok(res) => info!(
                transfer_id = res.transfer.id,
                from = arg.from_account_id,
                to = arg.to_account_id,
                amount = arg.amount,
                state = %TransferTxState::Committed,
                "Transfer committed"
            ),
            Err(e) if e.is_fatal() => error!(
                from = arg.from_account_id,
                to = arg.to_account_id,
                amount = arg.amount,
                code = e.code(),
                error = %e,
                "Transfer outcome unknown"
            ),
            Err(e) => warn!(
                from = arg.from_account_id,
                to = arg.to_account_id,
                amount = arg.amount,
                state = %TransferTxState::Aborted,
                code = e.code(),
                error = %e,
                "Transfer aborted"
            ),
        }
        result
    }

    /// Insert a user and run its after-create hook in the same transaction
    pub async fn create_user_tx(
        &self,
        arg: CreateUserTxParams,
    ) -> Result<CreateUserTxResult, StoreError> {
        let result = self
            .exec_tx(move |q| Box::pin(create_user_in(q, arg)))
            .await;
        if let Err(e) = &result {
            warn!(code = e.code(), error = %e, "User creation rolled back");
        }
        result
    }

    pub async fn verify_email_tx(
        &self,
        arg: UpdateVerifyEmailParams,
    ) -> Result<VerifyEmailTxResult, StoreError> {
        self.exec_tx(move |q| Box::pin(verify_email_in(q, arg)))
            .await
    }

    // === Single-statement operations ===

    pub async fn create_account(&self, arg: CreateAccountParams) -> Result<Account, StoreError> {
        self.exec_tx(move |q| Box::pin(async move { q.create_account(arg).await }))
            .await
    }

    pub async fn get_account(&self, id: i64) -> Result<Account, StoreError> {
        self.exec_tx(move |q| Box::pin(async move { q.get_account(id).await }))
            .await
    }

    pub async fn list_accounts(&self, arg: ListAccountsParams) -> Result<Vec<Account>, StoreError> {
        self.exec_tx(move |q| Box::pin(async move { q.list_accounts(arg).await }))
            .await
    }

    pub async fn update_account(&self, arg: UpdateAccountParams) -> Result<Account, StoreError> {
        self.exec_tx(move |q| Box::pin(async move { q.update_account(arg).await }))
            .await
    }

    /// Row-locked `balance = balance + amount`, not funds-checked. Transfers go
    /// through [`Store::transfer_tx`] instead.
    pub async fn add_account_balance(
        &self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError> {
        self.exec_tx(move |q| Box::pin(async move { q.add_account_balance(arg).await }))
            .await
    }

    pub async fn delete_account(&self, id: i64) -> Result<(), StoreError> {
        self.exec_tx(move |q| Box::pin(async move { q.delete_account(id).await }))
            .await
    }

    pub async fn get_entry(&self, id: i64) -> Result<Entry, StoreError> {
        self.exec_tx(move |q| Box::pin(async move { q.get_entry(id).await }))
            .await
    }

    pub async fn list_entries(&self, arg: ListEntriesParams) -> Result<Vec<Entry>, StoreError> {
        self.exec_tx(move |q| Box::pin(async move { q.list_entries(arg).await }))
            .await
    }

    pub async fn get_transfer(&self, id: i64) -> Result<Transfer, StoreError> {
        self.exec_tx(move |q| Box::pin(async move { q.get_transfer(id).await }))
            .await
    }

    pub async fn list_transfers(
        &self,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError> {
        self.exec_tx(move |q| Box::pin(async move { q.list_transfers(arg).await }))
            .await
    }

    pub async fn create_user(&self, arg: CreateUserParams) -> Result<User, StoreError> {
        self.exec_tx(move |q| Box::pin(async move { q.create_user(arg).await }))
            .await
    }

    pub async fn get_user(&self, username: &str) -> Result<User, StoreError> {
        let username = username.to_string();
        self.exec_tx(move |q| Box::pin(async move { q.get_user(&username).await }))
            .await
    }

    pub async fn update_user(&self, arg: UpdateUserParams) -> Result<User, StoreError> {
        self.exec_tx(move |q| Box::pin(async move { q.update_user(arg).await }))
            .await
    }

    pub async fn create_verify_email(
        &self,
        arg: CreateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError> {
        self.exec_tx(move |q| Box::pin(async move { q.create_verify_email(arg).await }))
            .await
    }
}

impl<B: TxBackend + Clone> Clone for Store<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            tx_timeout: self.tx_timeout,
        }
    }
}
