//! PostgreSQL ledger backend
//!
//! Every [`Repository`] call runs on the connection owned by the open
//! `sqlx::Transaction`. Queries are plain runtime-checked `sqlx::query_as`
//! with `bind`, so the crate builds without a live database.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};

use super::error::StoreError;
use super::executor::{TxBackend, TxHandle};
use super::repository::Repository;
use crate::account::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams, Entry,
    ListAccountsParams, ListEntriesParams, UpdateAccountParams,
};
use crate::transfer::types::{CreateTransferParams, ListTransfersParams, Transfer};
use crate::user::models::{
    CreateUserParams, CreateVerifyEmailParams, UpdateUserParams, UpdateVerifyEmailParams, User,
    VerifyEmail,
};

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";
const USER_COLUMNS: &str =
    "username, hashed_password, full_name, email, is_email_verified, password_changed_at, created_at";
const VERIFY_EMAIL_COLUMNS: &str =
    "id, username, email, secret_code, is_used, created_at, expired_at";

/// Opens transactions on a shared connection pool
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TxBackend for PgBackend {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(PgTx { tx })
    }

    /// `SET LOCAL` scopes both timeouts to this transaction; the pooled
    /// connection gets its defaults back on commit/rollback.
    async fn begin_with_deadline(&self, deadline: Option<Duration>) -> Result<PgTx, StoreError> {
        let mut tx = self.pool.begin().await?;
        if let Some(deadline) = deadline {
            // 0 would mean "no timeout"
            let ms = deadline.as_millis().clamp(1, i32::MAX as u128);
            sqlx::query(&format!("SET LOCAL lock_timeout = {ms}"))
                .execute(&mut *tx)
                .await?;
            sqlx::query(&format!("SET LOCAL statement_timeout = {ms}"))
                .execute(&mut *tx)
                .await?;
        }
        Ok(PgTx { tx })
    }
}

/// Transaction-scoped repository. Dropped without commit = rolled back.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl TxHandle for PgTx {
    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl Repository for PgTx {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, StoreError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "INSERT INTO accounts (owner, balance, currency) VALUES ($1, $2, $3) RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(&arg.owner)
        .bind(arg.balance)
        .bind(arg.currency.as_str())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 LIMIT 1"
        ))
        .bind(id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(account)
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError> {
        // NO KEY UPDATE: entry/transfer inserts take FOR KEY SHARE on the
        // account through their foreign keys, which plain FOR UPDATE would
        // conflict with.
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 LIMIT 1 FOR NO KEY UPDATE"
        ))
        .bind(id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(account)
    }

    async fn list_accounts(&mut self, arg: ListAccountsParams) -> Result<Vec<Account>, StoreError> {
        let accounts = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner = $1 ORDER BY id LIMIT $2 OFFSET $3"
        ))
        .bind(&arg.owner)
        .bind(arg.limit)
        .bind(arg.offset)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(accounts)
    }

    async fn update_account(&mut self, arg: UpdateAccountParams) -> Result<Account, StoreError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "UPDATE accounts SET balance = $2 WHERE id = $1 RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(arg.id)
        .bind(arg.balance)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(account)
    }

    async fn add_account_balance(
        &mut self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "UPDATE accounts SET balance = balance + $1 WHERE id = $2 RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(arg.amount)
        .bind(arg.id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(account)
    }

    async fn delete_account(&mut self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("account {id}")));
        }
        Ok(())
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, StoreError> {
        let entry = sqlx::query_as::<_, Entry>(&format!(
            "INSERT INTO entries (account_id, amount) VALUES ($1, $2) RETURNING {ENTRY_COLUMNS}"
        ))
        .bind(arg.account_id)
        .bind(arg.amount)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(entry)
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError> {
        let entry = sqlx::query_as::<_, Entry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE id = $1 LIMIT 1"
        ))
        .bind(id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(entry)
    }

    async fn list_entries(&mut self, arg: ListEntriesParams) -> Result<Vec<Entry>, StoreError> {
        let entries = sqlx::query_as::<_, Entry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE account_id = $1 ORDER BY id LIMIT $2 OFFSET $3"
        ))
        .bind(arg.account_id)
        .bind(arg.limit)
        .bind(arg.offset)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(entries)
    }

    async fn create_transfer(
        &mut self,
        arg: CreateTransferParams,
    ) -> Result<Transfer, StoreError> {
        let transfer = sqlx::query_as::<_, Transfer>(&format!(
            "INSERT INTO transfers (from_account_id, to_account_id, amount) VALUES ($1, $2, $3) RETURNING {TRANSFER_COLUMNS}"
        ))
        .bind(arg.from_account_id)
        .bind(arg.to_account_id)
        .bind(arg.amount)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        let transfer = sqlx::query_as::<_, Transfer>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = $1 LIMIT 1"
        ))
        .bind(id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(transfer)
    }

    async fn list_transfers(
        &mut self,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError> {
        let transfers = sqlx::query_as::<_, Transfer>(&format!(
            r#"SELECT {TRANSFER_COLUMNS} FROM transfers
               WHERE (from_account_id = $1 AND to_account_id = $2)
                  OR (from_account_id = $2 AND to_account_id = $1)
               ORDER BY id LIMIT $3 OFFSET $4"#
        ))
        .bind(arg.from_account_id)
        .bind(arg.to_account_id)
        .bind(arg.limit)
        .bind(arg.offset)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(transfers)
    }

    async fn create_user(&mut self, arg: CreateUserParams) -> Result<User, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"INSERT INTO users (username, hashed_password, full_name, email)
               VALUES ($1, $2, $3, $4) RETURNING {USER_COLUMNS}"#
        ))
        .bind(&arg.username)
        .bind(&arg.hashed_password)
        .bind(&arg.full_name)
        .bind(&arg.email)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(user)
    }

    async fn get_user(&mut self, username: &str) -> Result<User, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1 LIMIT 1"
        ))
        .bind(username)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(user)
    }

    async fn update_user(&mut self, arg: UpdateUserParams) -> Result<User, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"UPDATE users SET
                   hashed_password = COALESCE($1, hashed_password),
                   password_changed_at = COALESCE($2, password_changed_at),
                   full_name = COALESCE($3, full_name),
                   email = COALESCE($4, email),
                   is_email_verified = COALESCE($5, is_email_verified)
               WHERE username = $6
               RETURNING {USER_COLUMNS}"#
        ))
        .bind(arg.hashed_password)
        .bind(arg.password_changed_at)
        .bind(arg.full_name)
        .bind(arg.email)
        .bind(arg.is_email_verified)
        .bind(&arg.username)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(user)
    }

    async fn create_verify_email(
        &mut self,
        arg: CreateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError> {
        let verify_email = sqlx::query_as::<_, VerifyEmail>(&format!(
            r#"INSERT INTO verify_emails (username, email, secret_code)
               VALUES ($1, $2, $3) RETURNING {VERIFY_EMAIL_COLUMNS}"#
        ))
        .bind(&arg.username)
        .bind(&arg.email)
        .bind(&arg.secret_code)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(verify_email)
    }

    async fn update_verify_email(
        &mut self,
        arg: UpdateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError> {
        let verify_email = sqlx::query_as::<_, VerifyEmail>(&format!(
            r#"UPDATE verify_emails SET is_used = TRUE
               WHERE id = $1 AND secret_code = $2 AND is_used = FALSE AND expired_at > NOW()
               RETURNING {VERIFY_EMAIL_COLUMNS}"#
        ))
        .bind(arg.id)
        .bind(&arg.secret_code)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(verify_email)
    }
}
