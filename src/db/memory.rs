//! In-memory ledger backend
//!
//! A transactional store with the same visible behavior as the PostgreSQL
//! backend for everything the engine relies on:
//!
//! - row locks: `get_account_for_update` and every row update take an
//!   exclusive async lock held until commit/rollback;
//! - isolation: a transaction's writes live in its private write set and are
//!   published atomically at commit, so readers never see uncommitted rows;
//! - sequences: ids come from shared counters that are not rolled back, so
//!   aborted transactions leave gaps exactly like `BIGSERIAL`.
//!
//! Constraint checks (foreign keys, unique keys) run against committed rows
//! plus the transaction's own writes at statement time, and again against
//! the latest committed rows at commit. A transaction that lost a race to a
//! concurrent commit fails there instead of overwriting it.
//!
//! Row locks live only while some transaction holds or waits for them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::OwnedMutexGuard;

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
    VERIFY_EMAIL_TTL_MINUTES, VerifyEmail,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    Account(i64),
    User(String),
    VerifyEmail(i64),
}

#[derive(Debug, Default)]
struct Sequences {
    account: i64,
    entry: i64,
    transfer: i64,
    verify_email: i64,
}

fn next_id(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

#[derive(Debug, Default)]
struct Tables {
    users: BTreeMap<String, User>,
    verify_emails: BTreeMap<i64, VerifyEmail>,
    accounts: BTreeMap<i64, Account>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
    seq: Sequences,
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<RowKey, Arc<tokio::sync::Mutex<()>>>>,
    fail_next_rollback: AtomicBool,
}

impl Shared {
    // A panic while holding the table lock cannot leave a half-applied
    // commit behind: commits apply in one synchronous block.
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn row_locks(&self) -> MutexGuard<'_, HashMap<RowKey, Arc<tokio::sync::Mutex<()>>>> {
        self.row_locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn row_lock(&self, key: &RowKey) -> Arc<tokio::sync::Mutex<()>> {
        self.row_locks().entry(key.clone()).or_default().clone()
    }

    /// Forget locks nobody holds or waits for. Waiters own a clone of the
    /// `Arc`, taken under the same map lock, so they keep theirs alive.
    fn prune_row_locks<'a>(&self, keys: impl Iterator<Item = &'a RowKey>) {
        let mut locks = self.row_locks();
        for key in keys {
            if let Some(lock) = locks.get(key) {
                if Arc::strong_count(lock) == 1 {
                    locks.remove(key);
                }
            }
        }
    }
}

/// Shareable handle; clones open transactions on the same data.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next rollback report a failure (after discarding the writes).
    pub fn fail_next_rollback(&self) {
        self.shared.fail_next_rollback.store(true, Ordering::SeqCst);
    }

    /// Committed state of an account, bypassing transactions
    pub fn committed_account(&self, id: i64) -> Option<Account> {
        self.shared.tables().accounts.get(&id).cloned()
    }

    pub fn committed_entries(&self, account_id: i64) -> Vec<Entry> {
        self.shared
            .tables()
            .entries
            .values()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect()
    }

    pub fn committed_transfers(&self) -> Vec<Transfer> {
        self.shared.tables().transfers.values().cloned().collect()
    }

    pub fn entry_count(&self) -> usize {
        self.shared.tables().entries.len()
    }

    pub fn transfer_count(&self) -> usize {
        self.shared.tables().transfers.len()
    }
}

#[async_trait]
impl TxBackend for MemoryBackend {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        Ok(MemoryTx {
            shared: self.shared.clone(),
            held: HashMap::new(),
            lock_order: Vec::new(),
            waiting: None,
            writes: WriteSet::default(),
        })
    }
}

#[derive(Default)]
struct WriteSet {
    users: BTreeMap<String, User>,
    /// Usernames inserted (not updated) by this transaction
    new_users: BTreeSet<String>,
    verify_emails: BTreeMap<i64, VerifyEmail>,
    /// `None` marks a delete
    accounts: BTreeMap<i64, Option<Account>>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
}

/// One open transaction. Dropping it without commit discards its writes and
/// releases its locks.
pub struct MemoryTx {
    shared: Arc<Shared>,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
    lock_order: Vec<RowKey>,
    /// Lock being waited for; set if the wait was cancelled
    waiting: Option<RowKey>,
    writes: WriteSet,
}

impl MemoryTx {
    async fn lock(&mut self, key: RowKey) {
        if self.held.contains_key(&key) {
            return;
        }
        let row_lock = self.shared.row_lock(&key);
        self.waiting = Some(key.clone());
        let guard = row_lock.lock_owned().await;
        self.waiting = None;
        self.held.insert(key.clone(), guard);
        self.lock_order.push(key);
        // A PostgreSQL lock is a round trip; suspend here too, so concurrent
        // transactions interleave between their first and second lock.
        tokio::task::yield_now().await;
    }

    /// Account ids this transaction has locked, in acquisition order
    pub fn locked_accounts(&self) -> Vec<i64> {
        self.lock_order
            .iter()
            .filter_map(|key| match key {
                RowKey::Account(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    fn release_locks(&mut self) {
        if self.held.is_empty() && self.waiting.is_none() {
            return;
        }
        let mut keys: Vec<RowKey> = self.held.drain().map(|(key, _guard)| key).collect();
        keys.extend(self.waiting.take());
        self.shared.prune_row_locks(keys.iter());
    }

    fn visible_account(&self, id: i64) -> Option<Account> {
        match self.writes.accounts.get(&id) {
            Some(pending) => pending.clone(),
            None => self.shared.tables().accounts.get(&id).cloned(),
        }
    }

    fn visible_accounts(&self) -> BTreeMap<i64, Account> {
        let mut accounts = self.shared.tables().accounts.clone();
        for (id, pending) in &self.writes.accounts {
            match pending {
                Some(account) => accounts.insert(*id, account.clone()),
                None => accounts.remove(id),
            };
        }
        accounts
    }

    fn visible_user(&self, username: &str) -> Option<User> {
        self.writes
            .users
            .get(username)
            .cloned()
            .or_else(|| self.shared.tables().users.get(username).cloned())
    }

    fn visible_users(&self) -> BTreeMap<String, User> {
        let mut users = self.shared.tables().users.clone();
        users.extend(self.writes.users.clone());
        users
    }

    fn visible_entries(&self) -> BTreeMap<i64, Entry> {
        let mut entries = self.shared.tables().entries.clone();
        entries.extend(self.writes.entries.clone());
        entries
    }

    fn visible_transfers(&self) -> BTreeMap<i64, Transfer> {
        let mut transfers = self.shared.tables().transfers.clone();
        transfers.extend(self.writes.transfers.clone());
        transfers
    }

    fn visible_verify_email(&self, id: i64) -> Option<VerifyEmail> {
        self.writes
            .verify_emails
            .get(&id)
            .cloned()
            .or_else(|| self.shared.tables().verify_emails.get(&id).cloned())
    }

    fn require_account(&self, id: i64, constraint: &str) -> Result<(), StoreError> {
        if self.visible_account(id).is_none() {
            return Err(StoreError::ForeignKeyViolation(format!(
                "insert violates foreign key constraint \"{constraint}\": account {id} does not exist"
            )));
        }
        Ok(())
    }

    fn require_user(&self, username: &str, constraint: &str) -> Result<(), StoreError> {
        if self.visible_user(username).is_none() {
            return Err(StoreError::ForeignKeyViolation(format!(
                "insert violates foreign key constraint \"{constraint}\": user {username} does not exist"
            )));
        }
        Ok(())
    }

    fn next_id(&self, pick: fn(&mut Sequences) -> &mut i64) -> i64 {
        let mut tables = self.shared.tables();
        next_id(pick(&mut tables.seq))
    }

    async fn locked_account(&mut self, id: i64) -> Result<Account, StoreError> {
        self.lock(RowKey::Account(id)).await;
        self.visible_account(id)
            .ok_or_else(|| StoreError::NotFound(format!("account {id}")))
    }
}

fn page<T>(rows: impl Iterator<Item = T>, limit: i64, offset: i64) -> Vec<T> {
    rows.skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

/// `password_changed_at` default for fresh users: 0001-01-01T00:00:00Z
fn zero_time() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(-62_135_596_800, 0).unwrap_or_default()
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        self.release_locks();
    }
}

/// Re-run the key constraints of `writes` against the rows committed so far.
/// Runs under the table lock, so no other commit can interleave.
fn check_commit(tables: &Tables, writes: &WriteSet) -> Result<(), StoreError> {
    let account_exists = |id: i64| match writes.accounts.get(&id) {
        Some(pending) => pending.is_some(),
        None => tables.accounts.contains_key(&id),
    };
    let user_exists =
        |name: &str| writes.users.contains_key(name) || tables.users.contains_key(name);
    let fk = |what: String| {
        StoreError::ForeignKeyViolation(format!("commit violates foreign key constraint: {what}"))
    };

    for username in &writes.new_users {
        if tables.users.contains_key(username) {
            return Err(StoreError::UniqueViolation(format!(
                "duplicate key value violates unique constraint \"users_pkey\": {username}"
            )));
        }
    }
    for user in writes.users.values() {
        let taken = tables
            .users
            .values()
            .any(|u| u.email == user.email && u.username != user.username);
        if taken {
            return Err(StoreError::UniqueViolation(format!(
                "duplicate key value violates unique constraint \"users_email_key\": {}",
                user.email
            )));
        }
    }

    for (id, pending) in &writes.accounts {
        match pending {
            Some(account) => {
                if !user_exists(&account.owner) {
                    return Err(fk(format!("owner {} of account {id} is gone", account.owner)));
                }
                let duplicate = tables.accounts.values().any(|a| {
                    a.id != *id
                        && a.owner == account.owner
                        && a.currency == account.currency
                        && !matches!(writes.accounts.get(&a.id), Some(None))
                });
                if duplicate {
                    return Err(StoreError::UniqueViolation(format!(
                        "duplicate key value violates unique constraint \"owner_currency_key\": ({}, {})",
                        account.owner, account.currency
                    )));
                }
            }
            None => {
                let referenced = tables.entries.values().any(|e| e.account_id == *id)
                    || tables
                        .transfers
                        .values()
                        .any(|t| t.from_account_id == *id || t.to_account_id == *id);
                if referenced {
                    return Err(fk(format!("deleted account {id} is still referenced")));
                }
            }
        }
    }

    for entry in writes.entries.values() {
        if !account_exists(entry.account_id) {
            return Err(fk(format!(
                "entry {} references missing account {}",
                entry.id, entry.account_id
            )));
        }
    }
    for transfer in writes.transfers.values() {
        for id in [transfer.from_account_id, transfer.to_account_id] {
            if !account_exists(id) {
                return Err(fk(format!(
                    "transfer {} references missing account {id}",
                    transfer.id
                )));
            }
        }
    }
    for verify_email in writes.verify_emails.values() {
        if !user_exists(&verify_email.username) {
            return Err(fk(format!(
                "verify email {} references missing user {}",
                verify_email.id, verify_email.username
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl TxHandle for MemoryTx {
    async fn commit(mut self) -> Result<(), StoreError> {
        let writes = std::mem::take(&mut self.writes);
        {
            let mut tables = self.shared.tables();
            check_commit(&tables, &writes)?;

            tables.users.extend(writes.users);
            tables.verify_emails.extend(writes.verify_emails);
            for (id, pending) in writes.accounts {
                match pending {
                    Some(account) => tables.accounts.insert(id, account),
                    None => tables.accounts.remove(&id),
                };
            }
            tables.entries.extend(writes.entries);
            tables.transfers.extend(writes.transfers);
        }
        // Locks go only after the writes are published
        self.release_locks();
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        let fail = self.shared.fail_next_rollback.swap(false, Ordering::SeqCst);
        drop(self);
        if fail {
            return Err(StoreError::Database(sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "connection lost during rollback",
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for MemoryTx {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, StoreError> {
        self.require_user(&arg.owner, "accounts_owner_fkey")?;
        let duplicate = self
            .visible_accounts()
            .values()
            .any(|a| a.owner == arg.owner && a.currency == arg.currency);
        if duplicate {
            return Err(StoreError::UniqueViolation(format!(
                "duplicate key value violates unique constraint \"owner_currency_key\": ({}, {})",
                arg.owner, arg.currency
            )));
        }

        let account = Account {
            id: self.next_id(|s| &mut s.account),
            owner: arg.owner,
            balance: arg.balance,
            currency: arg.currency,
            created_at: Utc::now(),
        };
        self.writes
            .accounts
            .insert(account.id, Some(account.clone()));
        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError> {
        self.visible_account(id)
            .ok_or_else(|| StoreError::NotFound(format!("account {id}")))
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError> {
        self.locked_account(id).await
    }

    async fn list_accounts(&mut self, arg: ListAccountsParams) -> Result<Vec<Account>, StoreError> {
        let rows = self
            .visible_accounts()
            .into_values()
            .filter(|a| a.owner == arg.owner);
        Ok(page(rows, arg.limit, arg.offset))
    }

    async fn update_account(&mut self, arg: UpdateAccountParams) -> Result<Account, StoreError> {
        let mut account = self.locked_account(arg.id).await?;
        account.balance = arg.balance;
        self.writes
            .accounts
            .insert(account.id, Some(account.clone()));
        Ok(account)
    }

    async fn add_account_balance(
        &mut self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError> {
        let mut account = self.locked_account(arg.id).await?;
        account.balance = account
            .balance
            .checked_add(arg.amount)
            .ok_or(StoreError::InvalidAmount)?;
        self.writes
            .accounts
            .insert(account.id, Some(account.clone()));
        Ok(account)
    }

    async fn delete_account(&mut self, id: i64) -> Result<(), StoreError> {
        self.locked_account(id).await?;
        let referenced = self.visible_entries().values().any(|e| e.account_id == id)
            || self
                .visible_transfers()
                .values()
                .any(|t| t.from_account_id == id || t.to_account_id == id);
        if referenced {
            return Err(StoreError::ForeignKeyViolation(format!(
                "delete on table \"accounts\" violates foreign key constraint: account {id} is still referenced"
            )));
        }
        self.writes.accounts.insert(id, None);
        Ok(())
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, StoreError> {
        self.require_account(arg.account_id, "entries_account_id_fkey")?;
        let entry = Entry {
            id: self.next_id(|s| &mut s.entry),
            account_id: arg.account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.writes.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError> {
        self.visible_entries()
            .remove(&id)
            .ok_or_else(|| StoreError::NotFound(format!("entry {id}")))
    }

    async fn list_entries(&mut self, arg: ListEntriesParams) -> Result<Vec<Entry>, StoreError> {
        let rows = self
            .visible_entries()
            .into_values()
            .filter(|e| e.account_id == arg.account_id);
        Ok(page(rows, arg.limit, arg.offset))
    }

    async fn create_transfer(
        &mut self,
        arg: CreateTransferParams,
    ) -> Result<Transfer, StoreError> {
        self.require_account(arg.from_account_id, "transfers_from_account_id_fkey")?;
        self.require_account(arg.to_account_id, "transfers_to_account_id_fkey")?;
        if arg.amount <= 0 {
            return Err(StoreError::InvalidAmount);
        }
        let transfer = Transfer {
            id: self.next_id(|s| &mut s.transfer),
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.writes.transfers.insert(transfer.id, transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        self.visible_transfers()
            .remove(&id)
            .ok_or_else(|| StoreError::NotFound(format!("transfer {id}")))
    }

    async fn list_transfers(
        &mut self,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError> {
        let (a, b) = (arg.from_account_id, arg.to_account_id);
        let rows = self.visible_transfers().into_values().filter(|t| {
            (t.from_account_id == a && t.to_account_id == b)
                || (t.from_account_id == b && t.to_account_id == a)
        });
        Ok(page(rows, arg.limit, arg.offset))
    }

    async fn create_user(&mut self, arg: CreateUserParams) -> Result<User, StoreError> {
        let users = self.visible_users();
        if users.contains_key(&arg.username) {
            return Err(StoreError::UniqueViolation(format!(
                "duplicate key value violates unique constraint \"users_pkey\": {}",
                arg.username
            )));
        }
        if users.values().any(|u| u.email == arg.email) {
            return Err(StoreError::UniqueViolation(format!(
                "duplicate key value violates unique constraint \"users_email_key\": {}",
                arg.email
            )));
        }

        let user = User {
            username: arg.username,
            hashed_password: arg.hashed_password,
            full_name: arg.full_name,
            email: arg.email,
            is_email_verified: false,
            password_changed_at: zero_time(),
            created_at: Utc::now(),
        };
        self.writes.new_users.insert(user.username.clone());
        self.writes
            .users
            .insert(user.username.clone(), user.clone());
        Ok(user)
    }

    async fn get_user(&mut self, username: &str) -> Result<User, StoreError> {
        self.visible_user(username)
            .ok_or_else(|| StoreError::NotFound(format!("user {username}")))
    }

    async fn update_user(&mut self, arg: UpdateUserParams) -> Result<User, StoreError> {
        self.lock(RowKey::User(arg.username.clone())).await;
        let mut user = self
            .visible_user(&arg.username)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", arg.username)))?;

        if let Some(email) = arg.email {
            let taken = self
                .visible_users()
                .values()
                .any(|u| u.email == email && u.username != user.username);
            if taken {
                return Err(StoreError::UniqueViolation(format!(
                    "duplicate key value violates unique constraint \"users_email_key\": {email}"
                )));
            }
            user.email = email;
        }
        if let Some(hashed_password) = arg.hashed_password {
            user.hashed_password = hashed_password;
        }
        if let Some(changed_at) = arg.password_changed_at {
            user.password_changed_at = changed_at;
        }
        if let Some(full_name) = arg.full_name {
            user.full_name = full_name;
        }
        if let Some(verified) = arg.is_email_verified {
            user.is_email_verified = verified;
        }

        self.writes
            .users
            .insert(user.username.clone(), user.clone());
        Ok(user)
    }

    async fn create_verify_email(
        &mut self,
        arg: CreateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError> {
        self.require_user(&arg.username, "verify_emails_username_fkey")?;
        let now = Utc::now();
        let verify_email = VerifyEmail {
            id: self.next_id(|s| &mut s.verify_email),
            username: arg.username,
            email: arg.email,
            secret_code: arg.secret_code,
            is_used: false,
            created_at: now,
            expired_at: now + Duration::minutes(VERIFY_EMAIL_TTL_MINUTES),
        };
        self.writes
            .verify_emails
            .insert(verify_email.id, verify_email.clone());
        Ok(verify_email)
    }

    async fn update_verify_email(
        &mut self,
        arg: UpdateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError> {
        self.lock(RowKey::VerifyEmail(arg.id)).await;
        let not_found = || StoreError::NotFound(format!("verify email {}", arg.id));

        let mut verify_email = self.visible_verify_email(arg.id).ok_or_else(not_found)?;
        if verify_email.secret_code != arg.secret_code
            || verify_email.is_used
            || verify_email.is_expired_at(Utc::now())
        {
            return Err(not_found());
        }

        verify_email.is_used = true;
        self.writes
            .verify_emails
            .insert(verify_email.id, verify_email.clone());
        Ok(verify_email)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Currency;
    use std::time::Duration as StdDuration;

    fn user_params(name: &str) -> CreateUserParams {
        CreateUserParams {
            username: name.to_string(),
            hashed_password: "hash".to_string(),
            full_name: name.to_uppercase(),
            email: format!("{name}@example.com"),
        }
    }

    async fn seed(backend: &MemoryBackend, balances: &[i64]) -> Vec<i64> {
        let mut tx = backend.begin().await.unwrap();
        let mut ids = Vec::new();
        for (i, balance) in balances.iter().enumerate() {
            let name = format!("user{i}");
            tx.create_user(user_params(&name)).await.unwrap();
            let account = tx
                .create_account(CreateAccountParams {
                    owner: name,
                    balance: *balance,
                    currency: Currency::USD,
                })
                .await
                .unwrap();
            ids.push(account.id);
        }
        tx.commit().await.unwrap();
        ids
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_invisible() {
        let backend = MemoryBackend::new();
        let ids = seed(&backend, &[100]).await;

        let mut writer = backend.begin().await.unwrap();
        writer
            .add_account_balance(AddAccountBalanceParams {
                id: ids[0],
                amount: 50,
            })
            .await
            .unwrap();
        assert_eq!(writer.get_account(ids[0]).await.unwrap().balance, 150);

        let mut reader = backend.begin().await.unwrap();
        assert_eq!(reader.get_account(ids[0]).await.unwrap().balance, 100);

        writer.commit().await.unwrap();
        assert_eq!(reader.get_account(ids[0]).await.unwrap().balance, 150);
    }

    #[tokio::test]
    async fn test_locked_read_blocks_until_holder_ends() {
        let backend = MemoryBackend::new();
        let ids = seed(&backend, &[100]).await;
        let id = ids[0];

        let mut holder = backend.begin().await.unwrap();
        holder.get_account_for_update(id).await.unwrap();
        holder
            .add_account_balance(AddAccountBalanceParams { id, amount: -30 })
            .await
            .unwrap();

        let contender = {
            let backend = backend.clone();
            tokio::spawn(async move {
                let mut tx = backend.begin().await.unwrap();
                let account = tx.get_account_for_update(id).await.unwrap();
                tx.commit().await.unwrap();
                account
            })
        };

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(!contender.is_finished(), "lock must block the contender");

        holder.commit().await.unwrap();
        let seen = tokio::time::timeout(StdDuration::from_secs(1), contender)
            .await
            .expect("contender should proceed after commit")
            .unwrap();
        // The contender reads the committed value, not its stale snapshot
        assert_eq!(seen.balance, 70);
    }

    #[tokio::test]
    async fn test_add_account_balance_locks_but_skips_funds_check() {
        let backend = MemoryBackend::new();
        let ids = seed(&backend, &[10]).await;
        let id = ids[0];

        let mut tx = backend.begin().await.unwrap();
        let account = tx
            .add_account_balance(AddAccountBalanceParams { id, amount: -25 })
            .await
            .unwrap();
        assert_eq!(account.balance, -15);
        assert_eq!(tx.locked_accounts(), vec![id]);

        let mut other = backend.begin().await.unwrap();
        let blocked =
            tokio::time::timeout(StdDuration::from_millis(50), other.get_account_for_update(id))
                .await;
        assert!(blocked.is_err(), "row must stay locked until commit");
    }

    #[tokio::test]
    async fn test_rolled_back_inserts_leave_id_gaps() {
        let backend = MemoryBackend::new();
        let ids = seed(&backend, &[100]).await;

        let mut aborted = backend.begin().await.unwrap();
        let lost = aborted
            .create_entry(CreateEntryParams {
                account_id: ids[0],
                amount: -5,
            })
            .await
            .unwrap();
        aborted.rollback().await.unwrap();

        let mut tx = backend.begin().await.unwrap();
        let kept = tx
            .create_entry(CreateEntryParams {
                account_id: ids[0],
                amount: -5,
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(kept.id, lost.id + 1);
        assert_eq!(backend.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_foreign_key_checks() {
        let backend = MemoryBackend::new();
        let mut tx = backend.begin().await.unwrap();

        let err = tx
            .create_account(CreateAccountParams {
                owner: "ghost".into(),
                balance: 0,
                currency: Currency::EUR,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ForeignKeyViolation(_)));

        let err = tx
            .create_transfer(CreateTransferParams {
                from_account_id: 1,
                to_account_id: 2,
                amount: 10,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ForeignKeyViolation(_)));
    }

    #[tokio::test]
    async fn test_unique_owner_currency() {
        let backend = MemoryBackend::new();
        let ids = seed(&backend, &[0]).await;
        assert_eq!(ids.len(), 1);

        let mut tx = backend.begin().await.unwrap();
        let err = tx
            .create_account(CreateAccountParams {
                owner: "user0".into(),
                balance: 0,
                currency: Currency::USD,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));

        // Another currency is fine
        tx.create_account(CreateAccountParams {
            owner: "user0".into(),
            balance: 0,
            currency: Currency::RMB,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_delete_account_rules() {
        let backend = MemoryBackend::new();
        let ids = seed(&backend, &[10, 20]).await;

        let mut tx = backend.begin().await.unwrap();
        tx.create_entry(CreateEntryParams {
            account_id: ids[0],
            amount: 1,
        })
        .await
        .unwrap();
        let err = tx.delete_account(ids[0]).await.unwrap_err();
        assert!(matches!(err, StoreError::ForeignKeyViolation(_)));

        tx.delete_account(ids[1]).await.unwrap();
        assert!(matches!(
            tx.get_account(ids[1]).await,
            Err(StoreError::NotFound(_))
        ));
        tx.commit().await.unwrap();
        assert!(backend.committed_account(ids[1]).is_none());
    }

    #[tokio::test]
    async fn test_listing_pages_by_id() {
        let backend = MemoryBackend::new();
        let ids = seed(&backend, &[100, 100]).await;

        let mut tx = backend.begin().await.unwrap();
        for _ in 0..4 {
            tx.create_transfer(CreateTransferParams {
                from_account_id: ids[0],
                to_account_id: ids[1],
                amount: 1,
            })
            .await
            .unwrap();
            tx.create_transfer(CreateTransferParams {
                from_account_id: ids[1],
                to_account_id: ids[0],
                amount: 2,
            })
            .await
            .unwrap();
        }

        let page1 = tx
            .list_transfers(ListTransfersParams {
                from_account_id: ids[0],
                to_account_id: ids[1],
                limit: 5,
                offset: 0,
            })
            .await
            .unwrap();
        let page2 = tx
            .list_transfers(ListTransfersParams {
                from_account_id: ids[0],
                to_account_id: ids[1],
                limit: 5,
                offset: 5,
            })
            .await
            .unwrap();
        assert_eq!(page1.len(), 5);
        assert_eq!(page2.len(), 3);
        assert!(page1.windows(2).all(|w| w[0].id < w[1].id));
        assert!(page1.last().unwrap().id < page2[0].id);
    }

    #[tokio::test]
    async fn test_verify_email_single_use() {
        let backend = MemoryBackend::new();
        let mut tx = backend.begin().await.unwrap();
        tx.create_user(user_params("carol")).await.unwrap();
        let ve = tx
            .create_verify_email(CreateVerifyEmailParams {
                username: "carol".into(),
                email: "carol@example.com".into(),
                secret_code: "s3cret".into(),
            })
            .await
            .unwrap();
        assert!(!ve.is_used);

        let wrong = tx
            .update_verify_email(UpdateVerifyEmailParams {
                id: ve.id,
                secret_code: "nope".into(),
            })
            .await;
        assert!(matches!(wrong, Err(StoreError::NotFound(_))));

        let used = tx
            .update_verify_email(UpdateVerifyEmailParams {
                id: ve.id,
                secret_code: "s3cret".into(),
            })
            .await
            .unwrap();
        assert!(used.is_used);

        let again = tx
            .update_verify_email(UpdateVerifyEmailParams {
                id: ve.id,
                secret_code: "s3cret".into(),
            })
            .await;
        assert!(matches!(again, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_racing_user_inserts_second_commit_fails() {
        let backend = MemoryBackend::new();
        let mut first = backend.begin().await.unwrap();
        let mut second = backend.begin().await.unwrap();

        first.create_user(user_params("dave")).await.unwrap();
        let mut other = user_params("dave");
        other.full_name = "Impostor".into();
        other.email = "impostor@example.com".into();
        second.create_user(other).await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)), "got {err:?}");

        let mut tx = backend.begin().await.unwrap();
        assert_eq!(tx.get_user("dave").await.unwrap().full_name, "DAVE");
    }

    #[tokio::test]
    async fn test_entry_on_concurrently_deleted_account_fails_commit() {
        let backend = MemoryBackend::new();
        let ids = seed(&backend, &[10, 20]).await;

        let mut deleter = backend.begin().await.unwrap();
        let mut writer = backend.begin().await.unwrap();
        writer
            .create_entry(CreateEntryParams {
                account_id: ids[1],
                amount: 5,
            })
            .await
            .unwrap();
        deleter.delete_account(ids[1]).await.unwrap();

        deleter.commit().await.unwrap();
        let err = writer.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::ForeignKeyViolation(_)), "got {err:?}");
        assert_eq!(backend.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_after_concurrent_entry_commit_fails() {
        let backend = MemoryBackend::new();
        let ids = seed(&backend, &[10]).await;

        let mut deleter = backend.begin().await.unwrap();
        let mut writer = backend.begin().await.unwrap();
        deleter.delete_account(ids[0]).await.unwrap();
        writer
            .create_entry(CreateEntryParams {
                account_id: ids[0],
                amount: 5,
            })
            .await
            .unwrap();

        writer.commit().await.unwrap();
        let err = deleter.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::ForeignKeyViolation(_)), "got {err:?}");
        assert!(backend.committed_account(ids[0]).is_some());
    }

    #[tokio::test]
    async fn test_row_locks_are_dropped_once_released() {
        let backend = MemoryBackend::new();
        let ids = seed(&backend, &[10, 20]).await;
        let lock_count = || backend.shared.row_locks().len();

        let mut tx = backend.begin().await.unwrap();
        tx.get_account_for_update(ids[0]).await.unwrap();
        tx.get_account_for_update(ids[1]).await.unwrap();
        assert_eq!(lock_count(), 2);
        tx.commit().await.unwrap();
        assert_eq!(lock_count(), 0);

        let mut tx = backend.begin().await.unwrap();
        tx.get_account_for_update(ids[0]).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(lock_count(), 0);

        let mut tx = backend.begin().await.unwrap();
        tx.get_account_for_update(ids[1]).await.unwrap();
        drop(tx);
        assert_eq!(lock_count(), 0);
    }

    #[tokio::test]
    async fn test_row_lock_survives_while_contended() {
        let backend = MemoryBackend::new();
        let ids = seed(&backend, &[10]).await;
        let id = ids[0];

        let mut holder = backend.begin().await.unwrap();
        holder.get_account_for_update(id).await.unwrap();
        let waiter = {
            let backend = backend.clone();
            tokio::spawn(async move {
                let mut tx = backend.begin().await.unwrap();
                tx.get_account_for_update(id).await.unwrap();
                tx.commit().await.unwrap();
            })
        };
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        // The waiter still needs the same lock after the holder lets go
        holder.commit().await.unwrap();
        tokio::time::timeout(StdDuration::from_secs(1), waiter)
            .await
            .expect("waiter should get the lock")
            .unwrap();
        assert_eq!(backend.shared.row_locks().len(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_lock_wait_leaves_no_row_lock() {
        let backend = MemoryBackend::new();
        let ids = seed(&backend, &[10]).await;
        let id = ids[0];

        let mut holder = backend.begin().await.unwrap();
        holder.get_account_for_update(id).await.unwrap();

        let mut waiter = backend.begin().await.unwrap();
        {
            let wait = waiter.get_account_for_update(id);
            tokio::pin!(wait);
            assert!(futures::poll!(&mut wait).is_pending());
            // Released while the waiter still holds its clone
            holder.commit().await.unwrap();
            assert_eq!(backend.shared.row_locks().len(), 1);
        }

        waiter.rollback().await.unwrap();
        assert_eq!(backend.shared.row_locks().len(), 0);
    }

    #[tokio::test]
    async fn test_rollback_failure_injection_is_one_shot() {
        let backend = MemoryBackend::new();
        backend.fail_next_rollback();

        let tx = backend.begin().await.unwrap();
        assert!(tx.rollback().await.is_err());

        let tx = backend.begin().await.unwrap();
        assert!(tx.rollback().await.is_ok());
    }
}
