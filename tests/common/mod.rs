//! Shared fixtures for the in-memory integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use simple_bank::account::{Account, CreateAccountParams, Currency};
use simple_bank::db::MemoryBackend;
use simple_bank::store::Store;
use simple_bank::user::models::{CreateUserParams, User};

static NEXT_USER: AtomicUsize = AtomicUsize::new(0);

pub fn new_store() -> Store<MemoryBackend> {
    Store::new(MemoryBackend::new())
}

pub fn user_params() -> CreateUserParams {
    let n = NEXT_USER.fetch_add(1, Ordering::Relaxed);
    let username = format!("user{n}");
    CreateUserParams {
        email: format!("{username}@example.com"),
        full_name: format!("User {n}"),
        hashed_password: "secret-hash".to_string(),
        username,
    }
}

pub async fn create_user(store: &Store<MemoryBackend>) -> User {
    store.create_user(user_params()).await.unwrap()
}

pub async fn create_account(store: &Store<MemoryBackend>, balance: i64) -> Account {
    let user = create_user(store).await;
    store
        .create_account(CreateAccountParams {
            owner: user.username,
            balance,
            currency: Currency::USD,
        })
        .await
        .unwrap()
}
