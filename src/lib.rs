//! Simple Bank - ledger backend with atomic money transfers
//!
//! Accounts hold integer balances in a single currency. Every transfer is
//! one database transaction that writes a transfer record, a pair of
//! balancing entries and both balance updates, or nothing at all.
//!
//! # Modules
//!
//! - [`db`] - Storage backends (PostgreSQL, in-memory) and the transaction executor
//! - [`transfer`] - Transfer engine with ordered row locking
//! - [`account`] - Account and entry models, currency and ownership checks
//! - [`user`] - Users, e-mail verification and the create-user transaction
//! - [`store`] - Facade running every operation through the executor
//! - [`config`] - YAML configuration
//! - [`logging`] - Tracing setup

pub mod account;
pub mod config;
pub mod db;
pub mod logging;
pub mod store;
pub mod transfer;
pub mod user;

// Convenient re-exports at crate root
pub use account::{Account, Currency, Entry};
pub use config::AppConfig;
pub use db::{Database, MemoryBackend, PgBackend, Repository, StoreError, TxBackend};
pub use store::Store;
pub use transfer::{TransferTxParams, TransferTxResult, TransferTxState};
pub use user::{CreateUserTxParams, User};
