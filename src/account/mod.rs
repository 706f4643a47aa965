//! Accounts, entries and currencies

pub mod models;
pub mod validation;

pub use models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams, Currency, Entry,
    ListAccountsParams, ListEntriesParams, UpdateAccountParams, is_supported_currency,
};
pub use validation::ValidationError;
