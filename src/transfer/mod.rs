//! Money Transfer Engine
//!
//! Moves funds between two accounts inside one database transaction.
//!
//! # State Machine
//!
//! ```text
//! STARTED → LOCKS_ACQUIRED → FUNDS_CHECKED → BALANCES_UPDATED → COMMITTED
//!    ↓            ↓                ↓                ↓
//!                            ABORTED (rolled back)
//! ```
//!
//! Coordination happens only through row locks in the store. The engine
//! keeps no balances in memory between calls.

pub mod engine;
pub mod state;
pub mod types;


pub use engine::{check_sufficient_funds, execute_transfer};
pub use state::TransferTxState;
pub use types::{
    CreateTransferParams, ListTransfersParams, Transfer, TransferTxParams, TransferTxResult,
};
