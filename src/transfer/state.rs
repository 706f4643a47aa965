//! Transfer attempt states
//!
//! Every attempt moves forward through the happy path or drops to
//! `Aborted` at any gate. Nothing between `Started` and a terminal state is
//! visible outside the transaction.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferTxState {
    /// Transaction open, transfer and entry rows inserted
    Started,

    /// Both account rows locked, lower id first
    LocksAcquired,

    /// Source balance covers the amount
    FundsChecked,

    /// Both deltas applied
    BalancesUpdated,

    /// Terminal: transaction committed
    Committed,

    /// Terminal: rolled back, no row survives
    Aborted,
}

impl TransferTxState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferTxState::Committed | TransferTxState::Aborted)
    }

    /// Next state on the happy path. Terminal states have none.
    pub fn next(&self) -> Option<Self> {
        match self {
            TransferTxState::Started => Some(TransferTxState::LocksAcquired),
            TransferTxState::LocksAcquired => Some(TransferTxState::FundsChecked),
            TransferTxState::FundsChecked => Some(TransferTxState::BalancesUpdated),
            TransferTxState::BalancesUpdated => Some(TransferTxState::Committed),
            TransferTxState::Committed | TransferTxState::Aborted => None,
        }
    }

    /// Whether `self -> to` is a legal transition
    pub fn can_transition_to(&self, to: TransferTxState) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == TransferTxState::Aborted || self.next() == Some(to)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferTxState::Started => "STARTED",
            TransferTxState::LocksAcquired => "LOCKS_ACQUIRED",
            TransferTxState::FundsChecked => "FUNDS_CHECKED",
            TransferTxState::BalancesUpdated => "BALANCES_UPDATED",
            TransferTxState::Committed => "COMMITTED",
            TransferTxState::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for TransferTxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
