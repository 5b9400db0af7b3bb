//! Durable per-account balance store.
//!
//! Every balance mutation is either a guarded conditional decrement or an
//! unconditional credit, applied as a single SQL statement so concurrent
//! sessions and webhook handlers stay linearizable per account.

mod referrals;
mod store;
mod transactions;

pub use store::{Account, LedgerDb};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient balance")]
    InsufficientFunds,
    #[error("account {0} not found")]
    AccountNotFound(i64),
    #[error("no {0} item available")]
    NoItem(&'static str),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;
