//! Money-moving orchestration between sessions, the ledger, and the
//! payment gateway.

mod coordinator;

pub use coordinator::{SettlementCoordinator, SettlementError};
