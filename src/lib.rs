//! txncoord - An embedded two-phase-commit transaction coordinator
//!
//! This crate gives independent, in-process resource managers a shared
//! commit/abort boundary. Commit follows the two-phase-commit protocol and
//! visits participants in a global sort-key order; savepoints provide
//! partial rollback; a retry loop re-runs work that failed with a
//! retryable error.

pub mod config;
pub mod transaction;
pub mod utils;

pub use config::Config;
pub use transaction::{
    ResourceManager, Savepoint, Synchronizer, ThreadTransactionManager, Transaction,
    TransactionError, TransactionManager, TransactionResult, TransactionStatus,
};
