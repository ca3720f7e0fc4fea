//! Notary Core
//!
//! Transaction-number lifecycle and ledger model shared by the notary server
//! and its clients.
//!
//! # Architecture
//!
//! - **Number pool**: per (notary, nym) issued and available sets
//! - **Ledgers**: signed boxes of receipts and notices, abbreviated or full
//! - **Messages**: signed requests and replies with acknowledged-reply sets
//! - **Storage**: RocksDB column families with bincode values
//!
//! # Invariants
//!
//! - `available ⊆ issued` for every pool
//! - A number is issued to at most one nym per notary
//! - Closed numbers never return
//! - A finalized ledger is never mutated

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod cron;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod message;
pub mod metrics;
pub mod pool;
pub mod storage;
pub mod transaction;
pub mod types;

// Re-exports
pub use config::StorageConfig;
pub use cron::{CronItem, CronItemKind, CronParty};
pub use crypto::{KeyPair, Signer};
pub use error::{Error, Result};
pub use ledger::{Ledger, LedgerKey, LedgerRole, LedgerState};
pub use message::{Message, MessageType};
pub use metrics::Metrics;
pub use pool::TransactionNumberPool;
pub use storage::Storage;
pub use transaction::{
    AbbreviatedReceipt, BalanceStatement, BoxEntry, Transaction, TransactionResponse,
    TransactionType,
};
pub use types::{
    Account, AccountId, Amount, Armored, BoxType, Identifier, InstrumentDefinitionId, NotaryId,
    NymId, OriginType, Party, RequestNumber, Signature, SignedBy, TransactionNumber,
    UnitDefinition,
};
