//! Error types for the notary protocol

use crate::types::{NymId, RequestNumber, TransactionNumber};
use thiserror::Error;

/// Result type for notary operations
pub type Result<T> = std::result::Result<T, Error>;

/// Notary protocol errors
#[derive(Error, Debug)]
pub enum Error {
    /// Not enough available transaction numbers to reserve
    #[error("Insufficient transaction numbers: needed {needed}, available {available}")]
    InsufficientNumbers {
        /// Numbers requested
        needed: usize,
        /// Numbers currently available
        available: usize,
    },

    /// Transaction number already present where it must be unique
    #[error("Duplicate transaction number: {0}")]
    DuplicateNumber(TransactionNumber),

    /// Number is issued to a different nym at this notary
    #[error("Transaction number {number} already issued to {owner}")]
    NumberAlreadyIssuedElsewhere {
        /// Offending number
        number: TransactionNumber,
        /// Nym currently holding it
        owner: NymId,
    },

    /// Reply does not belong to the request being awaited
    #[error("Message ID mismatch: {0}")]
    MessageIdMismatch(String),

    /// No sent message or reply notice for this request number
    #[error("Reply not found for request {0}")]
    ReplyNotFound(RequestNumber),

    /// No reply was received
    #[error("No reply received for request {0}")]
    NoReply(RequestNumber),

    /// Signature verification failed
    #[error("Signature verification failed: {0}")]
    SignatureInvalid(String),

    /// A per-nym lock could not be acquired
    #[error("Lock failure: {0}")]
    LockFailure(String),

    /// Requested object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Ledger was already signed and can no longer change
    #[error("Ledger is finalized: {0}")]
    LedgerFinalized(String),

    /// Malformed or semantically invalid transaction
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    /// Protocol sequencing violated
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation needs a freshly downloaded nymbox
    #[error("Nymbox is stale: {0}")]
    StaleNymbox(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Armor decoding error
    #[error("Encoding error: {0}")]
    Encoding(#[from] base64::DecodeError),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Integrity violations that must abort the surrounding operation
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::DuplicateNumber(_)
                | Error::NumberAlreadyIssuedElsewhere { .. }
                | Error::SignatureInvalid(_)
                | Error::LockFailure(_)
        )
    }

    /// Conditions the caller recovers from by requesting numbers or harvesting
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::InsufficientNumbers { .. } | Error::NoReply(_) | Error::ReplyNotFound(_)
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::DuplicateNumber(5).is_fatal());
        assert!(Error::LockFailure("timeout".into()).is_fatal());
        assert!(!Error::DuplicateNumber(5).is_recoverable());

        let insufficient = Error::InsufficientNumbers {
            needed: 2,
            available: 1,
        };
        assert!(insufficient.is_recoverable());
        assert!(!insufficient.is_fatal());
        assert!(Error::NoReply(7).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::InsufficientNumbers {
            needed: 3,
            available: 0,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient transaction numbers: needed 3, available 0"
        );
    }
}
