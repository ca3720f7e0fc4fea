//! Transaction-number pool for one (notary, nym) pair
//!
//! `issued` holds every number the nym must keep signing for; `available`
//! is the subset that may still open a new transaction. The pool never
//! lets `available` hold a number that is not issued.

use crate::types::TransactionNumber;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Issued and available transaction numbers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionNumberPool {
    issued: BTreeSet<TransactionNumber>,
    available: BTreeSet<TransactionNumber>,
}

impl TransactionNumberPool {
    /// Empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Add freshly issued numbers to both sets.
    ///
    /// Numbers already issued to this nym are skipped. Returns how many
    /// numbers were new.
    pub fn issue<I>(&mut self, numbers: I) -> usize
    where
        I: IntoIterator<Item = TransactionNumber>,
    {
        let mut added = 0;
        for number in numbers {
            if self.issued.insert(number) {
                self.available.insert(number);
                added += 1;
            } else {
                tracing::debug!(number, "Number already issued, skipping");
            }
        }
        added
    }

    /// Take `count` available numbers (lowest first) for a new instrument.
    ///
    /// The numbers stay issued until their transaction is closed.
    pub fn reserve(&mut self, count: usize) -> Result<BTreeSet<TransactionNumber>> {
        if self.available.len() < count {
            return Err(Error::InsufficientNumbers {
                needed: count,
                available: self.available.len(),
            });
        }

        let reserved: BTreeSet<TransactionNumber> =
            self.available.iter().take(count).copied().collect();
        for number in &reserved {
            self.available.remove(number);
        }

        tracing::debug!(?reserved, "Reserved transaction numbers");
        Ok(reserved)
    }

    /// Mark a specific number as used (notary side).
    pub fn consume(&mut self, number: TransactionNumber) -> Result<()> {
        if !self.available.remove(&number) {
            return Err(Error::InvalidTransaction(format!(
                "Transaction number {} is not available",
                number
            )));
        }
        Ok(())
    }

    /// Return numbers that were never consumed by the notary.
    ///
    /// With `for_retry` the numbers become available again; otherwise they
    /// stay issued but unusable until the caller resends the same
    /// instrument. Numbers that are no longer issued are ignored. Returns
    /// how many numbers became available.
    pub fn harvest<I>(&mut self, numbers: I, for_retry: bool) -> usize
    where
        I: IntoIterator<Item = TransactionNumber>,
    {
        let mut restored = 0;
        for number in numbers {
            if !self.issued.contains(&number) {
                tracing::warn!(number, "Refusing to harvest a number that is not issued");
                continue;
            }
            if for_retry && self.available.insert(number) {
                restored += 1;
            }
        }
        restored
    }

    /// Remove a number for good once its closing receipt is processed.
    pub fn close(&mut self, number: TransactionNumber) -> bool {
        self.available.remove(&number);
        self.issued.remove(&number)
    }

    /// Count of available numbers
    pub fn count(&self) -> usize {
        self.available.len()
    }

    /// Count of issued numbers
    pub fn issued_count(&self) -> usize {
        self.issued.len()
    }

    /// Issued numbers
    pub fn issued(&self) -> &BTreeSet<TransactionNumber> {
        &self.issued
    }

    /// Available numbers
    pub fn available(&self) -> &BTreeSet<TransactionNumber> {
        &self.available
    }

    /// Whether the number is issued
    pub fn is_issued(&self, number: TransactionNumber) -> bool {
        self.issued.contains(&number)
    }

    /// Whether the number is available
    pub fn is_available(&self, number: TransactionNumber) -> bool {
        self.available.contains(&number)
    }

    /// `available ⊆ issued`
    pub fn check_invariant(&self) -> bool {
        self.available.is_subset(&self.issued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(numbers: &[TransactionNumber]) -> TransactionNumberPool {
        let mut pool = TransactionNumberPool::new();
        pool.issue(numbers.iter().copied());
        pool
    }

    #[test]
    fn test_issue_skips_already_issued() {
        let mut pool = pool_with(&[5, 6]);
        assert_eq!(pool.issue([6, 7]), 1);
        assert_eq!(pool.issued_count(), 3);
        assert_eq!(pool.count(), 3);
    }

    #[test]
    fn test_reserve_one_of_three() {
        let mut pool = pool_with(&[5, 6, 7]);
        let reserved = pool.reserve(1).unwrap();

        assert_eq!(reserved.len(), 1);
        assert_eq!(pool.count(), 2);
        assert_eq!(pool.issued_count(), 3);
        for number in [5, 6, 7] {
            assert!(pool.is_issued(number));
        }
        assert!(pool.check_invariant());
    }

    #[test]
    fn test_reserve_insufficient() {
        let mut pool = pool_with(&[5]);
        match pool.reserve(2) {
            Err(Error::InsufficientNumbers { needed, available }) => {
                assert_eq!(needed, 2);
                assert_eq!(available, 1);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(pool.count(), 1);
    }

    #[test]
    fn test_harvest_for_retry_is_idempotent() {
        let mut pool = pool_with(&[5, 6, 7]);
        let reserved = pool.reserve(2).unwrap();

        assert_eq!(pool.harvest(reserved.iter().copied(), true), 2);
        let after_once = pool.available().clone();
        assert_eq!(pool.harvest(reserved.iter().copied(), true), 0);
        assert_eq!(pool.available(), &after_once);
    }

    #[test]
    fn test_harvest_without_retry_keeps_numbers_unavailable() {
        let mut pool = pool_with(&[5, 6]);
        let reserved = pool.reserve(1).unwrap();
        assert_eq!(pool.harvest(reserved.iter().copied(), false), 0);
        assert_eq!(pool.count(), 1);
        assert_eq!(pool.issued_count(), 2);
    }

    #[test]
    fn test_harvest_ignores_closed_numbers() {
        let mut pool = pool_with(&[5]);
        pool.reserve(1).unwrap();
        assert!(pool.close(5));
        assert_eq!(pool.harvest([5], true), 0);
        assert!(pool.check_invariant());
    }

    #[test]
    fn test_consume() {
        let mut pool = pool_with(&[9]);
        pool.consume(9).unwrap();
        assert!(pool.is_issued(9));
        assert!(!pool.is_available(9));
        assert!(pool.consume(9).is_err());
    }

    #[test]
    fn test_close_removes_from_both_sets() {
        let mut pool = pool_with(&[42]);
        assert!(pool.close(42));
        assert!(!pool.is_issued(42));
        assert!(!pool.is_available(42));
        assert!(!pool.close(42));
    }
}
