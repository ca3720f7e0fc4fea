//! Property-based tests for transaction-number and ledger invariants
//!
//! These tests use proptest to verify:
//! - Pool subset: available ⊆ issued after any sequence of operations
//! - Harvest idempotence: harvesting twice equals harvesting once
//! - Closed numbers never return to the pool
//! - Ledger round-trip through storage, abbreviated and full entries alike
//! - No double issue: allocated numbers have exactly one owner

use notary_core::{
    BoxEntry, BoxType, KeyPair, Ledger, LedgerKey, NotaryId, NymId, Signer, Storage, StorageConfig,
    Transaction, TransactionNumber, TransactionNumberPool, TransactionType,
};
use proptest::prelude::*;
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
enum PoolOp {
    Issue(usize),
    Reserve(usize),
    Harvest(usize, bool),
    Consume(usize),
    Close(usize),
}

/// Strategy for generating pool operations; indices select among issued numbers
fn pool_op_strategy() -> impl Strategy<Value = PoolOp> {
    prop_oneof![
        (1usize..6).prop_map(PoolOp::Issue),
        (0usize..4).prop_map(PoolOp::Reserve),
        (0usize..16, any::<bool>()).prop_map(|(i, retry)| PoolOp::Harvest(i, retry)),
        (0usize..16).prop_map(PoolOp::Consume),
        (0usize..16).prop_map(PoolOp::Close),
    ]
}

/// Strategy for generating box entry kinds
fn entry_kind_strategy() -> impl Strategy<Value = TransactionType> {
    prop_oneof![
        Just(TransactionType::Pending),
        Just(TransactionType::TransferReceipt),
        Just(TransactionType::FinalReceipt),
        Just(TransactionType::Notice),
        Just(TransactionType::ReplyNotice),
        Just(TransactionType::MessageNotice),
        Just(TransactionType::InstrumentNotice),
    ]
}

fn pick(set: &BTreeSet<TransactionNumber>, index: usize) -> Option<TransactionNumber> {
    if set.is_empty() {
        None
    } else {
        set.iter().nth(index % set.len()).copied()
    }
}

fn test_storage() -> (Storage, tempfile::TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        data_dir: temp_dir.path().to_path_buf(),
        ..StorageConfig::default()
    };
    (Storage::open(&config).unwrap(), temp_dir)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: available stays a subset of issued and closed numbers never return
    #[test]
    fn prop_pool_subset_invariant(ops in prop::collection::vec(pool_op_strategy(), 1..60)) {
        let mut pool = TransactionNumberPool::new();
        let mut next: TransactionNumber = 1;
        let mut closed = BTreeSet::new();

        for op in ops {
            match op {
                PoolOp::Issue(count) => {
                    let fresh: Vec<_> = (next..next + count as i64).collect();
                    next += count as i64;
                    prop_assert_eq!(pool.issue(fresh), count);
                }
                PoolOp::Reserve(count) => {
                    let before = pool.count();
                    match pool.reserve(count) {
                        Ok(reserved) => {
                            prop_assert_eq!(reserved.len(), count);
                            prop_assert_eq!(pool.count(), before - count);
                        }
                        Err(e) => {
                            prop_assert!(e.is_recoverable());
                            prop_assert_eq!(pool.count(), before);
                        }
                    }
                }
                PoolOp::Harvest(index, retry) => {
                    if let Some(number) = pick(pool.issued(), index) {
                        pool.harvest([number], retry);
                    }
                }
                PoolOp::Consume(index) => {
                    if let Some(number) = pick(pool.available(), index) {
                        prop_assert!(pool.consume(number).is_ok());
                    }
                }
                PoolOp::Close(index) => {
                    if let Some(number) = pick(pool.issued(), index) {
                        prop_assert!(pool.close(number));
                        closed.insert(number);
                    }
                }
            }

            prop_assert!(pool.check_invariant());
            for number in &closed {
                prop_assert!(!pool.is_issued(*number));
                prop_assert!(!pool.is_available(*number));
            }
        }

        // Harvesting closed numbers changes nothing
        let snapshot = pool.clone();
        pool.harvest(closed.iter().copied(), true);
        prop_assert_eq!(pool, snapshot);
    }

    /// Property: harvest with retry is idempotent
    #[test]
    fn prop_harvest_idempotent(
        issued in 1usize..30,
        reserve in 0usize..30,
        picks in prop::collection::vec(0usize..30, 0..10),
    ) {
        let mut pool = TransactionNumberPool::new();
        pool.issue(1..=issued as TransactionNumber);
        let reserved = pool.reserve(reserve.min(issued)).unwrap();

        let harvest: Vec<_> = picks
            .iter()
            .filter_map(|index| pick(&reserved, *index))
            .collect();

        let mut once = pool.clone();
        once.harvest(harvest.iter().copied(), true);
        let mut twice = once.clone();
        twice.harvest(harvest.iter().copied(), true);

        prop_assert_eq!(once.available(), twice.available());
        prop_assert_eq!(once.issued(), pool.issued());
    }

    /// Property: Load(Save(ledger)) == ledger, abbreviated and full entries alike
    #[test]
    fn prop_ledger_roundtrip(
        entries in prop::collection::btree_map(1i64..10_000, (entry_kind_strategy(), any::<bool>(), -1_000i64..1_000), 0..12),
        signed in any::<bool>(),
    ) {
        let (storage, _temp) = test_storage();
        let notary = KeyPair::from_seed(&[1u8; 32]);
        let key = LedgerKey::nymbox(NotaryId::from_public_key(&notary.public_key()), NymId::digest(b"nym"));

        let mut ledger = Ledger::new(key);
        for (number, (kind, abbreviated, amount)) in &entries {
            let mut transaction = Transaction::new(key.notary_id, key.nym_id, *kind, *number);
            transaction.amount = *amount;
            transaction.reference = number / 2;
            if *kind == TransactionType::FinalReceipt {
                transaction.closing_number = Some(number + 1);
            }
            if *kind == TransactionType::ReplyNotice {
                transaction.request_number = Some(*number);
            }
            transaction.sign(&notary).unwrap();

            let entry = BoxEntry::full(transaction);
            let entry = if *abbreviated { entry.abbreviate().unwrap() } else { entry };
            ledger.add_entry(entry).unwrap();
        }
        if signed {
            ledger.sign(&notary).unwrap();
        }

        ledger.save(&storage).unwrap();
        let loaded = Ledger::load(&storage, &key, signed).unwrap();
        prop_assert_eq!(&loaded, &ledger);
        prop_assert_eq!(loaded.state(), ledger.state());
        prop_assert_eq!(
            loaded.abbreviated_numbers().len(),
            entries.values().filter(|(_, abbreviated, _)| *abbreviated).count()
        );
    }

    /// Property: no number is ever allocated to two nyms
    #[test]
    fn prop_no_double_issue(requests in prop::collection::vec((0usize..4, 1usize..20), 1..15)) {
        let (storage, _temp) = test_storage();
        let nyms: Vec<NymId> = (0u8..4).map(|i| NymId::digest(&[i])).collect();

        let mut seen = BTreeSet::new();
        for (nym_index, count) in requests {
            let owner = nyms[nym_index];
            for number in storage.allocate_numbers(count, &owner).unwrap() {
                prop_assert!(seen.insert(number), "number {} issued twice", number);
                prop_assert_eq!(storage.number_owner(number).unwrap(), Some(owner));
            }
        }
    }
}

#[test]
fn test_load_missing_ledger_is_not_found() {
    let (storage, _temp) = test_storage();
    let key = LedgerKey::nym_box(NotaryId::digest(b"notary"), NymId::digest(b"nym"), BoxType::PaymentInbox);
    assert!(matches!(
        Ledger::load(&storage, &key, true),
        Err(notary_core::Error::NotFound(_))
    ));
    assert!(Ledger::load_or_new(&storage, &key).unwrap().is_empty());
}
