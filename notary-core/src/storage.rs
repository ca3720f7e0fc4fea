//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `boxes` - Ledgers (key: notary || nym || account-or-nym || box type)
//! - `receipts` - Full box receipts (key: ledger key || transaction number)
//! - `contexts` - Per-(notary, nym) contexts (key: notary || nym)
//! - `nyms` - Registered public keys (key: nym)
//! - `accounts` - Asset accounts (key: account)
//! - `units` - Unit definitions (key: instrument definition)
//! - `numbers` - Issued transaction number -> owning nym
//! - `cron` - Active cron items (key: item id)
//! - `meta` - Counters

use crate::config::StorageConfig;
use crate::cron::CronItem;
use crate::error::{Error, Result};
use crate::ledger::{Ledger, LedgerKey};
use crate::transaction::Transaction;
use crate::types::{Account, AccountId, InstrumentDefinitionId, NotaryId, NymId, TransactionNumber, UnitDefinition};
use parking_lot::Mutex;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::sync::Arc;

const CF_BOXES: &str = "boxes";
const CF_RECEIPTS: &str = "receipts";
const CF_CONTEXTS: &str = "contexts";
const CF_NYMS: &str = "nyms";
const CF_ACCOUNTS: &str = "accounts";
const CF_UNITS: &str = "units";
const CF_NUMBERS: &str = "numbers";
const CF_CRON: &str = "cron";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: [&str; 9] = [
    CF_BOXES,
    CF_RECEIPTS,
    CF_CONTEXTS,
    CF_NYMS,
    CF_ACCOUNTS,
    CF_UNITS,
    CF_NUMBERS,
    CF_CRON,
    CF_META,
];

const KEY_NUMBER_COUNTER: &[u8] = b"transaction_number_counter";

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
    // Serialises allocation from the transaction-number counter
    counter_lock: Mutex<()>,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage").field("path", &self.db.path()).finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let path = &config.data_dir;
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = ?path,
            column_families = COLUMN_FAMILIES.len(),
            "Opened RocksDB"
        );

        Ok(Self {
            db: Arc::new(db),
            counter_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        match name {
            // Receipts are written once and rarely read back
            CF_RECEIPTS => opts.set_compression_type(rocksdb::DBCompressionType::Zstd),
            CF_NUMBERS | CF_NYMS => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
            }
            _ => opts.set_compression_type(rocksdb::DBCompressionType::Lz4),
        }
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn put<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.cf_handle(cf)?;
        let value = bincode::serialize(value)?;
        self.db.put_cf(cf, key, value)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(cf)?;
        match self.db.get_cf(cf, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn delete(&self, cf: &str, key: &[u8]) -> Result<()> {
        let cf = self.cf_handle(cf)?;
        self.db.delete_cf(cf, key)?;
        Ok(())
    }

    fn pair_key(notary_id: &NotaryId, nym_id: &NymId) -> Vec<u8> {
        let mut key = notary_id.as_bytes().to_vec();
        key.extend_from_slice(nym_id.as_bytes());
        key
    }

    fn receipt_key(key: &LedgerKey, number: TransactionNumber) -> Vec<u8> {
        let mut bytes = key.storage_key();
        bytes.extend_from_slice(&number.to_be_bytes());
        bytes
    }

    // Ledger operations

    /// Put ledger
    pub fn put_ledger(&self, ledger: &Ledger) -> Result<()> {
        self.put(CF_BOXES, &ledger.key().storage_key(), ledger)?;
        tracing::debug!(ledger = %ledger.key(), entries = ledger.len(), "Ledger saved");
        Ok(())
    }

    /// Get ledger
    pub fn get_ledger(&self, key: &LedgerKey) -> Result<Option<Ledger>> {
        self.get(CF_BOXES, &key.storage_key())
    }

    /// Delete ledger
    pub fn delete_ledger(&self, key: &LedgerKey) -> Result<()> {
        self.delete(CF_BOXES, &key.storage_key())
    }

    /// Put full box receipt
    pub fn put_box_receipt(&self, key: &LedgerKey, receipt: &Transaction) -> Result<()> {
        self.put(CF_RECEIPTS, &Self::receipt_key(key, receipt.number), receipt)
    }

    /// Get full box receipt
    pub fn get_box_receipt(&self, key: &LedgerKey, number: TransactionNumber) -> Result<Option<Transaction>> {
        self.get(CF_RECEIPTS, &Self::receipt_key(key, number))
    }

    /// Delete full box receipt
    pub fn delete_box_receipt(&self, key: &LedgerKey, number: TransactionNumber) -> Result<()> {
        self.delete(CF_RECEIPTS, &Self::receipt_key(key, number))
    }

    // Context operations

    /// Put the context of a (notary, nym) pair
    pub fn put_context<T: Serialize>(&self, notary_id: &NotaryId, nym_id: &NymId, context: &T) -> Result<()> {
        self.put(CF_CONTEXTS, &Self::pair_key(notary_id, nym_id), context)
    }

    /// Get the context of a (notary, nym) pair
    pub fn get_context<T: DeserializeOwned>(&self, notary_id: &NotaryId, nym_id: &NymId) -> Result<Option<T>> {
        self.get(CF_CONTEXTS, &Self::pair_key(notary_id, nym_id))
    }

    /// Delete the context of a (notary, nym) pair
    pub fn delete_context(&self, notary_id: &NotaryId, nym_id: &NymId) -> Result<()> {
        self.delete(CF_CONTEXTS, &Self::pair_key(notary_id, nym_id))
    }

    // Nym operations

    /// Register a nym's public key
    pub fn put_nym(&self, nym_id: &NymId, public_key: &[u8; 32]) -> Result<()> {
        self.put(CF_NYMS, nym_id.as_bytes(), public_key)
    }

    /// Get a nym's public key
    pub fn get_nym(&self, nym_id: &NymId) -> Result<Option<[u8; 32]>> {
        self.get(CF_NYMS, nym_id.as_bytes())
    }

    /// Remove a nym
    pub fn delete_nym(&self, nym_id: &NymId) -> Result<()> {
        self.delete(CF_NYMS, nym_id.as_bytes())
    }

    // Account operations

    /// Put account
    pub fn put_account(&self, account: &Account) -> Result<()> {
        self.put(CF_ACCOUNTS, account.account_id.as_bytes(), account)
    }

    /// Get account
    pub fn get_account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        self.get(CF_ACCOUNTS, account_id.as_bytes())
    }

    /// Delete account
    pub fn delete_account(&self, account_id: &AccountId) -> Result<()> {
        self.delete(CF_ACCOUNTS, account_id.as_bytes())
    }

    /// Accounts owned by a nym
    pub fn accounts_of(&self, nym_id: &NymId) -> Result<Vec<Account>> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        let mut accounts = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let account: Account = bincode::deserialize(&value)?;
            if account.nym_id == *nym_id {
                accounts.push(account);
            }
        }
        Ok(accounts)
    }

    // Unit definition operations

    /// Put unit definition
    pub fn put_unit(&self, unit: &UnitDefinition) -> Result<InstrumentDefinitionId> {
        let id = unit.id()?;
        self.put(CF_UNITS, id.as_bytes(), unit)?;
        Ok(id)
    }

    /// Get unit definition
    pub fn get_unit(&self, id: &InstrumentDefinitionId) -> Result<Option<UnitDefinition>> {
        self.get(CF_UNITS, id.as_bytes())
    }

    // Transaction number operations

    /// Allocate `count` fresh transaction numbers and record `owner` as
    /// their holder in one atomic batch.
    pub fn allocate_numbers(&self, count: usize, owner: &NymId) -> Result<Vec<TransactionNumber>> {
        let _guard = self.counter_lock.lock();

        let last: TransactionNumber = self.get(CF_META, KEY_NUMBER_COUNTER)?.unwrap_or(0);
        let numbers = (1..=count as TransactionNumber)
            .map(|i| {
                last.checked_add(i)
                    .ok_or_else(|| Error::Storage("Transaction numbers exhausted".to_string()))
            })
            .collect::<Result<Vec<TransactionNumber>>>()?;
        let next_last = numbers.last().copied().unwrap_or(last);

        let mut batch = WriteBatch::default();
        let cf_meta = self.cf_handle(CF_META)?;
        batch.put_cf(cf_meta, KEY_NUMBER_COUNTER, bincode::serialize(&next_last)?);

        let cf_numbers = self.cf_handle(CF_NUMBERS)?;
        let owner_bytes = bincode::serialize(owner)?;
        for number in &numbers {
            if let Some(holder) = self.number_owner(*number)? {
                tracing::error!(number, holder = %holder, nym_id = %owner, "Number counter behind issued numbers");
                return Err(Error::NumberAlreadyIssuedElsewhere { number: *number, owner: holder });
            }
            batch.put_cf(cf_numbers, number.to_be_bytes(), &owner_bytes);
        }

        self.db.write(batch)?;

        tracing::debug!(nym_id = %owner, count, last = next_last, "Allocated transaction numbers");
        Ok(numbers)
    }

    /// Allocate one number that is not issued to any nym (reply notices)
    pub fn allocate_unowned_number(&self) -> Result<TransactionNumber> {
        let _guard = self.counter_lock.lock();
        let last: TransactionNumber = self.get(CF_META, KEY_NUMBER_COUNTER)?.unwrap_or(0);
        let number = last
            .checked_add(1)
            .ok_or_else(|| Error::Storage("Transaction numbers exhausted".to_string()))?;
        self.put(CF_META, KEY_NUMBER_COUNTER, &number)?;
        Ok(number)
    }

    /// Nym currently holding an issued number
    pub fn number_owner(&self, number: TransactionNumber) -> Result<Option<NymId>> {
        self.get(CF_NUMBERS, &number.to_be_bytes())
    }

    /// Forget the holder of a closed number
    pub fn release_number(&self, number: TransactionNumber) -> Result<()> {
        self.delete(CF_NUMBERS, &number.to_be_bytes())
    }

    // Cron operations

    /// Store an active cron item under its id
    pub fn put_cron_item(&self, id: TransactionNumber, item: &CronItem) -> Result<()> {
        self.put(CF_CRON, &id.to_be_bytes(), item)
    }

    /// Get an active cron item
    pub fn get_cron_item(&self, id: TransactionNumber) -> Result<Option<CronItem>> {
        self.get(CF_CRON, &id.to_be_bytes())
    }

    /// Remove a cron item
    pub fn delete_cron_item(&self, id: TransactionNumber) -> Result<()> {
        self.delete(CF_CRON, &id.to_be_bytes())
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        drop(self.db);
        tracing::info!("RocksDB closed gracefully");
        Ok(())
    }
}
