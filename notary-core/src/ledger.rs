//! Ledgers (boxes and response ledgers)
//!
//! A ledger holds the entries of one box, keyed by transaction number, for a
//! single (notary, nym, account-or-nym, box type) key.
//!
//! # Lifecycle
//!
//! - **Empty**: freshly constructed, no entries, unsigned
//! - **Populated**: loaded or filled through `add_transaction`
//! - **Finalized**: signed; any further mutation fails with
//!   `Error::LedgerFinalized`. `reopen` yields a new, unsigned ledger.
//!
//! Response ledgers are built with `create_response` and finalized with a
//! balance statement by `finalize_response`; that signed artifact is what a
//! client submits with processInbox and processNymbox.

use crate::crypto::Signer;
use crate::storage::Storage;
use crate::transaction::{BalanceStatement, BoxEntry, Transaction, TransactionType};
use crate::types::{AccountId, BoxType, Identifier, NotaryId, NymId, RequestNumber, SignedBy, TransactionNumber};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Storage key of a ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerKey {
    /// Notary
    pub notary_id: NotaryId,
    /// Owning nym
    pub nym_id: NymId,
    /// Account for account-scoped boxes; nym-scoped boxes have none
    pub account_id: Option<AccountId>,
    /// Box type
    pub box_type: BoxType,
}

impl LedgerKey {
    /// Nymbox of a nym
    pub fn nymbox(notary_id: NotaryId, nym_id: NymId) -> Self {
        Self::nym_box(notary_id, nym_id, BoxType::Nymbox)
    }

    /// Any nym-scoped box
    pub fn nym_box(notary_id: NotaryId, nym_id: NymId, box_type: BoxType) -> Self {
        Self {
            notary_id,
            nym_id,
            account_id: None,
            box_type,
        }
    }

    /// Any account-scoped box
    pub fn account_box(notary_id: NotaryId, nym_id: NymId, account_id: AccountId, box_type: BoxType) -> Self {
        Self {
            notary_id,
            nym_id,
            account_id: Some(account_id),
            box_type,
        }
    }

    /// Account ID, or the nym ID for nym-scoped boxes
    pub fn scope(&self) -> Identifier {
        match self.account_id {
            Some(account_id) => *account_id.identifier(),
            None => *self.nym_id.identifier(),
        }
    }

    /// Key bytes: notary || nym || scope || box type
    pub fn storage_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(97);
        key.extend_from_slice(self.notary_id.as_bytes());
        key.extend_from_slice(self.nym_id.as_bytes());
        key.extend_from_slice(self.scope().as_bytes());
        key.push(self.box_type as u8);
        key
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {:?}", self.box_type, self.scope())
    }
}

/// Whether a ledger is a box or a response to one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerRole {
    /// Box holding entries
    Box,
    /// Response items answering a box
    Response,
}

/// Lifecycle state of a ledger instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerState {
    /// No entries, unsigned
    Empty,
    /// Entries present, unsigned
    Populated,
    /// Signed and immutable
    Finalized,
}

/// Ordered collection of box entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    key: LedgerKey,
    role: LedgerRole,
    entries: BTreeMap<TransactionNumber, BoxEntry>,
    statement: Option<BalanceStatement>,
    signature: Option<SignedBy>,
}

#[derive(Serialize)]
struct LedgerBody<'a> {
    key: &'a LedgerKey,
    role: LedgerRole,
    entries: &'a BTreeMap<TransactionNumber, BoxEntry>,
    statement: &'a Option<BalanceStatement>,
}

impl Ledger {
    /// Empty box
    pub fn new(key: LedgerKey) -> Self {
        Self {
            key,
            role: LedgerRole::Box,
            entries: BTreeMap::new(),
            statement: None,
            signature: None,
        }
    }

    /// Load a stored ledger.
    ///
    /// With `verify` the ledger signature and the signature of every full
    /// entry are checked; without it the check done at save time is trusted.
    pub fn load(storage: &Storage, key: &LedgerKey, verify: bool) -> Result<Self> {
        let ledger = storage
            .get_ledger(key)?
            .ok_or_else(|| Error::NotFound(format!("Ledger {}", key)))?;

        if verify {
            ledger.verify()?;
        }

        tracing::debug!(ledger = %key, entries = ledger.len(), verify, "Ledger loaded");
        Ok(ledger)
    }

    /// Load a stored ledger, or start an empty one
    pub fn load_or_new(storage: &Storage, key: &LedgerKey) -> Result<Self> {
        match Self::load(storage, key, false) {
            Ok(ledger) => Ok(ledger),
            Err(Error::NotFound(_)) => Ok(Self::new(*key)),
            Err(e) => Err(e),
        }
    }

    /// Persist this ledger
    pub fn save(&self, storage: &Storage) -> Result<()> {
        storage.put_ledger(self)
    }

    /// Key
    pub fn key(&self) -> &LedgerKey {
        &self.key
    }

    /// Role
    pub fn role(&self) -> LedgerRole {
        self.role
    }

    /// Lifecycle state
    pub fn state(&self) -> LedgerState {
        if self.signature.is_some() {
            LedgerState::Finalized
        } else if self.entries.is_empty() {
            LedgerState::Empty
        } else {
            LedgerState::Populated
        }
    }

    /// Balance statement of a finalized response
    pub fn statement(&self) -> Option<&BalanceStatement> {
        self.statement.as_ref()
    }

    /// Signer of a finalized ledger
    pub fn signer(&self) -> Option<NymId> {
        self.signature.as_ref().map(SignedBy::nym_id)
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.signature.is_some() {
            return Err(Error::LedgerFinalized(self.key.to_string()));
        }
        Ok(())
    }

    /// Insert a full transaction under its number
    pub fn add_transaction(&mut self, transaction: Transaction) -> Result<()> {
        self.add_entry(BoxEntry::full(transaction))
    }

    /// Insert an entry under its number
    pub fn add_entry(&mut self, entry: BoxEntry) -> Result<()> {
        self.ensure_mutable()?;
        let number = entry.number();
        if self.entries.contains_key(&number) {
            tracing::error!(ledger = %self.key, number, "Duplicate transaction number in ledger");
            return Err(Error::DuplicateNumber(number));
        }
        self.entries.insert(number, entry);
        Ok(())
    }

    /// Remove an entry
    pub fn remove(&mut self, number: TransactionNumber) -> Result<BoxEntry> {
        self.ensure_mutable()?;
        self.entries
            .remove(&number)
            .ok_or_else(|| Error::NotFound(format!("Transaction {} in {}", number, self.key)))
    }

    /// Replace an abbreviated entry with its verified box receipt
    pub fn hydrate(&mut self, receipt: Transaction) -> Result<()> {
        self.ensure_mutable()?;
        let number = receipt.number;
        let entry = self
            .entries
            .remove(&number)
            .ok_or_else(|| Error::NotFound(format!("Transaction {} in {}", number, self.key)))?;

        match entry.clone().hydrate(receipt) {
            Ok(hydrated) => {
                self.entries.insert(number, hydrated);
                Ok(())
            }
            Err(e) => {
                self.entries.insert(number, entry);
                Err(e)
            }
        }
    }

    /// Empty response ledger for the same notary, nym and account
    pub fn create_response(original: &Ledger) -> Self {
        Self {
            key: original.key,
            role: LedgerRole::Response,
            entries: BTreeMap::new(),
            statement: None,
            signature: None,
        }
    }

    /// Append the balance statement and sign.
    ///
    /// Call only after every intended response item has been added.
    pub fn finalize_response(&mut self, statement: BalanceStatement, signer: &dyn Signer) -> Result<()> {
        self.ensure_mutable()?;
        if self.role != LedgerRole::Response {
            return Err(Error::InvalidTransaction(format!(
                "{} is not a response ledger",
                self.key
            )));
        }
        if statement.nym_id != self.key.nym_id || statement.notary_id != self.key.notary_id {
            return Err(Error::InvalidTransaction(
                "Balance statement belongs to another nym or notary".to_string(),
            ));
        }
        if signer.nym_id() != self.key.nym_id {
            return Err(Error::SignatureInvalid(format!(
                "{} cannot finalize a response for {}",
                signer.nym_id(),
                self.key.nym_id
            )));
        }

        self.statement = Some(statement);
        self.sign(signer)
    }

    /// Sign the current contents, finalizing the ledger
    pub fn sign(&mut self, signer: &dyn Signer) -> Result<()> {
        self.ensure_mutable()?;
        let bytes = self.canonical_bytes()?;
        self.signature = Some(signer.sign_detached(&bytes));
        Ok(())
    }

    /// New unsigned ledger with the same contents
    pub fn reopen(self) -> Self {
        Self {
            signature: None,
            ..self
        }
    }

    fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let body = LedgerBody {
            key: &self.key,
            role: self.role,
            entries: &self.entries,
            statement: &self.statement,
        };
        Ok(bincode::serialize(&body)?)
    }

    /// Verify the ledger signature and every full entry
    pub fn verify(&self) -> Result<()> {
        let signature = self
            .signature
            .as_ref()
            .ok_or_else(|| Error::SignatureInvalid(format!("{} is unsigned", self.key)))?;
        signature.verify(&self.canonical_bytes()?)?;

        for entry in self.entries.values() {
            if let Some(transaction) = entry.as_full() {
                transaction.verify()?;
            }
        }
        Ok(())
    }

    /// Verify and check the signer
    pub fn verify_signer(&self, expected: &NymId) -> Result<()> {
        self.verify()?;
        match self.signer() {
            Some(signer) if signer == *expected => Ok(()),
            _ => Err(Error::SignatureInvalid(format!(
                "{} not signed by {}",
                self.key, expected
            ))),
        }
    }

    /// Hash over the signed contents
    pub fn hash(&self) -> Result<Identifier> {
        Ok(Identifier::digest(&self.canonical_bytes()?))
    }

    /// Copy with every entry abbreviated, unsigned
    pub fn abbreviated(&self) -> Result<Self> {
        let entries = self
            .entries
            .iter()
            .map(|(number, entry)| Ok((*number, entry.abbreviate()?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self {
            key: self.key,
            role: self.role,
            entries,
            statement: self.statement.clone(),
            signature: None,
        })
    }

    /// Entry at position `index` in number order
    pub fn get_transaction_by_index(&self, index: usize) -> Option<&BoxEntry> {
        self.entries.values().nth(index)
    }

    /// Entry with the given number
    pub fn get_transaction_by_id(&self, number: TransactionNumber) -> Option<&BoxEntry> {
        self.entries.get(&number)
    }

    /// Whether an entry with the given number exists
    pub fn contains(&self, number: TransactionNumber) -> bool {
        self.entries.contains_key(&number)
    }

    /// Entries in number order
    pub fn entries(&self) -> impl Iterator<Item = &BoxEntry> {
        self.entries.values()
    }

    /// Entries that still need their box receipt
    pub fn abbreviated_numbers(&self) -> Vec<TransactionNumber> {
        self.entries
            .values()
            .filter(|entry| entry.is_abbreviated())
            .map(BoxEntry::number)
            .collect()
    }

    /// Reply notice carrying the reply to `request_number`
    pub fn find_reply_notice(&self, request_number: RequestNumber) -> Option<&BoxEntry> {
        self.entries.values().find(|entry| {
            entry.kind() == TransactionType::ReplyNotice
                && entry.request_number() == Some(request_number)
        })
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
