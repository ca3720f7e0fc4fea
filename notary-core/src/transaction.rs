//! Transactions, receipts and notices
//!
//! A `Transaction` is a single signed entry inside a ledger. Boxes store
//! entries either in full or abbreviated to a summary plus hash; an
//! abbreviated entry becomes usable for amounts only after it has been
//! hydrated with the matching box receipt.

use crate::crypto::Signer;
use crate::types::{
    Account, AccountId, Amount, Armored, Identifier, NotaryId, NymId, OriginType, Party,
    RequestNumber, SignedBy, TransactionNumber,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Type tag of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    /// Incoming or outgoing transfer awaiting the recipient
    Pending,
    /// Sender's receipt for a transfer the recipient processed
    TransferReceipt,
    /// Receipt for a deposited cheque
    ChequeReceipt,
    /// Receipt closing a cron item for one party
    FinalReceipt,
    /// Receipt for a payment-plan payment
    PaymentReceipt,
    /// Cron item activation notice
    Notice,
    /// Copy of a server reply
    ReplyNotice,
    /// Nym-to-nym message
    MessageNotice,
    /// Nym-to-nym payment instrument
    InstrumentNotice,
    /// Response item accepting a box entry
    AcceptItem,
    /// Response item rejecting a box entry
    RejectItem,
    /// Account-to-account transfer request
    Transfer,
    /// Cron item activation request
    ActivateCronItem,
    /// Cron item cancellation request
    CancelCronItem,
    /// Inbox processing request
    ProcessInbox,
    /// Nymbox processing request
    ProcessNymbox,
}

impl TransactionType {
    /// Pending transfer
    pub fn is_pending(&self) -> bool {
        matches!(self, TransactionType::Pending)
    }

    /// Finished receipt
    pub fn is_receipt(&self) -> bool {
        matches!(
            self,
            TransactionType::TransferReceipt
                | TransactionType::ChequeReceipt
                | TransactionType::FinalReceipt
                | TransactionType::PaymentReceipt
        )
    }

    /// Notice
    pub fn is_notice(&self) -> bool {
        matches!(
            self,
            TransactionType::Notice
                | TransactionType::ReplyNotice
                | TransactionType::MessageNotice
                | TransactionType::InstrumentNotice
        )
    }

    /// Entries that may be placed into a box
    pub fn is_box_entry(&self) -> bool {
        self.is_pending() || self.is_receipt() || self.is_notice()
    }

    /// Request kinds whose opening number closes as soon as they complete
    pub fn closes_on_completion(&self) -> bool {
        matches!(
            self,
            TransactionType::CancelCronItem | TransactionType::ProcessInbox
        )
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionType::Pending => "pending",
            TransactionType::TransferReceipt => "transferReceipt",
            TransactionType::ChequeReceipt => "chequeReceipt",
            TransactionType::FinalReceipt => "finalReceipt",
            TransactionType::PaymentReceipt => "paymentReceipt",
            TransactionType::Notice => "notice",
            TransactionType::ReplyNotice => "replyNotice",
            TransactionType::MessageNotice => "message",
            TransactionType::InstrumentNotice => "instrumentNotice",
            TransactionType::AcceptItem => "acceptItem",
            TransactionType::RejectItem => "rejectItem",
            TransactionType::Transfer => "transfer",
            TransactionType::ActivateCronItem => "activateCronItem",
            TransactionType::CancelCronItem => "cancelCronItem",
            TransactionType::ProcessInbox => "processInbox",
            TransactionType::ProcessNymbox => "processNymbox",
        };
        write!(f, "{}", name)
    }
}

/// Signed assertion of a nym's complete outstanding state
///
/// `issued` is the issued set as it will stand once the enclosing
/// transaction completes; `balance` likewise for account transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceStatement {
    /// Notary
    pub notary_id: NotaryId,
    /// Nym making the statement
    pub nym_id: NymId,
    /// Account, for account transactions
    pub account_id: Option<AccountId>,
    /// Number opening the enclosing transaction
    pub opening_number: Option<TransactionNumber>,
    /// Every number that remains issued afterwards
    pub issued: BTreeSet<TransactionNumber>,
    /// Account balance afterwards
    pub balance: Option<Amount>,
}

/// Outcome of a transaction, carried on notarize/processInbox replies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResponse {
    /// Opening number of the request
    pub number: TransactionNumber,
    /// Whether the balance statement matched
    pub balance_agreement_success: bool,
    /// Whether the transaction itself succeeded
    pub success: bool,
    /// Account state after the transaction
    pub account: Option<Account>,
    /// Reason for a failure
    pub reason: Option<String>,
}

/// A single ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Notary
    pub notary_id: NotaryId,
    /// Owner of the box this entry lives in, or requesting nym
    pub nym_id: NymId,
    /// Account, for account boxes and requests
    pub account_id: Option<AccountId>,
    /// This entry's own number
    pub number: TransactionNumber,
    /// Number this entry responds to or represents
    pub reference: TransactionNumber,
    /// Number removed from the issued set when a final receipt is accepted
    pub closing_number: Option<TransactionNumber>,
    /// Type tag
    pub kind: TransactionType,
    /// Sender display fields
    pub sender: Option<Party>,
    /// Recipient display fields
    pub recipient: Option<Party>,
    /// Amount moved
    pub amount: Amount,
    /// Signing time
    pub date_signed: DateTime<Utc>,
    /// Success flag for receipts and notices
    pub success: bool,
    /// Cancellation flag
    pub cancelled: bool,
    /// Side of an agreement this entry belongs to
    pub origin: OriginType,
    /// Request number of the reply carried by a reply notice
    pub request_number: Option<RequestNumber>,
    /// Referenced payload (reply message, instrument, cron item, text)
    pub attachment: Armored,
    /// Balance statement of a request
    pub statement: Option<BalanceStatement>,
    /// Signature over the canonical bytes
    pub signature: Option<SignedBy>,
}

impl Transaction {
    /// New unsigned transaction with neutral defaults
    pub fn new(
        notary_id: NotaryId,
        nym_id: NymId,
        kind: TransactionType,
        number: TransactionNumber,
    ) -> Self {
        Self {
            notary_id,
            nym_id,
            account_id: None,
            number,
            reference: 0,
            closing_number: None,
            kind,
            sender: None,
            recipient: None,
            amount: 0,
            date_signed: Utc::now(),
            success: true,
            cancelled: false,
            origin: OriginType::None,
            request_number: None,
            attachment: Armored::default(),
            statement: None,
            signature: None,
        }
    }

    /// Response item for a box entry being accepted or rejected
    pub fn create_response(original: &Transaction, accept: bool) -> Self {
        let kind = if accept {
            TransactionType::AcceptItem
        } else {
            TransactionType::RejectItem
        };
        let mut response = Transaction::new(original.notary_id, original.nym_id, kind, original.number);
        response.account_id = original.account_id;
        response.reference = original.number;
        response.closing_number = original.closing_number;
        response.amount = original.amount;
        response.origin = original.origin;
        response
    }

    /// Bytes covered by the signature
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        Ok(bincode::serialize(&unsigned)?)
    }

    /// Sign in place
    pub fn sign(&mut self, signer: &dyn Signer) -> Result<()> {
        self.date_signed = Utc::now();
        let bytes = self.canonical_bytes()?;
        self.signature = Some(signer.sign_detached(&bytes));
        Ok(())
    }

    /// Verify the attached signature
    pub fn verify(&self) -> Result<()> {
        let signature = self.signature.as_ref().ok_or_else(|| {
            Error::SignatureInvalid(format!("Transaction {} is unsigned", self.number))
        })?;
        signature.verify(&self.canonical_bytes()?)
    }

    /// Verify the signature and that it was made by `expected`
    pub fn verify_signer(&self, expected: &NymId) -> Result<()> {
        self.verify()?;
        match &self.signature {
            Some(signed) if signed.nym_id() == *expected => Ok(()),
            _ => Err(Error::SignatureInvalid(format!(
                "Transaction {} not signed by {}",
                self.number, expected
            ))),
        }
    }

    /// Hash of the full receipt, signature included
    pub fn hash(&self) -> Result<Identifier> {
        Ok(Identifier::digest(&bincode::serialize(self)?))
    }

    /// Summary form stored in boxes
    pub fn abbreviate(&self) -> Result<AbbreviatedReceipt> {
        Ok(AbbreviatedReceipt {
            number: self.number,
            reference: self.reference,
            kind: self.kind,
            closing_number: self.closing_number,
            request_number: self.request_number,
            unverified_amount: self.amount,
            date_signed: self.date_signed,
            hash: self.hash()?,
        })
    }
}

/// Summary of a box receipt; only the hash is authoritative
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbbreviatedReceipt {
    /// Entry number
    pub number: TransactionNumber,
    /// Reference number
    pub reference: TransactionNumber,
    /// Type tag
    pub kind: TransactionType,
    /// Closing number, for final receipts
    pub closing_number: Option<TransactionNumber>,
    /// Request number, for reply notices
    pub request_number: Option<RequestNumber>,
    /// Amount as claimed by the summary
    pub unverified_amount: Amount,
    /// Signing time
    pub date_signed: DateTime<Utc>,
    /// Hash of the full receipt
    pub hash: Identifier,
}

/// A box entry in abbreviated or full form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoxEntry {
    /// Summary awaiting its box receipt
    Abbreviated(AbbreviatedReceipt),
    /// Complete signed receipt
    Full(Box<Transaction>),
}

impl BoxEntry {
    /// Wrap a full transaction
    pub fn full(transaction: Transaction) -> Self {
        BoxEntry::Full(Box::new(transaction))
    }

    /// Entry number
    pub fn number(&self) -> TransactionNumber {
        match self {
            BoxEntry::Abbreviated(summary) => summary.number,
            BoxEntry::Full(transaction) => transaction.number,
        }
    }

    /// Reference number
    pub fn reference(&self) -> TransactionNumber {
        match self {
            BoxEntry::Abbreviated(summary) => summary.reference,
            BoxEntry::Full(transaction) => transaction.reference,
        }
    }

    /// Type tag
    pub fn kind(&self) -> TransactionType {
        match self {
            BoxEntry::Abbreviated(summary) => summary.kind,
            BoxEntry::Full(transaction) => transaction.kind,
        }
    }

    /// Closing number
    pub fn closing_number(&self) -> Option<TransactionNumber> {
        match self {
            BoxEntry::Abbreviated(summary) => summary.closing_number,
            BoxEntry::Full(transaction) => transaction.closing_number,
        }
    }

    /// Request number of a reply notice
    pub fn request_number(&self) -> Option<RequestNumber> {
        match self {
            BoxEntry::Abbreviated(summary) => summary.request_number,
            BoxEntry::Full(transaction) => transaction.request_number,
        }
    }

    /// Whether the box receipt still has to be fetched
    pub fn is_abbreviated(&self) -> bool {
        matches!(self, BoxEntry::Abbreviated(_))
    }

    /// Full transaction, if hydrated
    pub fn as_full(&self) -> Option<&Transaction> {
        match self {
            BoxEntry::Abbreviated(_) => None,
            BoxEntry::Full(transaction) => Some(transaction),
        }
    }

    /// Amount, only once backed by a signed receipt
    pub fn verified_amount(&self) -> Option<Amount> {
        self.as_full().map(|transaction| transaction.amount)
    }

    /// Hash of the receipt this entry stands for
    pub fn receipt_hash(&self) -> Result<Identifier> {
        match self {
            BoxEntry::Abbreviated(summary) => Ok(summary.hash),
            BoxEntry::Full(transaction) => transaction.hash(),
        }
    }

    /// Summary form of this entry
    pub fn abbreviate(&self) -> Result<BoxEntry> {
        match self {
            BoxEntry::Abbreviated(summary) => Ok(BoxEntry::Abbreviated(summary.clone())),
            BoxEntry::Full(transaction) => Ok(BoxEntry::Abbreviated(transaction.abbreviate()?)),
        }
    }

    /// Replace a summary with its box receipt.
    ///
    /// The receipt must carry the same number, hash to the summarised value
    /// and bear a valid signature.
    pub fn hydrate(self, receipt: Transaction) -> Result<BoxEntry> {
        let summary = match self {
            BoxEntry::Full(_) => return Ok(self),
            BoxEntry::Abbreviated(summary) => summary,
        };

        if receipt.number != summary.number {
            return Err(Error::InvalidTransaction(format!(
                "Box receipt {} does not match entry {}",
                receipt.number, summary.number
            )));
        }
        if receipt.hash()? != summary.hash {
            return Err(Error::SignatureInvalid(format!(
                "Box receipt {} hash mismatch",
                receipt.number
            )));
        }
        receipt.verify()?;

        Ok(BoxEntry::full(receipt))
    }
}
