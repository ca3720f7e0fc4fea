//! Signed request and reply messages
//!
//! Every exchange between a nym and a notary is one `Message`. Requests carry
//! the client's request number and its acknowledged-reply set; replies carry
//! the same command with `Response` appended to its wire name.

use crate::crypto::Signer;
use crate::types::{AccountId, Armored, Identifier, NotaryId, NymId, RequestNumber, SignedBy, TransactionNumber};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Command carried by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageType {
    /// Connectivity check
    PingNotary,
    /// Register a nym's public key
    RegisterNym,
    /// Remove a nym
    UnregisterNym,
    /// Fetch another nym's public key
    CheckNym,
    /// Register a server contract
    RegisterContract,
    /// Register a unit definition
    RegisterInstrumentDefinition,
    /// Ask which unit definitions exist
    QueryInstrumentDefinitions,
    /// Issue a basket currency
    IssueBasket,
    /// Open an asset account
    RegisterAccount,
    /// Close an empty asset account
    UnregisterAccount,
    /// Fetch a full box receipt
    GetBoxReceipt,
    /// Fetch account, inbox and outbox
    GetAccountData,
    /// Submit a transaction
    NotarizeTransaction,
    /// Fetch the nymbox
    GetNymbox,
    /// Fetch a unit definition
    GetInstrumentDefinition,
    /// Fetch a cash mint
    GetMint,
    /// Accept or reject inbox entries
    ProcessInbox,
    /// Accept nymbox entries
    ProcessNymbox,
    /// Trigger a smart-contract clause
    TriggerClause,
    /// Market list
    GetMarketList,
    /// Market offers
    GetMarketOffers,
    /// Recent market trades
    GetMarketRecentTrades,
    /// A nym's market offers
    GetNymMarketOffers,
    /// Request server administration rights
    RequestAdmin,
    /// Add a claim to a nym
    AddClaim,
    /// Usage credits
    UsageCredits,
    /// Send a message to another nym
    SendNymMessage,
    /// Send a payment instrument to another nym
    SendNymInstrument,
    /// Resynchronise the request number
    GetRequestNumber,
    /// Ask for new transaction numbers
    GetTransactionNumbers,
}

impl MessageType {
    /// Every command, in wire order
    pub const ALL: [MessageType; 30] = [
        MessageType::PingNotary,
        MessageType::RegisterNym,
        MessageType::UnregisterNym,
        MessageType::CheckNym,
        MessageType::RegisterContract,
        MessageType::RegisterInstrumentDefinition,
        MessageType::QueryInstrumentDefinitions,
        MessageType::IssueBasket,
        MessageType::RegisterAccount,
        MessageType::UnregisterAccount,
        MessageType::GetBoxReceipt,
        MessageType::GetAccountData,
        MessageType::NotarizeTransaction,
        MessageType::GetNymbox,
        MessageType::GetInstrumentDefinition,
        MessageType::GetMint,
        MessageType::ProcessInbox,
        MessageType::ProcessNymbox,
        MessageType::TriggerClause,
        MessageType::GetMarketList,
        MessageType::GetMarketOffers,
        MessageType::GetMarketRecentTrades,
        MessageType::GetNymMarketOffers,
        MessageType::RequestAdmin,
        MessageType::AddClaim,
        MessageType::UsageCredits,
        MessageType::SendNymMessage,
        MessageType::SendNymInstrument,
        MessageType::GetRequestNumber,
        MessageType::GetTransactionNumbers,
    ];

    /// Wire name of the request
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::PingNotary => "pingNotary",
            MessageType::RegisterNym => "registerNym",
            MessageType::UnregisterNym => "unregisterNym",
            MessageType::CheckNym => "checkNym",
            MessageType::RegisterContract => "registerContract",
            MessageType::RegisterInstrumentDefinition => "registerInstrumentDefinition",
            MessageType::QueryInstrumentDefinitions => "queryInstrumentDefinitions",
            MessageType::IssueBasket => "issueBasket",
            MessageType::RegisterAccount => "registerAccount",
            MessageType::UnregisterAccount => "unregisterAccount",
            MessageType::GetBoxReceipt => "getBoxReceipt",
            MessageType::GetAccountData => "getAccountData",
            MessageType::NotarizeTransaction => "notarizeTransaction",
            MessageType::GetNymbox => "getNymbox",
            MessageType::GetInstrumentDefinition => "getInstrumentDefinition",
            MessageType::GetMint => "getMint",
            MessageType::ProcessInbox => "processInbox",
            MessageType::ProcessNymbox => "processNymbox",
            MessageType::TriggerClause => "triggerClause",
            MessageType::GetMarketList => "getMarketList",
            MessageType::GetMarketOffers => "getMarketOffers",
            MessageType::GetMarketRecentTrades => "getMarketRecentTrades",
            MessageType::GetNymMarketOffers => "getNymMarketOffers",
            MessageType::RequestAdmin => "requestAdmin",
            MessageType::AddClaim => "addClaim",
            MessageType::UsageCredits => "usageCredits",
            MessageType::SendNymMessage => "sendNymMessage",
            MessageType::SendNymInstrument => "sendNymInstrument",
            MessageType::GetRequestNumber => "getRequestNumber",
            MessageType::GetTransactionNumbers => "getTransactionNumbers",
        }
    }

    /// Wire name of the reply
    pub fn reply_name(&self) -> String {
        format!("{}Response", self.name())
    }

    /// Parse a request or reply wire name
    pub fn from_name(name: &str) -> Option<(Self, bool)> {
        let (base, is_reply) = match name.strip_suffix("Response") {
            Some(base) => (base, true),
            None => (name, false),
        };
        Self::ALL
            .iter()
            .find(|command| command.name() == base)
            .map(|command| (*command, is_reply))
    }

    /// Commands sent outside request-number sequencing
    pub fn is_unbuffered(&self) -> bool {
        matches!(
            self,
            MessageType::PingNotary | MessageType::RegisterNym | MessageType::GetRequestNumber
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Signed request or reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Command
    pub command: MessageType,
    /// Whether this is the reply to `command`
    pub is_reply: bool,
    /// Client-assigned request number
    pub request_number: RequestNumber,
    /// Notary
    pub notary_id: NotaryId,
    /// Sending nym (requests) or addressed nym (replies)
    pub nym_id: NymId,
    /// Target nym, when applicable
    pub nym_id2: Option<NymId>,
    /// Account, when applicable
    pub account_id: Option<AccountId>,
    /// Transaction number, when applicable
    pub transaction_number: TransactionNumber,
    /// Next request number (getRequestNumber reply)
    pub new_request_number: RequestNumber,
    /// Numeric selector; box type for getBoxReceipt
    pub depth: i64,
    /// Success flag of a reply
    pub success: bool,
    /// Main payload
    pub payload: Armored,
    /// Second payload
    pub payload2: Armored,
    /// Third payload
    pub payload3: Armored,
    /// Echo of the original request on replies
    pub in_reference_to: Armored,
    /// Nymbox hash
    pub nymbox_hash: Option<Identifier>,
    /// Inbox hash
    pub inbox_hash: Option<Identifier>,
    /// Outbox hash
    pub outbox_hash: Option<Identifier>,
    /// Request numbers whose replies the sender has already seen
    pub acknowledged_replies: BTreeSet<RequestNumber>,
    /// Public key (registerNym request, checkNym reply)
    pub public_key: Option<[u8; 32]>,
    /// Signature over the canonical bytes
    pub signature: Option<SignedBy>,
}

impl Message {
    /// New unsigned request
    pub fn request(
        command: MessageType,
        notary_id: NotaryId,
        nym_id: NymId,
        request_number: RequestNumber,
    ) -> Self {
        Self {
            command,
            is_reply: false,
            request_number,
            notary_id,
            nym_id,
            nym_id2: None,
            account_id: None,
            transaction_number: 0,
            new_request_number: 0,
            depth: 0,
            success: false,
            payload: Armored::default(),
            payload2: Armored::default(),
            payload3: Armored::default(),
            in_reference_to: Armored::default(),
            nymbox_hash: None,
            inbox_hash: None,
            outbox_hash: None,
            acknowledged_replies: BTreeSet::new(),
            public_key: None,
            signature: None,
        }
    }

    /// New unsigned reply to `original`, defaulting to failure
    pub fn reply_to(original: &Message) -> Self {
        let mut reply = Self::request(
            original.command,
            original.notary_id,
            original.nym_id,
            original.request_number,
        );
        reply.is_reply = true;
        reply.nym_id2 = original.nym_id2;
        reply.account_id = original.account_id;
        reply.transaction_number = original.transaction_number;
        reply.depth = original.depth;
        reply
    }

    /// Wire name of this message
    pub fn command_name(&self) -> String {
        if self.is_reply {
            self.command.reply_name()
        } else {
            self.command.name().to_string()
        }
    }

    /// Whether this message belongs to the given exchange
    pub fn matches(&self, request_number: RequestNumber, notary_id: &NotaryId, nym_id: &NymId) -> bool {
        self.request_number == request_number
            && self.notary_id == *notary_id
            && self.nym_id == *nym_id
    }

    /// Check that this message belongs to the given exchange
    pub fn expect_exchange(
        &self,
        request_number: RequestNumber,
        notary_id: &NotaryId,
        nym_id: &NymId,
    ) -> Result<()> {
        if self.matches(request_number, notary_id, nym_id) {
            Ok(())
        } else {
            Err(Error::MessageIdMismatch(format!(
                "{} #{} for {:?} at {:?}",
                self.command_name(),
                self.request_number,
                self.nym_id,
                self.notary_id
            )))
        }
    }

    /// Bytes covered by the signature
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        Ok(bincode::serialize(&unsigned)?)
    }

    /// Sign in place, replacing any previous signature
    pub fn sign(&mut self, signer: &dyn Signer) -> Result<()> {
        let bytes = self.canonical_bytes()?;
        self.signature = Some(signer.sign_detached(&bytes));
        Ok(())
    }

    /// Verify the signature and that it was made with `public_key`
    pub fn verify_with(&self, public_key: &[u8; 32]) -> Result<()> {
        let signature = self.signature.as_ref().ok_or_else(|| {
            Error::SignatureInvalid(format!("{} is unsigned", self.command_name()))
        })?;
        if signature.public_key != *public_key {
            return Err(Error::SignatureInvalid(format!(
                "{} signed by unexpected key {}",
                self.command_name(),
                signature.nym_id()
            )));
        }
        signature.verify(&self.canonical_bytes()?)
    }

    /// Whether a signature is attached
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }
}
