//! Core types for the notary protocol
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Memory safety (no unsafe code)
//! - Exact integer arithmetic for amounts

use crate::{Error, Result};
use base64::{engine::general_purpose, Engine};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Transaction number issued by a notary
pub type TransactionNumber = i64;

/// Client-assigned request number, monotonic per (notary, nym)
pub type RequestNumber = i64;

/// Amount in the smallest unit of an instrument definition
pub type Amount = i64;

/// Opaque content-addressed identifier (SHA-256)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier([u8; 32]);

impl Identifier {
    /// Wrap raw digest bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Digest arbitrary content into an identifier
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from a 64-character hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::Other(format!("Invalid hex: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Other("Identifier must be 32 bytes".to_string()))?;
        Ok(Self(bytes))
    }

    /// Hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..12])
    }
}

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Identifier);

        impl $name {
            /// Wrap an identifier
            pub fn new(id: Identifier) -> Self {
                Self(id)
            }

            /// Digest arbitrary content into this kind of identifier
            pub fn digest(data: &[u8]) -> Self {
                Self(Identifier::digest(data))
            }

            /// Underlying identifier
            pub fn identifier(&self) -> &Identifier {
                &self.0
            }

            /// Get bytes
            pub fn as_bytes(&self) -> &[u8; 32] {
                self.0.as_bytes()
            }
        }

        impl From<Identifier> for $name {
            fn from(id: Identifier) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.0)
            }
        }
    };
}

typed_id!(
    /// Identifies a notary (server)
    NotaryId
);
typed_id!(
    /// Identifies a nym; digest of its signing public key
    NymId
);
typed_id!(
    /// Identifies an asset account
    AccountId
);
typed_id!(
    /// Identifies an instrument definition (unit type)
    InstrumentDefinitionId
);

impl NymId {
    /// Derive the nym ID from an ed25519 public key
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self::digest(public_key)
    }
}

impl NotaryId {
    /// Derive the notary ID from the notary's signing public key
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self::digest(public_key)
    }
}

/// Box type of a ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum BoxType {
    /// Per-nym box for notices
    Nymbox = 0,
    /// Account inbox
    Inbox = 1,
    /// Account outbox
    Outbox = 2,
    /// Incoming payment instruments (client side)
    PaymentInbox = 3,
    /// Processed receipts (client side)
    RecordBox = 4,
    /// Expired payment instruments (client side)
    ExpiredBox = 5,
}

impl BoxType {
    /// Parse from the wire depth value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(BoxType::Nymbox),
            1 => Some(BoxType::Inbox),
            2 => Some(BoxType::Outbox),
            3 => Some(BoxType::PaymentInbox),
            4 => Some(BoxType::RecordBox),
            5 => Some(BoxType::ExpiredBox),
            _ => None,
        }
    }

    /// Boxes that hold transactions for an asset account rather than a nym
    pub fn is_account_box(&self) -> bool {
        matches!(self, BoxType::Inbox | BoxType::Outbox)
    }
}

impl fmt::Display for BoxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BoxType::Nymbox => "nymbox",
            BoxType::Inbox => "inbox",
            BoxType::Outbox => "outbox",
            BoxType::PaymentInbox => "paymentInbox",
            BoxType::RecordBox => "recordBox",
            BoxType::ExpiredBox => "expiredBox",
        };
        write!(f, "{}", name)
    }
}

/// Which side of an agreement a receipt originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OriginType {
    /// Not related to a cron item
    #[default]
    None,
    /// Payment plan
    PaymentPlan,
    /// Smart contract
    SmartContract,
}

/// Display fields for the sender or recipient of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    /// Nym
    pub nym_id: NymId,
    /// Account, when the transaction concerns one
    pub account_id: Option<AccountId>,
}

/// Digital signature (Ed25519)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Signature bytes (64 bytes)
    #[serde(with = "serde_bytes")]
    bytes: [u8; 64],
}

impl Signature {
    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self { bytes }
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.bytes
    }

    /// Verify signature
    pub fn verify(&self, message: &[u8], public_key: &[u8; 32]) -> bool {
        crate::crypto::verify_signature(message, self, public_key)
    }
}

/// A signature together with the key that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBy {
    /// Signer's ed25519 public key
    pub public_key: [u8; 32],
    /// Signature over the object's canonical bytes
    pub signature: Signature,
}

impl SignedBy {
    /// Nym that owns the signing key
    pub fn nym_id(&self) -> NymId {
        NymId::from_public_key(&self.public_key)
    }

    /// Verify against canonical bytes
    pub fn verify(&self, message: &[u8]) -> Result<()> {
        if self.signature.verify(message, &self.public_key) {
            Ok(())
        } else {
            Err(Error::SignatureInvalid(format!(
                "Signature by {} does not match content",
                self.nym_id()
            )))
        }
    }
}

/// Base64-armored bincode payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Armored(String);

impl Armored {
    /// Armor a serializable value
    pub fn encode<T: Serialize>(value: &T) -> Result<Self> {
        let bytes = bincode::serialize(value)?;
        Ok(Self(general_purpose::STANDARD.encode(bytes)))
    }

    /// Decode the armored value
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes = general_purpose::STANDARD.decode(&self.0)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Armored text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether nothing is armored
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Asset account held at a notary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account ID
    pub account_id: AccountId,
    /// Owning nym
    pub nym_id: NymId,
    /// Notary holding the account
    pub notary_id: NotaryId,
    /// Unit of the balance
    pub instrument_definition_id: InstrumentDefinitionId,
    /// Current balance
    pub balance: Amount,
    /// Issuer accounts may run negative
    pub is_issuer: bool,
}

impl Account {
    /// Whether the account can pay `amount`
    pub fn can_debit(&self, amount: Amount) -> bool {
        self.is_issuer || self.balance >= amount
    }

    /// Balance after paying `amount`
    pub fn debited(&self, amount: Amount) -> Result<Amount> {
        self.balance.checked_sub(amount).ok_or_else(|| {
            Error::InvalidTransaction(format!(
                "Debit of {} overflows the balance of {}",
                amount, self.account_id
            ))
        })
    }

    /// Balance after receiving `amount`
    pub fn credited(&self, amount: Amount) -> Result<Amount> {
        self.balance.checked_add(amount).ok_or_else(|| {
            Error::InvalidTransaction(format!(
                "Credit of {} overflows the balance of {}",
                amount, self.account_id
            ))
        })
    }
}

/// Unit (instrument) definition registered at a notary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitDefinition {
    /// Display name
    pub name: String,
    /// Ticker symbol
    pub symbol: String,
    /// Nym that registered the definition
    pub issuer: NymId,
}

impl UnitDefinition {
    /// Content-addressed ID
    pub fn id(&self) -> Result<InstrumentDefinitionId> {
        Ok(InstrumentDefinitionId::digest(&bincode::serialize(self)?))
    }
}
