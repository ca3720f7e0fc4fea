//! The notary: request pipeline and box bookkeeping
//!
//! `Notary::process` turns one signed request into one signed reply:
//!
//! ```text
//! request ──► ReplyMessage::new (validate sender, echo request)
//!        ──► authenticate (registered key, or the key carried by registerNym)
//!        ──► lock context, accept request number, prune acknowledged notices
//!        ──► dispatch to the command handler
//!        ──► ReplyMessage drops: sign, drop reply notice, stamp nymbox hash
//! ```
//!
//! Boxes are stored abbreviated and signed by the notary; the full receipts
//! live beside them and are served by getBoxReceipt.

use crate::config::NotaryConfig;
use crate::context::{ContextStore, Editor};
use crate::handlers::{dispatch_table, CommandHandler};
use crate::reply::{ReplyMessage, NOTICE_COMMANDS};
use notary_core::{
    Account, AccountId, Armored, BoxEntry, BoxType, Error, Identifier, InstrumentDefinitionId,
    KeyPair, Ledger, LedgerKey, Message, MessageType, Metrics, NotaryId, NymId, RequestNumber,
    Result, Signer, Storage, Transaction, TransactionNumber, TransactionType,
};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A notary server instance
pub struct Notary {
    keys: KeyPair,
    notary_id: NotaryId,
    storage: Arc<Storage>,
    contexts: ContextStore,
    metrics: Metrics,
    config: NotaryConfig,
    admin_nym: Option<NymId>,
    notice_commands: BTreeSet<MessageType>,
    handlers: HashMap<MessageType, Box<dyn CommandHandler>>,
}

impl fmt::Debug for Notary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notary")
            .field("notary_id", &self.notary_id)
            .field("storage", &self.storage)
            .field("locked", &self.config.locked)
            .finish()
    }
}

impl Notary {
    /// Open storage and derive the signing key from the configuration
    pub fn open(config: NotaryConfig) -> Result<Self> {
        let keys = match config.signing_seed()? {
            Some(seed) => KeyPair::from_seed(&seed),
            None => {
                tracing::warn!("No signing seed configured; notary identity will not survive a restart");
                KeyPair::generate()
            }
        };
        let storage = Arc::new(Storage::open(&config.storage)?);
        Self::new(config, keys, storage)
    }

    /// Notary over already opened storage
    pub fn new(config: NotaryConfig, keys: KeyPair, storage: Arc<Storage>) -> Result<Self> {
        let notary_id = NotaryId::from_public_key(&keys.public_key());
        let metrics = Metrics::new().map_err(|e| Error::Other(format!("Metrics registration: {}", e)))?;
        let contexts = ContextStore::new(
            notary_id,
            storage.clone(),
            Duration::from_millis(config.lock_timeout_ms),
        );

        let mut notice_commands: BTreeSet<MessageType> = NOTICE_COMMANDS.into_iter().collect();
        notice_commands.extend(config.extra_notice_commands()?);
        let admin_nym = config.admin_nym_id()?;

        tracing::info!(
            notary_id = %notary_id,
            locked = config.locked,
            notice_commands = notice_commands.len(),
            "Notary ready"
        );

        Ok(Self {
            keys,
            notary_id,
            storage,
            contexts,
            metrics,
            config,
            admin_nym,
            notice_commands,
            handlers: dispatch_table(),
        })
    }

    /// Notary ID
    pub fn notary_id(&self) -> &NotaryId {
        &self.notary_id
    }

    /// Nym of the notary's signing key
    pub fn nym_id(&self) -> NymId {
        self.keys.nym_id()
    }

    /// Public signing key
    pub fn public_key(&self) -> [u8; 32] {
        self.keys.public_key()
    }

    pub(crate) fn keys(&self) -> &KeyPair {
        &self.keys
    }

    /// Storage
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Client contexts
    pub fn contexts(&self) -> &ContextStore {
        &self.contexts
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &NotaryConfig {
        &self.config
    }

    /// Admin nym, exempt from the lock
    pub fn admin_nym(&self) -> Option<NymId> {
        self.admin_nym
    }

    /// Process one request into its signed reply
    pub fn process(&self, request: &Message) -> Result<Message> {
        let mut output = None;
        {
            let mut reply = ReplyMessage::new(self, request, &mut output);
            if reply.init() {
                if let Err(e) = self.handle(request, &mut reply) {
                    if e.is_fatal() {
                        tracing::error!(command = %request.command, nym_id = %request.nym_id, error = %e, "Request failed");
                    } else {
                        tracing::warn!(command = %request.command, nym_id = %request.nym_id, error = %e, "Request failed");
                    }
                    reply.set_success(false);
                }

                // Armed only once the request number has been accepted
                if reply.has_context() && self.notice_commands.contains(&request.command) {
                    let success = reply.success();
                    reply.drop_to_nymbox(success);
                }
            }
        }

        self.metrics.record_reply();
        output.unwrap_or_else(|| Err(Error::Protocol(format!("No reply produced for {}", request.command_name()))))
    }

    fn handle(&self, request: &Message, reply: &mut ReplyMessage<'_>) -> Result<()> {
        let handler = self
            .handlers
            .get(&request.command)
            .ok_or_else(|| Error::Protocol(format!("No handler for {}", request.command)))?;

        self.authenticate(request)?;

        if !request.command.is_unbuffered() {
            let mut context = self
                .contexts
                .edit(&request.nym_id)?
                .ok_or_else(|| Error::NotFound(format!("Nym {} is not registered", request.nym_id)))?;
            context.accept_request(request.request_number)?;
            self.process_acknowledgements(&mut context, &request.acknowledged_replies)?;
            reply.message_mut().acknowledged_replies = request.acknowledged_replies.clone();
            reply.set_context(context);
        }

        tracing::debug!(command = %request.command, nym_id = %request.nym_id, request_number = request.request_number, "Dispatching request");
        handler.handle(self, request, reply)
    }

    fn authenticate(&self, request: &Message) -> Result<()> {
        let public_key = match request.command {
            MessageType::RegisterNym => request
                .public_key
                .ok_or_else(|| Error::Protocol("registerNym without a public key".to_string()))?,
            _ => self
                .storage
                .get_nym(&request.nym_id)?
                .ok_or_else(|| Error::NotFound(format!("Nym {} is not registered", request.nym_id)))?,
        };

        if NymId::from_public_key(&public_key) != request.nym_id {
            return Err(Error::SignatureInvalid(format!(
                "Key does not belong to {}",
                request.nym_id
            )));
        }
        request.verify_with(&public_key)
    }

    /// Drop reply notices the client has already seen
    fn process_acknowledgements(&self, context: &mut Editor, acknowledged: &BTreeSet<RequestNumber>) -> Result<()> {
        context.set_acknowledged_replies(acknowledged.clone());
        if acknowledged.is_empty() {
            return Ok(());
        }

        let key = LedgerKey::nymbox(self.notary_id, *context.nym_id());
        let nymbox = self.load_box(&key)?;
        let stale: Vec<TransactionNumber> = nymbox
            .entries()
            .filter(|entry| {
                entry.kind() == TransactionType::ReplyNotice
                    && entry
                        .request_number()
                        .map(|request_number| acknowledged.contains(&request_number))
                        .unwrap_or(false)
            })
            .map(BoxEntry::number)
            .collect();

        if stale.is_empty() {
            return Ok(());
        }

        let mut nymbox = nymbox.reopen();
        for number in &stale {
            nymbox.remove(*number)?;
            self.storage.delete_box_receipt(&key, *number)?;
        }
        self.save_box(nymbox)?;

        tracing::debug!(nym_id = %context.nym_id(), removed = stale.len(), "Removed acknowledged reply notices");
        Ok(())
    }

    // Box helpers

    /// Stored box, or an empty one
    pub fn load_box(&self, key: &LedgerKey) -> Result<Ledger> {
        Ledger::load_or_new(&self.storage, key)
    }

    /// Sign and store a box
    pub(crate) fn save_box(&self, ledger: Ledger) -> Result<Ledger> {
        let mut ledger = ledger.reopen();
        ledger.sign(&self.keys)?;
        ledger.save(&self.storage)?;
        Ok(ledger)
    }

    /// Sign a receipt and add it to a box
    pub(crate) fn add_receipt(&self, key: &LedgerKey, mut receipt: Transaction) -> Result<()> {
        receipt.sign(&self.keys)?;
        let mut ledger = self.load_box(key)?.reopen();
        ledger.add_entry(BoxEntry::full(receipt.clone()).abbreviate()?)?;
        self.storage.put_box_receipt(key, &receipt)?;
        self.save_box(ledger)?;

        tracing::debug!(ledger = %key, number = receipt.number, kind = %receipt.kind, "Receipt added");
        Ok(())
    }

    /// Remove a receipt from a box
    pub(crate) fn remove_receipt(&self, key: &LedgerKey, number: TransactionNumber) -> Result<()> {
        let mut ledger = self.load_box(key)?.reopen();
        ledger.remove(number)?;
        self.storage.delete_box_receipt(key, number)?;
        self.save_box(ledger)?;
        Ok(())
    }

    /// Full receipt behind a box entry
    pub(crate) fn box_receipt(&self, key: &LedgerKey, number: TransactionNumber) -> Result<Transaction> {
        self.storage
            .get_box_receipt(key, number)?
            .ok_or_else(|| Error::NotFound(format!("Receipt {} in {}", number, key)))
    }

    /// Current nymbox hash of a nym
    pub fn nymbox_hash(&self, nym_id: &NymId) -> Result<Identifier> {
        self.load_box(&LedgerKey::nymbox(self.notary_id, *nym_id))?.hash()
    }

    /// Notice into a nym's nymbox under a fresh number
    pub(crate) fn drop_notice(&self, recipient: &NymId, mut notice: Transaction) -> Result<TransactionNumber> {
        let number = self.storage.allocate_unowned_number()?;
        notice.number = number;
        notice.notary_id = self.notary_id;
        notice.nym_id = *recipient;
        self.add_receipt(&LedgerKey::nymbox(self.notary_id, *recipient), notice)?;
        Ok(number)
    }

    /// Copy of a signed reply into the requester's nymbox
    pub(crate) fn drop_reply_notice(&self, reply: &Message, request_number: RequestNumber, success: bool) -> Result<()> {
        let mut notice = Transaction::new(self.notary_id, reply.nym_id, TransactionType::ReplyNotice, 0);
        notice.reference = request_number;
        notice.request_number = Some(request_number);
        notice.success = success;
        notice.attachment = Armored::encode(reply)?;
        let number = self.drop_notice(&reply.nym_id, notice)?;

        self.metrics.record_notice_dropped();
        tracing::debug!(nym_id = %reply.nym_id, request_number, number, success, "Dropped reply notice");
        Ok(())
    }

    // Account helpers

    /// Create an account with empty inbox and outbox
    pub(crate) fn open_account(
        &self,
        nym_id: &NymId,
        instrument_definition_id: InstrumentDefinitionId,
        is_issuer: bool,
        request_number: RequestNumber,
    ) -> Result<Account> {
        let seed = bincode::serialize(&(self.notary_id, nym_id, instrument_definition_id, request_number, is_issuer))?;
        let account = Account {
            account_id: AccountId::digest(&seed),
            nym_id: *nym_id,
            notary_id: self.notary_id,
            instrument_definition_id,
            balance: 0,
            is_issuer,
        };
        if self.storage.get_account(&account.account_id)?.is_some() {
            return Err(Error::InvalidTransaction(format!("Account {} already exists", account.account_id)));
        }

        self.storage.put_account(&account)?;
        for box_type in [BoxType::Inbox, BoxType::Outbox] {
            let key = LedgerKey::account_box(self.notary_id, *nym_id, account.account_id, box_type);
            self.save_box(Ledger::new(key))?;
        }

        tracing::info!(nym_id = %nym_id, account_id = %account.account_id, is_issuer, "Account opened");
        Ok(account)
    }

    /// Account owned by `nym_id`
    pub(crate) fn owned_account(&self, nym_id: &NymId, account_id: &AccountId) -> Result<Account> {
        let account = self
            .storage
            .get_account(account_id)?
            .ok_or_else(|| Error::NotFound(format!("Account {}", account_id)))?;
        if account.nym_id != *nym_id || account.notary_id != self.notary_id {
            return Err(Error::InvalidTransaction(format!(
                "Account {} does not belong to {}",
                account_id, nym_id
            )));
        }
        Ok(account)
    }

    /// Inbox or outbox of an account
    pub(crate) fn account_box_key(&self, account: &Account, box_type: BoxType) -> LedgerKey {
        LedgerKey::account_box(self.notary_id, account.nym_id, account.account_id, box_type)
    }

    /// Close a number for good, notary side
    pub(crate) fn close_number(&self, context: &mut Editor, number: TransactionNumber) -> Result<bool> {
        if !context.pool().is_issued(number) {
            return Ok(false);
        }
        self.storage.release_number(number)?;
        context.pool_mut().close(number);
        self.metrics.record_closed();
        Ok(true)
    }
}
