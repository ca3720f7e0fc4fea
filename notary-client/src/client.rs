//! The notary client: request construction and reply reconciliation
//!
//! Every outgoing request is built by `process_user_command`, which stamps
//! the request number, attaches the seen-reply set, reserves whatever
//! transaction numbers the request commits and signs it. Buffered requests
//! stay in the sent buffer until their reply has been reconciled by
//! `process_server_reply`, or until `flush_sent_messages` proves from a
//! fresh nymbox that the notary never saw them.
//!
//! Balance statements are computed here exactly the way the notary will
//! recompute them; any divergence fails the transaction and burns its
//! opening number.

use crate::buffer::{ReceivedReplies, SentMessages};
use crate::config::ClientConfig;
use crate::context::{ContextGuard, ServerContext, ServerContexts};
use crate::handlers::{dispatch_table, Exchange, ReplyHandler};
use crate::harvest::{harvest_transaction_numbers, harvest_unsent_cron_item, HarvestFlags};
use chrono::Utc;
use dashmap::DashMap;
use notary_core::{
    Account, AccountId, Amount, Armored, BalanceStatement, BoxType, CronItem, CronParty, Error,
    InstrumentDefinitionId, KeyPair, Ledger, LedgerKey, Message, MessageType, Metrics, NotaryId,
    NymId, Party, Result, Signer, Storage, Transaction, TransactionNumber, TransactionType,
    UnitDefinition,
};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A request the user wants to send
#[derive(Debug, Clone)]
pub enum UserCommand {
    /// Liveness check
    PingNotary,
    /// Register the nym's public key
    RegisterNym,
    /// Remove the nym from the notary
    UnregisterNym,
    /// Resynchronise the request number
    GetRequestNumber,
    /// Ask for a batch of transaction numbers
    GetTransactionNumbers,
    /// Fetch another nym's public key
    CheckNym {
        /// Nym to look up
        nym_id: NymId,
    },
    /// Text message to another nym
    SendNymMessage {
        /// Recipient
        recipient: NymId,
        /// Message text
        text: String,
    },
    /// Cron item passed to another party for signing
    SendNymInstrument {
        /// Recipient
        recipient: NymId,
        /// Instrument
        item: CronItem,
    },
    /// Issue a new unit
    RegisterInstrumentDefinition {
        /// Unit definition, issued by this nym
        unit: UnitDefinition,
    },
    /// Which of these units the notary knows
    QueryInstrumentDefinitions {
        /// Units to look up
        ids: Vec<InstrumentDefinitionId>,
    },
    /// Download a unit definition
    GetInstrumentDefinition {
        /// Unit
        id: InstrumentDefinitionId,
    },
    /// Open an asset account
    RegisterAccount {
        /// Unit held by the account
        instrument_definition_id: InstrumentDefinitionId,
    },
    /// Close an empty asset account
    UnregisterAccount {
        /// Account
        account_id: AccountId,
    },
    /// Download an account with its inbox and outbox
    GetAccountData {
        /// Account
        account_id: AccountId,
    },
    /// Download the full receipt behind an abbreviated box entry
    GetBoxReceipt {
        /// Account, for inbox and outbox receipts
        account_id: Option<AccountId>,
        /// Nymbox, inbox or outbox
        box_type: BoxType,
        /// Entry number
        number: TransactionNumber,
    },
    /// Download the nymbox
    GetNymbox,
    /// Accept every hydrated nymbox entry
    ProcessNymbox,
    /// Accept the hydrated inbox, rejecting the listed pending transfers
    ProcessInbox {
        /// Account
        account_id: AccountId,
        /// Pending transfers to refuse
        reject: BTreeSet<TransactionNumber>,
    },
    /// Move funds to another account
    Transfer {
        /// Source account
        account_id: AccountId,
        /// Destination nym and account
        recipient: Party,
        /// Amount
        amount: Amount,
    },
    /// Activate a fully signed cron item this nym is the activator of
    ActivateCronItem {
        /// This nym's opening number on the item
        opening_number: TransactionNumber,
    },
    /// Cancel an active cron item
    CancelCronItem {
        /// Item ID
        item_id: TransactionNumber,
        /// Account whose balance the statement asserts
        account_id: Option<AccountId>,
    },
    /// Trigger a clause of an active cron item
    TriggerClause {
        /// Item ID
        item_id: TransactionNumber,
        /// Clause name
        clause: String,
    },
    /// Any command without client-side parameters
    Other(MessageType),
}

impl UserCommand {
    /// Wire command
    pub fn message_type(&self) -> MessageType {
        match self {
            UserCommand::PingNotary => MessageType::PingNotary,
            UserCommand::RegisterNym => MessageType::RegisterNym,
            UserCommand::UnregisterNym => MessageType::UnregisterNym,
            UserCommand::GetRequestNumber => MessageType::GetRequestNumber,
            UserCommand::GetTransactionNumbers => MessageType::GetTransactionNumbers,
            UserCommand::CheckNym { .. } => MessageType::CheckNym,
            UserCommand::SendNymMessage { .. } => MessageType::SendNymMessage,
            UserCommand::SendNymInstrument { .. } => MessageType::SendNymInstrument,
            UserCommand::RegisterInstrumentDefinition { .. } => MessageType::RegisterInstrumentDefinition,
            UserCommand::QueryInstrumentDefinitions { .. } => MessageType::QueryInstrumentDefinitions,
            UserCommand::GetInstrumentDefinition { .. } => MessageType::GetInstrumentDefinition,
            UserCommand::RegisterAccount { .. } => MessageType::RegisterAccount,
            UserCommand::UnregisterAccount { .. } => MessageType::UnregisterAccount,
            UserCommand::GetAccountData { .. } => MessageType::GetAccountData,
            UserCommand::GetBoxReceipt { .. } => MessageType::GetBoxReceipt,
            UserCommand::GetNymbox => MessageType::GetNymbox,
            UserCommand::ProcessNymbox => MessageType::ProcessNymbox,
            UserCommand::ProcessInbox { .. } => MessageType::ProcessInbox,
            UserCommand::Transfer { .. }
            | UserCommand::ActivateCronItem { .. }
            | UserCommand::CancelCronItem { .. } => MessageType::NotarizeTransaction,
            UserCommand::TriggerClause { .. } => MessageType::TriggerClause,
            UserCommand::Other(command) => *command,
        }
    }
}

/// A notary client holding any number of nyms and notaries
pub struct Client {
    config: ClientConfig,
    storage: Arc<Storage>,
    nyms: DashMap<NymId, Arc<KeyPair>>,
    notaries: DashMap<NotaryId, [u8; 32]>,
    contexts: ServerContexts,
    sent: SentMessages,
    received: ReceivedReplies,
    metrics: Metrics,
    handlers: HashMap<MessageType, Box<dyn ReplyHandler>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("storage", &self.storage)
            .field("nyms", &self.nyms.len())
            .field("notaries", &self.notaries.len())
            .field("sent", &self.sent.len())
            .field("received", &self.received.len())
            .finish()
    }
}

impl Client {
    /// Open local storage
    pub fn open(config: ClientConfig) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config.storage)?);
        Self::new(config, storage)
    }

    /// Client over already opened storage
    pub fn new(config: ClientConfig, storage: Arc<Storage>) -> Result<Self> {
        let metrics = Metrics::new().map_err(|e| Error::Other(format!("Metrics registration: {}", e)))?;
        let contexts = ServerContexts::new(storage.clone(), Duration::from_millis(config.lock_timeout_ms));

        Ok(Self {
            config,
            storage,
            nyms: DashMap::new(),
            notaries: DashMap::new(),
            contexts,
            sent: SentMessages::new(),
            received: ReceivedReplies::new(),
            metrics,
            handlers: dispatch_table(),
        })
    }

    /// Make a nym's keys available for signing
    pub fn add_nym(&self, keys: KeyPair) -> NymId {
        let nym_id = keys.nym_id();
        self.nyms.insert(nym_id, Arc::new(keys));
        nym_id
    }

    /// Trust a notary's signing key
    pub fn add_notary(&self, public_key: [u8; 32]) -> NotaryId {
        let notary_id = NotaryId::from_public_key(&public_key);
        self.notaries.insert(notary_id, public_key);
        tracing::info!(notary_id = %notary_id, "Notary added");
        notary_id
    }

    /// Configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Local storage
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Requests awaiting their replies
    pub fn sent_messages(&self) -> &SentMessages {
        &self.sent
    }

    /// Replies waiting to be processed
    pub fn received_replies(&self) -> &ReceivedReplies {
        &self.received
    }

    /// Copy of the context of a (notary, nym) pair
    pub fn context(&self, notary_id: &NotaryId, nym_id: &NymId) -> Result<ServerContext> {
        self.contexts.snapshot(notary_id, nym_id)
    }

    /// Whether the nym should ask this notary for more numbers
    pub fn needs_numbers(&self, notary_id: &NotaryId, nym_id: &NymId) -> Result<bool> {
        Ok(self.context(notary_id, nym_id)?.needs_numbers(self.config.low_water_mark))
    }

    /// Locally known account
    pub fn account(&self, account_id: &AccountId) -> Result<Account> {
        self.storage
            .get_account(account_id)?
            .ok_or_else(|| Error::NotFound(format!("Account {}", account_id)))
    }

    /// Local copy of a box
    pub fn local_box(&self, key: &LedgerKey) -> Result<Ledger> {
        Ledger::load_or_new(&self.storage, key)
    }

    pub(crate) fn keys(&self, nym_id: &NymId) -> Result<Arc<KeyPair>> {
        self.nyms
            .get(nym_id)
            .map(|keys| keys.value().clone())
            .ok_or_else(|| Error::NotFound(format!("No keys for nym {}", nym_id)))
    }

    pub(crate) fn notary_key(&self, notary_id: &NotaryId) -> Result<[u8; 32]> {
        self.notaries
            .get(notary_id)
            .map(|key| *key.value())
            .ok_or_else(|| Error::NotFound(format!("Unknown notary {}", notary_id)))
    }

    /// Nym of the notary's signing key; boxes and receipts are signed by it
    pub(crate) fn notary_nym(&self, notary_id: &NotaryId) -> Result<NymId> {
        Ok(NymId::from_public_key(&self.notary_key(notary_id)?))
    }

    /// Replace a local box with the notary's copy, keeping receipts already fetched
    pub(crate) fn merge_box(&self, server: &Ledger) -> Result<Ledger> {
        let local = Ledger::load_or_new(&self.storage, server.key())?;
        let mut merged = server.clone().reopen();

        for entry in local.entries().filter(|entry| !entry.is_abbreviated()) {
            let matches = match merged.get_transaction_by_id(entry.number()) {
                Some(current) => current.is_abbreviated() && current.receipt_hash()? == entry.receipt_hash()?,
                None => false,
            };
            if matches {
                merged.remove(entry.number())?;
                merged.add_entry(entry.clone())?;
            }
        }

        merged.save(&self.storage)?;
        Ok(merged)
    }

    // Outgoing

    /// Build, number, sign and buffer a request
    pub fn process_user_command(
        &self,
        notary_id: &NotaryId,
        nym_id: &NymId,
        command: UserCommand,
    ) -> Result<Message> {
        let message_type = command.message_type();
        self.prepare(notary_id, nym_id, command)?
            .ok_or_else(|| Error::NotFound(format!("Nothing to send for {}", message_type)))
    }

    fn prepare(&self, notary_id: &NotaryId, nym_id: &NymId, command: UserCommand) -> Result<Option<Message>> {
        let keys = self.keys(nym_id)?;
        self.notary_key(notary_id)?;

        let mut context = self.contexts.lock(notary_id, nym_id)?;
        let buffered = !command.message_type().is_unbuffered();
        if buffered {
            // Nothing gets reserved for a request that cannot be numbered
            context.following_request_number()?;
        }
        let mut message = Message::request(command.message_type(), *notary_id, *nym_id, 0);
        if !self.build_request(&mut context, &keys, command, &mut message)? {
            return Ok(None);
        }

        if buffered {
            message.request_number = context.next_request_number()?;
            message.acknowledged_replies = context.seen_replies().clone();
        }
        message.sign(keys.as_ref())?;
        drop(context);

        if buffered {
            self.sent.add(message.clone());
        }
        tracing::debug!(
            command = %message.command,
            nym_id = %nym_id,
            request_number = message.request_number,
            "Request built"
        );
        Ok(Some(message))
    }

    fn build_request(
        &self,
        context: &mut ContextGuard,
        keys: &KeyPair,
        command: UserCommand,
        message: &mut Message,
    ) -> Result<bool> {
        match command {
            UserCommand::PingNotary
            | UserCommand::UnregisterNym
            | UserCommand::GetRequestNumber
            | UserCommand::GetNymbox
            | UserCommand::Other(_) => {}
            UserCommand::RegisterNym => message.public_key = Some(keys.public_key()),
            UserCommand::GetTransactionNumbers => {
                message.depth = i64::try_from(self.config.numbers_per_request).unwrap_or(i64::MAX);
            }
            UserCommand::CheckNym { nym_id } => message.nym_id2 = Some(nym_id),
            UserCommand::SendNymMessage { recipient, text } => {
                message.nym_id2 = Some(recipient);
                message.payload = Armored::encode(&text)?;
            }
            UserCommand::SendNymInstrument { recipient, item } => {
                message.nym_id2 = Some(recipient);
                message.payload = Armored::encode(&item)?;
            }
            UserCommand::RegisterInstrumentDefinition { unit } => message.payload = Armored::encode(&unit)?,
            UserCommand::QueryInstrumentDefinitions { ids } => message.payload = Armored::encode(&ids)?,
            UserCommand::GetInstrumentDefinition { id } => message.payload = Armored::encode(&id)?,
            UserCommand::RegisterAccount {
                instrument_definition_id,
            } => message.payload = Armored::encode(&instrument_definition_id)?,
            UserCommand::UnregisterAccount { account_id } | UserCommand::GetAccountData { account_id } => {
                message.account_id = Some(account_id);
            }
            UserCommand::GetBoxReceipt {
                account_id,
                box_type,
                number,
            } => {
                message.account_id = account_id;
                message.depth = i64::from(box_type as u8);
                message.transaction_number = number;
            }
            UserCommand::ProcessNymbox => match self.nymbox_response(context, keys)? {
                Some(response) => message.payload = Armored::encode(&response)?,
                None => return Ok(false),
            },
            UserCommand::ProcessInbox { account_id, reject } => {
                match self.inbox_response(context, keys, &account_id, &reject)? {
                    Some((opening, response)) => {
                        message.account_id = Some(account_id);
                        message.transaction_number = opening;
                        message.payload = Armored::encode(&response)?;
                    }
                    None => return Ok(false),
                }
            }
            UserCommand::Transfer {
                account_id,
                recipient,
                amount,
            } => {
                let transaction = self.transfer(context, keys, &account_id, recipient, amount)?;
                self.attach_transaction(message, &transaction)?;
            }
            UserCommand::ActivateCronItem { opening_number } => {
                let transaction = self.activation(context, keys, opening_number)?;
                self.attach_transaction(message, &transaction)?;
            }
            UserCommand::CancelCronItem { item_id, account_id } => {
                let transaction = self.cancellation(context, keys, item_id, account_id)?;
                self.attach_transaction(message, &transaction)?;
            }
            UserCommand::TriggerClause { item_id, clause } => {
                message.transaction_number = item_id;
                message.payload = Armored::encode(&clause)?;
            }
        }
        Ok(true)
    }

    fn attach_transaction(&self, message: &mut Message, transaction: &Transaction) -> Result<()> {
        message.account_id = transaction.account_id;
        message.transaction_number = transaction.number;
        message.payload = Armored::encode(transaction)?;
        Ok(())
    }

    fn reserve_one(&self, context: &mut ServerContext) -> Result<TransactionNumber> {
        let reserved = context.pool_mut().reserve(1)?;
        self.metrics.record_reserved(reserved.len());
        reserved.into_iter().next().ok_or(Error::InsufficientNumbers {
            needed: 1,
            available: 0,
        })
    }

    fn owned_account(&self, nym_id: &NymId, account_id: &AccountId) -> Result<Account> {
        let account = self.account(account_id)?;
        if account.nym_id != *nym_id {
            return Err(Error::InvalidTransaction(format!(
                "Account {} does not belong to {}",
                account_id, nym_id
            )));
        }
        Ok(account)
    }

    fn transfer(
        &self,
        context: &mut ServerContext,
        keys: &KeyPair,
        account_id: &AccountId,
        recipient: Party,
        amount: Amount,
    ) -> Result<Transaction> {
        let nym_id = *context.nym_id();
        let account = self.owned_account(&nym_id, account_id)?;
        if amount <= 0 {
            return Err(Error::InvalidTransaction(format!("Invalid amount {}", amount)));
        }
        let balance = account.debited(amount)?;

        let opening = self.reserve_one(context)?;
        let mut transaction = Transaction::new(*context.notary_id(), nym_id, TransactionType::Transfer, opening);
        transaction.account_id = Some(*account_id);
        transaction.sender = Some(Party {
            nym_id,
            account_id: Some(*account_id),
        });
        transaction.recipient = Some(recipient);
        transaction.amount = amount;
        transaction.statement = Some(BalanceStatement {
            notary_id: *context.notary_id(),
            nym_id,
            account_id: Some(*account_id),
            opening_number: Some(opening),
            issued: context.pool().issued().clone(),
            balance: Some(balance),
        });
        transaction.sign(keys)?;

        tracing::info!(account_id = %account_id, amount, opening_number = opening, "Transfer prepared");
        Ok(transaction)
    }

    fn activation(&self, context: &mut ServerContext, keys: &KeyPair, opening: TransactionNumber) -> Result<Transaction> {
        let nym_id = *context.nym_id();
        let item = context
            .unsent_cron_item(opening)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Unsent cron item {}", opening)))?;
        if item.activator != nym_id || item.id() != Some(opening) {
            return Err(Error::InvalidTransaction(format!(
                "{} is not the activator of cron item {}",
                nym_id, opening
            )));
        }
        item.verify_parties()?;

        let account_id = item
            .party(&nym_id)
            .map(|party| party.account_id)
            .ok_or_else(|| Error::InvalidTransaction("Activator is not a party".to_string()))?;
        let account = self.owned_account(&nym_id, &account_id)?;

        let mut transaction = Transaction::new(
            *context.notary_id(),
            nym_id,
            TransactionType::ActivateCronItem,
            opening,
        );
        transaction.account_id = Some(account_id);
        transaction.origin = item.kind.origin();
        transaction.attachment = Armored::encode(&item)?;
        transaction.statement = Some(BalanceStatement {
            notary_id: *context.notary_id(),
            nym_id,
            account_id: Some(account_id),
            opening_number: Some(opening),
            issued: context.pool().issued().clone(),
            balance: Some(account.balance),
        });
        transaction.sign(keys)?;
        Ok(transaction)
    }

    fn cancellation(
        &self,
        context: &mut ServerContext,
        keys: &KeyPair,
        item_id: TransactionNumber,
        account_id: Option<AccountId>,
    ) -> Result<Transaction> {
        let nym_id = *context.nym_id();
        let balance = match &account_id {
            Some(account_id) => Some(self.owned_account(&nym_id, account_id)?.balance),
            None => None,
        };

        let opening = self.reserve_one(context)?;
        let mut issued = context.pool().issued().clone();
        issued.remove(&opening);

        let mut transaction = Transaction::new(
            *context.notary_id(),
            nym_id,
            TransactionType::CancelCronItem,
            opening,
        );
        transaction.account_id = account_id;
        transaction.reference = item_id;
        transaction.statement = Some(BalanceStatement {
            notary_id: *context.notary_id(),
            nym_id,
            account_id,
            opening_number: Some(opening),
            issued,
            balance,
        });
        transaction.sign(keys)?;
        Ok(transaction)
    }

    /// Signed response to the hydrated inbox, with its reserved opening number
    fn inbox_response(
        &self,
        context: &mut ServerContext,
        keys: &KeyPair,
        account_id: &AccountId,
        reject: &BTreeSet<TransactionNumber>,
    ) -> Result<Option<(TransactionNumber, Ledger)>> {
        let nym_id = *context.nym_id();
        let account = self.owned_account(&nym_id, account_id)?;
        let key = LedgerKey::account_box(*context.notary_id(), nym_id, *account_id, BoxType::Inbox);
        let inbox = self.local_box(&key)?;

        let mut response = Ledger::create_response(&inbox);
        let mut closes = BTreeSet::new();
        let mut credit: Amount = 0;

        for entry in inbox.entries() {
            let original = match entry.as_full() {
                Some(original) => original,
                None => {
                    tracing::debug!(number = entry.number(), "Skipping inbox entry without its receipt");
                    continue;
                }
            };
            let accept = !reject.contains(&original.number);
            if !accept && !original.kind.is_pending() {
                return Err(Error::InvalidTransaction(format!(
                    "A {} cannot be rejected",
                    original.kind
                )));
            }

            if accept {
                match original.kind {
                    TransactionType::Pending => {
                        credit = credit.checked_add(original.amount).ok_or_else(|| {
                            Error::InvalidTransaction(format!("Credits to {} overflow", account_id))
                        })?;
                    }
                    TransactionType::TransferReceipt | TransactionType::ChequeReceipt => {
                        if context.pool().is_issued(original.reference) {
                            closes.insert(original.reference);
                        }
                    }
                    TransactionType::FinalReceipt => {
                        for number in [Some(original.reference), original.closing_number].into_iter().flatten() {
                            if context.pool().is_issued(number) {
                                closes.insert(number);
                            }
                        }
                    }
                    TransactionType::PaymentReceipt => {}
                    other => {
                        tracing::warn!(number = original.number, kind = %other, "Unexpected entry in inbox");
                        continue;
                    }
                }
            }

            let mut item = Transaction::create_response(original, accept);
            item.sign(keys)?;
            response.add_transaction(item)?;
        }

        if response.is_empty() {
            return Ok(None);
        }
        let balance = account.credited(credit)?;

        let opening = self.reserve_one(context)?;
        let mut issued = context.pool().issued().clone();
        for number in closes.iter().chain(std::iter::once(&opening)) {
            issued.remove(number);
        }
        let statement = BalanceStatement {
            notary_id: *context.notary_id(),
            nym_id,
            account_id: Some(*account_id),
            opening_number: Some(opening),
            issued,
            balance: Some(balance),
        };
        response.finalize_response(statement, keys)?;

        tracing::info!(
            account_id = %account_id,
            items = response.len(),
            closing = closes.len(),
            credit,
            opening_number = opening,
            "Inbox response prepared"
        );
        Ok(Some((opening, response)))
    }

    /// Signed acceptance of every hydrated nymbox entry
    fn nymbox_response(&self, context: &ServerContext, keys: &KeyPair) -> Result<Option<Ledger>> {
        let key = LedgerKey::nymbox(*context.notary_id(), *context.nym_id());
        let nymbox = self.local_box(&key)?;
        let mut response = Ledger::create_response(&nymbox);

        for entry in nymbox.entries() {
            // Reply notices leave the nymbox through acknowledgements
            if entry.kind() == TransactionType::ReplyNotice {
                continue;
            }
            if let Some(original) = entry.as_full() {
                let mut item = Transaction::create_response(original, true);
                // Settled from this copy when the reply comes back
                item.attachment = Armored::encode(original)?;
                item.sign(keys)?;
                response.add_transaction(item)?;
            }
        }

        if response.is_empty() {
            return Ok(None);
        }

        let statement = BalanceStatement {
            notary_id: *context.notary_id(),
            nym_id: *context.nym_id(),
            account_id: None,
            opening_number: None,
            issued: context.pool().issued().clone(),
            balance: None,
        };
        response.finalize_response(statement, keys)?;
        Ok(Some(response))
    }

    /// Process reply notices, then accept whatever else the nymbox holds
    pub fn accept_entire_nymbox(&self, notary_id: &NotaryId, nym_id: &NymId) -> Result<Option<Message>> {
        self.process_reply_notices(notary_id, nym_id)?;
        self.prepare(notary_id, nym_id, UserCommand::ProcessNymbox)
    }

    /// Accept everything in the hydrated inbox
    pub fn accept_inbox(&self, notary_id: &NotaryId, nym_id: &NymId, account_id: &AccountId) -> Result<Option<Message>> {
        self.prepare(
            notary_id,
            nym_id,
            UserCommand::ProcessInbox {
                account_id: *account_id,
                reject: BTreeSet::new(),
            },
        )
    }

    // Cron items

    /// Commit two fresh numbers to a cron item and sign this nym's party record.
    ///
    /// The item is kept in the unsent store under the new opening number
    /// until it is activated or its numbers are harvested.
    pub fn sign_cron_item(&self, nym_id: &NymId, mut item: CronItem, account_id: &AccountId) -> Result<CronItem> {
        let keys = self.keys(nym_id)?;
        self.owned_account(nym_id, account_id)?;
        if item.is_party(nym_id) {
            return Err(Error::InvalidTransaction(format!("{} is already a party", nym_id)));
        }

        let mut context = self.contexts.lock(&item.notary_id, nym_id)?;
        let reserved: Vec<TransactionNumber> = context.pool_mut().reserve(2)?.into_iter().collect();
        self.metrics.record_reserved(reserved.len());
        let (opening, closing) = (reserved[0], reserved[1]);

        item.add_party(CronParty::new(*nym_id, *account_id, opening, closing))?;
        item.sign_as(keys.as_ref())?;
        context.add_unsent_cron_item(opening, item.clone());

        tracing::info!(nym_id = %nym_id, opening_number = opening, closing_number = closing, kind = ?item.kind, "Signed cron item");
        Ok(item)
    }

    /// Abandon a cron item that was never activated
    pub fn discard_cron_item(&self, notary_id: &NotaryId, nym_id: &NymId, opening_number: TransactionNumber) -> Result<usize> {
        let mut context = self.contexts.lock(notary_id, nym_id)?;
        let restored = harvest_unsent_cron_item(&mut context, opening_number);
        self.metrics.record_harvested(restored);
        Ok(restored)
    }

    // Incoming

    /// Queue a reply delivered by the transport
    pub fn receive(&self, reply: Message) {
        self.received.push(reply);
    }

    /// Process the queued reply to one request
    pub fn process_next_reply(&self, notary_id: &NotaryId, nym_id: &NymId, request_number: i64) -> Result<bool> {
        let reply = self
            .received
            .pop(request_number, notary_id, nym_id)
            .ok_or(Error::NoReply(request_number))?;
        self.process_server_reply(&reply, None)
    }

    /// Reconcile local state with one signed reply.
    ///
    /// Returns `false` when the reply was already processed (for example
    /// once directly and again through its reply notice). A nymbox passed
    /// along has its reply notices processed afterwards.
    pub fn process_server_reply(&self, reply: &Message, nymbox: Option<&Ledger>) -> Result<bool> {
        reply.verify_with(&self.notary_key(&reply.notary_id)?)?;
        if !reply.is_reply {
            return Err(Error::Protocol(format!("{} is not a reply", reply.command_name())));
        }
        let notary_id = reply.notary_id;
        let nym_id = reply.nym_id;
        let request_number = reply.request_number;
        let buffered = !reply.command.is_unbuffered();

        let scan_nymbox = {
            let mut context = self.contexts.lock(&notary_id, &nym_id)?;
            let sent = if buffered {
                match self.sent.get(request_number, &notary_id, &nym_id) {
                    Some(sent) => Some(sent),
                    None => {
                        tracing::debug!(request_number, command = %reply.command, "Reply already processed");
                        return Ok(false);
                    }
                }
            } else {
                None
            };
            if let Some(sent) = &sent {
                if sent.command != reply.command {
                    return Err(Error::MessageIdMismatch(format!(
                        "{} answered with {}",
                        sent.command_name(),
                        reply.command_name()
                    )));
                }
            }

            if let Some(hash) = reply.nymbox_hash {
                context.set_server_nymbox_hash(hash);
            }
            context.remove_acknowledged(&reply.acknowledged_replies);

            let handler = self
                .handlers
                .get(&reply.command)
                .ok_or_else(|| Error::Protocol(format!("No handler for {}", reply.command_name())))?;
            let mut exchange = Exchange::new(&mut context, sent.as_ref(), reply);
            if let Err(e) = handler.handle(self, &mut exchange) {
                tracing::error!(command = %reply.command_name(), request_number, error = %e, "Failed to process reply");
                return Err(e);
            }
            let scan_nymbox = exchange.scans_nymbox();

            if buffered {
                context.add_seen_reply(request_number);
                self.sent.remove(request_number, &notary_id, &nym_id);
            }
            scan_nymbox
        };

        self.metrics.record_reply();
        tracing::debug!(command = %reply.command_name(), request_number, success = reply.success, "Reply processed");

        if let Some(nymbox) = nymbox {
            self.process_notices_in(&notary_id, &nym_id, nymbox)?;
        }
        if scan_nymbox {
            self.process_reply_notices(&notary_id, &nym_id)?;
        }
        Ok(true)
    }

    /// Process replies carried by hydrated reply notices in the local nymbox
    pub fn process_reply_notices(&self, notary_id: &NotaryId, nym_id: &NymId) -> Result<usize> {
        let nymbox = self.local_box(&LedgerKey::nymbox(*notary_id, *nym_id))?;
        self.process_notices_in(notary_id, nym_id, &nymbox)
    }

    fn process_notices_in(&self, notary_id: &NotaryId, nym_id: &NymId, nymbox: &Ledger) -> Result<usize> {
        let mut processed = 0;
        for entry in nymbox.entries().filter(|entry| entry.kind() == TransactionType::ReplyNotice) {
            let request_number = match entry.request_number() {
                Some(request_number) => request_number,
                None => continue,
            };

            if !self.sent.contains(request_number, notary_id, nym_id) {
                // Already handled; acknowledging lets the notary drop the notice
                self.contexts.lock(notary_id, nym_id)?.add_seen_reply(request_number);
                continue;
            }

            let notice = match entry.as_full() {
                Some(notice) => notice,
                None => continue,
            };
            let carried: Message = notice.attachment.decode()?;
            carried.expect_exchange(request_number, notary_id, nym_id)?;
            if self.process_server_reply(&carried, None)? {
                processed += 1;
            }
        }

        if processed > 0 {
            tracing::info!(nym_id = %nym_id, processed, "Processed replies from reply notices");
        }
        Ok(processed)
    }

    /// Drop sent messages a fresh nymbox shows the notary never received.
    ///
    /// Only legal once per successful getNymbox reply. Messages older than
    /// that getNymbox with no reply notice in the nymbox are removed and
    /// their transaction numbers harvested; messages with a notice stay
    /// until the notice's reply is processed.
    pub fn flush_sent_messages(&self, notary_id: &NotaryId, nym_id: &NymId, for_retry: bool) -> Result<usize> {
        let mut context = self.contexts.lock(notary_id, nym_id)?;
        let before = context.take_flush_permission().ok_or_else(|| {
            Error::StaleNymbox(format!("Flush for {} requires a fresh getNymbox", nym_id))
        })?;
        let nymbox = self.local_box(&LedgerKey::nymbox(*notary_id, *nym_id))?;

        let mut flushed = 0;
        for message in self.sent.pending(notary_id, nym_id) {
            if message.request_number >= before {
                continue;
            }
            if nymbox.find_reply_notice(message.request_number).is_some() {
                tracing::debug!(request_number = message.request_number, "Reply notice present, keeping message");
                continue;
            }

            let harvested = harvest_transaction_numbers(&mut context, &message, HarvestFlags::no_reply(for_retry))?;
            self.metrics.record_harvested(harvested.restored);
            self.sent.remove(message.request_number, notary_id, nym_id);
            self.metrics.record_flushed();
            flushed += 1;

            tracing::info!(
                nym_id = %nym_id,
                request_number = message.request_number,
                command = %message.command,
                "Flushed message the notary never received"
            );
        }
        Ok(flushed)
    }

    // Client-side boxes

    /// Move a payment instrument out of the payment inbox.
    ///
    /// Expired instruments go to the expired box, everything else to the
    /// record box; without `save_copy` the entry is simply removed.
    pub fn record_payment(
        &self,
        notary_id: &NotaryId,
        nym_id: &NymId,
        number: TransactionNumber,
        save_copy: bool,
    ) -> Result<BoxType> {
        let payments_key = LedgerKey::nym_box(*notary_id, *nym_id, BoxType::PaymentInbox);
        let mut payments = self.local_box(&payments_key)?.reopen();
        let entry = payments.remove(number)?;

        let expired = entry
            .as_full()
            .and_then(|notice| notice.attachment.decode::<CronItem>().ok())
            .map(|item| item.is_expired(Utc::now()))
            .unwrap_or(false);
        let target = if expired { BoxType::ExpiredBox } else { BoxType::RecordBox };

        if save_copy {
            let key = LedgerKey::nym_box(*notary_id, *nym_id, target);
            let mut ledger = self.local_box(&key)?.reopen();
            if !ledger.contains(number) {
                ledger.add_entry(entry)?;
            }
            ledger.save(&self.storage)?;
        }
        payments.save(&self.storage)?;

        tracing::debug!(nym_id = %nym_id, number, to = %target, save_copy, "Recorded payment");
        Ok(target)
    }

    /// Entries of a local box still waiting for their box receipts
    pub fn missing_box_receipts(
        &self,
        notary_id: &NotaryId,
        nym_id: &NymId,
        account_id: Option<AccountId>,
        box_type: BoxType,
    ) -> Result<Vec<TransactionNumber>> {
        let key = match account_id {
            Some(account_id) => LedgerKey::account_box(*notary_id, *nym_id, account_id, box_type),
            None => LedgerKey::nym_box(*notary_id, *nym_id, box_type),
        };
        Ok(self.local_box(&key)?.abbreviated_numbers())
    }
}
