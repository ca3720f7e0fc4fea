//! Command handlers
//!
//! One handler per command, looked up through a dispatch table built from
//! `MessageType::ALL`. Handlers run after authentication and, for buffered
//! commands, with the sender's context locked and attached to the reply.
//! Returning an error fails the reply; nothing a handler has not yet
//! written is persisted.

use crate::notary::Notary;
use crate::reply::ReplyMessage;
use crate::transactions::{NotarizeTransaction, ProcessInbox};
use notary_core::{
    Armored, BoxType, Error, InstrumentDefinitionId, Ledger, LedgerKey, LedgerRole, Message,
    MessageType, Party, Result, TransactionNumber, TransactionType, UnitDefinition,
};
use std::collections::{BTreeSet, HashMap};

/// Server-side behavior of one command
pub trait CommandHandler: Send + Sync {
    /// Fill in the reply; the caller signs and commits it
    fn handle(&self, notary: &Notary, request: &Message, reply: &mut ReplyMessage<'_>) -> Result<()>;
}

pub(crate) fn handler_for(command: MessageType) -> Box<dyn CommandHandler> {
    match command {
        MessageType::PingNotary => Box::new(PingNotary),
        MessageType::RegisterNym => Box::new(RegisterNym),
        MessageType::UnregisterNym => Box::new(UnregisterNym),
        MessageType::GetRequestNumber => Box::new(GetRequestNumber),
        MessageType::GetTransactionNumbers => Box::new(GetTransactionNumbers),
        MessageType::CheckNym => Box::new(CheckNym),
        MessageType::SendNymMessage => Box::new(SendToNym(TransactionType::MessageNotice)),
        MessageType::SendNymInstrument => Box::new(SendToNym(TransactionType::InstrumentNotice)),
        MessageType::RegisterInstrumentDefinition => Box::new(RegisterInstrumentDefinition),
        MessageType::QueryInstrumentDefinitions => Box::new(QueryInstrumentDefinitions),
        MessageType::GetInstrumentDefinition => Box::new(GetInstrumentDefinition),
        MessageType::RegisterAccount => Box::new(RegisterAccount),
        MessageType::UnregisterAccount => Box::new(UnregisterAccount),
        MessageType::GetAccountData => Box::new(GetAccountData),
        MessageType::GetBoxReceipt => Box::new(GetBoxReceipt),
        MessageType::GetNymbox => Box::new(GetNymbox),
        MessageType::ProcessNymbox => Box::new(ProcessNymbox),
        MessageType::ProcessInbox => Box::new(ProcessInbox),
        MessageType::NotarizeTransaction => Box::new(NotarizeTransaction),
        MessageType::TriggerClause => Box::new(TriggerClause),
        MessageType::RegisterContract
        | MessageType::IssueBasket
        | MessageType::GetMint
        | MessageType::GetMarketList
        | MessageType::GetMarketOffers
        | MessageType::GetMarketRecentTrades
        | MessageType::GetNymMarketOffers
        | MessageType::RequestAdmin
        | MessageType::AddClaim
        | MessageType::UsageCredits => Box::new(Unsupported),
    }
}

/// Handler for every command
pub(crate) fn dispatch_table() -> HashMap<MessageType, Box<dyn CommandHandler>> {
    MessageType::ALL
        .iter()
        .map(|command| (*command, handler_for(*command)))
        .collect()
}

pub(crate) fn require_context<'r>(reply: &'r mut ReplyMessage<'_>) -> Result<&'r mut crate::context::Editor> {
    reply
        .context_mut()
        .ok_or_else(|| Error::Protocol("Command requires a client context".to_string()))
}

fn require_account_id(request: &Message) -> Result<notary_core::AccountId> {
    request
        .account_id
        .ok_or_else(|| Error::Protocol(format!("{} without an account", request.command)))
}

struct PingNotary;

impl CommandHandler for PingNotary {
    fn handle(&self, _notary: &Notary, _request: &Message, reply: &mut ReplyMessage<'_>) -> Result<()> {
        reply.set_success(true);
        Ok(())
    }
}

struct RegisterNym;

impl CommandHandler for RegisterNym {
    fn handle(&self, notary: &Notary, request: &Message, reply: &mut ReplyMessage<'_>) -> Result<()> {
        let public_key = request
            .public_key
            .ok_or_else(|| Error::Protocol("registerNym without a public key".to_string()))?;

        notary.storage().put_nym(&request.nym_id, &public_key)?;
        let context = notary.contexts().edit_or_create(&request.nym_id)?;
        reply.set_context(context);
        reply.set_success(true);

        tracing::info!(nym_id = %request.nym_id, "Nym registered");
        Ok(())
    }
}

struct UnregisterNym;

impl CommandHandler for UnregisterNym {
    fn handle(&self, notary: &Notary, request: &Message, reply: &mut ReplyMessage<'_>) -> Result<()> {
        let accounts = notary.storage().accounts_of(&request.nym_id)?;
        if !accounts.is_empty() {
            return Err(Error::InvalidTransaction(format!(
                "Nym {} still owns {} accounts",
                request.nym_id,
                accounts.len()
            )));
        }

        let context = require_context(reply)?;
        for number in context.pool().issued().clone() {
            notary.close_number(context, number)?;
        }
        context.delete();

        notary.storage().delete_ledger(&LedgerKey::nymbox(*notary.notary_id(), request.nym_id))?;
        notary.storage().delete_nym(&request.nym_id)?;
        reply.set_success(true);

        tracing::info!(nym_id = %request.nym_id, "Nym unregistered");
        Ok(())
    }
}

struct GetRequestNumber;

impl CommandHandler for GetRequestNumber {
    fn handle(&self, notary: &Notary, request: &Message, reply: &mut ReplyMessage<'_>) -> Result<()> {
        let context = notary
            .contexts()
            .edit(&request.nym_id)?
            .ok_or_else(|| Error::NotFound(format!("Nym {} is not registered", request.nym_id)))?;

        reply.message_mut().new_request_number = context.request_number();
        reply.set_context(context);
        reply.set_success(true);
        Ok(())
    }
}

struct GetTransactionNumbers;

impl CommandHandler for GetTransactionNumbers {
    fn handle(&self, notary: &Notary, request: &Message, reply: &mut ReplyMessage<'_>) -> Result<()> {
        // A positive depth asks for a smaller batch
        let count = match usize::try_from(request.depth) {
            Ok(wanted) if wanted > 0 => wanted.min(notary.config().numbers_per_request),
            _ => notary.config().numbers_per_request,
        };
        let max_issued = notary.config().max_issued_numbers;

        let context = require_context(reply)?;
        if context.pool().issued_count() + count > max_issued {
            return Err(Error::InvalidTransaction(format!(
                "Nym {} already holds {} issued numbers",
                request.nym_id,
                context.pool().issued_count()
            )));
        }

        let numbers = notary.storage().allocate_numbers(count, &request.nym_id)?;
        let added = context.pool_mut().issue(numbers.iter().copied());
        if added != numbers.len() {
            return Err(Error::DuplicateNumber(numbers.first().copied().unwrap_or_default()));
        }

        notary.metrics().record_issued(added);
        tracing::info!(nym_id = %request.nym_id, count = added, "Issued transaction numbers");

        reply.set_payload(&numbers)?;
        reply.set_success(true);
        Ok(())
    }
}

struct CheckNym;

impl CommandHandler for CheckNym {
    fn handle(&self, notary: &Notary, request: &Message, reply: &mut ReplyMessage<'_>) -> Result<()> {
        let target = request
            .nym_id2
            .ok_or_else(|| Error::Protocol("checkNym without a target nym".to_string()))?;
        let public_key = notary
            .storage()
            .get_nym(&target)?
            .ok_or_else(|| Error::NotFound(format!("Nym {}", target)))?;

        reply.message_mut().public_key = Some(public_key);
        reply.set_success(true);
        Ok(())
    }
}

/// Deliver a message or instrument to another nym's nymbox
struct SendToNym(TransactionType);

impl CommandHandler for SendToNym {
    fn handle(&self, notary: &Notary, request: &Message, reply: &mut ReplyMessage<'_>) -> Result<()> {
        let recipient = request
            .nym_id2
            .ok_or_else(|| Error::Protocol(format!("{} without a recipient", request.command)))?;
        if notary.storage().get_nym(&recipient)?.is_none() {
            return Err(Error::NotFound(format!("Nym {}", recipient)));
        }

        let mut notice = notary_core::Transaction::new(*notary.notary_id(), recipient, self.0, 0);
        notice.sender = Some(Party {
            nym_id: request.nym_id,
            account_id: None,
        });
        notice.recipient = Some(Party {
            nym_id: recipient,
            account_id: None,
        });
        notice.attachment = request.payload.clone();
        let number = notary.drop_notice(&recipient, notice)?;

        tracing::debug!(from = %request.nym_id, to = %recipient, number, kind = %self.0, "Delivered to nymbox");
        reply.set_success(true);
        Ok(())
    }
}

struct RegisterInstrumentDefinition;

impl CommandHandler for RegisterInstrumentDefinition {
    fn handle(&self, notary: &Notary, request: &Message, reply: &mut ReplyMessage<'_>) -> Result<()> {
        let unit: UnitDefinition = request.payload.decode()?;
        if unit.issuer != request.nym_id {
            return Err(Error::InvalidTransaction(format!(
                "Unit definition names {} as issuer",
                unit.issuer
            )));
        }
        if notary.storage().get_unit(&unit.id()?)?.is_some() {
            return Err(Error::InvalidTransaction(format!("{} is already registered", unit.symbol)));
        }

        let unit_id = notary.storage().put_unit(&unit)?;
        let account = notary.open_account(&request.nym_id, unit_id, true, request.request_number)?;

        tracing::info!(unit_id = %unit_id, symbol = %unit.symbol, "Instrument definition registered");
        reply.message_mut().account_id = Some(account.account_id);
        reply.message_mut().payload2 = Armored::encode(&unit_id)?;
        reply.set_payload(&account)?;
        reply.set_success(true);
        Ok(())
    }
}

struct QueryInstrumentDefinitions;

impl CommandHandler for QueryInstrumentDefinitions {
    fn handle(&self, notary: &Notary, request: &Message, reply: &mut ReplyMessage<'_>) -> Result<()> {
        let queried: Vec<InstrumentDefinitionId> = request.payload.decode()?;
        let answers = queried
            .into_iter()
            .map(|id| Ok((id, notary.storage().get_unit(&id)?.is_some())))
            .collect::<Result<Vec<_>>>()?;

        reply.set_payload(&answers)?;
        reply.set_success(true);
        Ok(())
    }
}

struct GetInstrumentDefinition;

impl CommandHandler for GetInstrumentDefinition {
    fn handle(&self, notary: &Notary, request: &Message, reply: &mut ReplyMessage<'_>) -> Result<()> {
        let id: InstrumentDefinitionId = request.payload.decode()?;
        let unit = notary
            .storage()
            .get_unit(&id)?
            .ok_or_else(|| Error::NotFound(format!("Instrument definition {}", id)))?;

        reply.set_payload(&unit)?;
        reply.set_success(true);
        Ok(())
    }
}

struct RegisterAccount;

impl CommandHandler for RegisterAccount {
    fn handle(&self, notary: &Notary, request: &Message, reply: &mut ReplyMessage<'_>) -> Result<()> {
        let unit_id: InstrumentDefinitionId = request.payload.decode()?;
        if notary.storage().get_unit(&unit_id)?.is_none() {
            return Err(Error::NotFound(format!("Instrument definition {}", unit_id)));
        }

        let account = notary.open_account(&request.nym_id, unit_id, false, request.request_number)?;
        reply.message_mut().account_id = Some(account.account_id);
        reply.set_payload(&account)?;
        reply.set_success(true);
        Ok(())
    }
}

struct UnregisterAccount;

impl CommandHandler for UnregisterAccount {
    fn handle(&self, notary: &Notary, request: &Message, reply: &mut ReplyMessage<'_>) -> Result<()> {
        let account = notary.owned_account(&request.nym_id, &require_account_id(request)?)?;
        if account.balance != 0 {
            return Err(Error::InvalidTransaction(format!(
                "Account {} has balance {}",
                account.account_id, account.balance
            )));
        }

        let keys = [
            notary.account_box_key(&account, BoxType::Inbox),
            notary.account_box_key(&account, BoxType::Outbox),
        ];
        for key in &keys {
            if !notary.load_box(key)?.is_empty() {
                return Err(Error::InvalidTransaction(format!("{} is not empty", key)));
            }
        }

        for key in &keys {
            notary.storage().delete_ledger(key)?;
        }
        notary.storage().delete_account(&account.account_id)?;

        tracing::info!(nym_id = %request.nym_id, account_id = %account.account_id, "Account closed");
        reply.set_success(true);
        Ok(())
    }
}

struct GetAccountData;

impl CommandHandler for GetAccountData {
    fn handle(&self, notary: &Notary, request: &Message, reply: &mut ReplyMessage<'_>) -> Result<()> {
        let account = notary.owned_account(&request.nym_id, &require_account_id(request)?)?;
        let inbox = notary.load_box(&notary.account_box_key(&account, BoxType::Inbox))?;
        let outbox = notary.load_box(&notary.account_box_key(&account, BoxType::Outbox))?;

        let message = reply.message_mut();
        message.inbox_hash = Some(inbox.hash()?);
        message.outbox_hash = Some(outbox.hash()?);
        message.payload2 = Armored::encode(&inbox)?;
        message.payload3 = Armored::encode(&outbox)?;
        reply.set_payload(&account)?;
        reply.set_success(true);
        Ok(())
    }
}

struct GetBoxReceipt;

impl CommandHandler for GetBoxReceipt {
    fn handle(&self, notary: &Notary, request: &Message, reply: &mut ReplyMessage<'_>) -> Result<()> {
        let box_type = u8::try_from(request.depth)
            .ok()
            .and_then(BoxType::from_u8)
            .filter(|box_type| matches!(box_type, BoxType::Nymbox | BoxType::Inbox | BoxType::Outbox))
            .ok_or_else(|| Error::Protocol(format!("No box receipts for depth {}", request.depth)))?;

        let key = match box_type {
            BoxType::Nymbox => LedgerKey::nymbox(*notary.notary_id(), request.nym_id),
            _ => {
                let account = notary.owned_account(&request.nym_id, &require_account_id(request)?)?;
                notary.account_box_key(&account, box_type)
            }
        };

        let receipt = notary.box_receipt(&key, request.transaction_number)?;
        reply.set_payload(&receipt)?;
        reply.set_success(true);
        Ok(())
    }
}

struct GetNymbox;

impl CommandHandler for GetNymbox {
    fn handle(&self, notary: &Notary, request: &Message, reply: &mut ReplyMessage<'_>) -> Result<()> {
        let key = LedgerKey::nymbox(*notary.notary_id(), request.nym_id);
        let nymbox = notary.load_box(&key)?;
        let nymbox = if nymbox.signer().is_some() {
            nymbox
        } else {
            notary.save_box(nymbox)?
        };

        reply.set_payload(&nymbox)?;
        reply.set_success(true);
        Ok(())
    }
}

struct ProcessNymbox;

impl CommandHandler for ProcessNymbox {
    fn handle(&self, notary: &Notary, request: &Message, reply: &mut ReplyMessage<'_>) -> Result<()> {
        let response: Ledger = request.payload.decode()?;
        response.verify_signer(&request.nym_id)?;

        let key = LedgerKey::nymbox(*notary.notary_id(), request.nym_id);
        if response.role() != LedgerRole::Response || *response.key() != key {
            return Err(Error::InvalidTransaction("Not a response to the nymbox".to_string()));
        }
        let statement = response
            .statement()
            .ok_or_else(|| Error::InvalidTransaction("Nymbox response without a statement".to_string()))?;

        let context = require_context(reply)?;
        if statement.issued != *context.pool().issued() || statement.account_id.is_some() {
            return Err(Error::InvalidTransaction(format!(
                "Nymbox statement of {} disagrees with issued numbers",
                request.nym_id
            )));
        }

        let nymbox = notary.load_box(&key)?;
        let mut accepted: BTreeSet<TransactionNumber> = BTreeSet::new();
        for entry in response.entries() {
            let item = entry
                .as_full()
                .filter(|item| item.kind == TransactionType::AcceptItem)
                .ok_or_else(|| Error::InvalidTransaction(format!("Item {} is not an acceptance", entry.number())))?;
            if !nymbox.contains(item.reference) {
                return Err(Error::InvalidTransaction(format!("Nymbox has no entry {}", item.reference)));
            }
            accepted.insert(item.reference);
        }

        let mut nymbox = nymbox.reopen();
        for number in &accepted {
            nymbox.remove(*number)?;
            notary.storage().delete_box_receipt(&key, *number)?;
        }
        notary.save_box(nymbox)?;

        tracing::debug!(nym_id = %request.nym_id, accepted = accepted.len(), "Processed nymbox");
        reply.set_success(true);
        Ok(())
    }
}

struct TriggerClause;

impl CommandHandler for TriggerClause {
    fn handle(&self, notary: &Notary, request: &Message, reply: &mut ReplyMessage<'_>) -> Result<()> {
        let item = notary
            .storage()
            .get_cron_item(request.transaction_number)?
            .ok_or_else(|| Error::NotFound(format!("Cron item {}", request.transaction_number)))?;
        if !item.is_party(&request.nym_id) {
            return Err(Error::InvalidTransaction(format!(
                "{} is not a party to cron item {}",
                request.nym_id, request.transaction_number
            )));
        }

        tracing::info!(nym_id = %request.nym_id, item = request.transaction_number, "Clause triggered");
        reply.set_success(true);
        Ok(())
    }
}

struct Unsupported;

impl CommandHandler for Unsupported {
    fn handle(&self, _notary: &Notary, request: &Message, reply: &mut ReplyMessage<'_>) -> Result<()> {
        tracing::warn!(command = %request.command, "Command not supported by this notary");
        reply.set_success(false);
        Ok(())
    }
}
