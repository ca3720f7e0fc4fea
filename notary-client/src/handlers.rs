//! Reply handlers
//!
//! One handler per command, looked up through a dispatch table built from
//! `MessageType::ALL`. A handler runs with the (notary, nym) context locked
//! and sees both the reply and, for buffered commands, the request it
//! answers. Returning an error leaves the request in the sent buffer.

use crate::client::Client;
use crate::context::ContextGuard;
use crate::harvest::{harvest_transaction_numbers, harvest_unsent_cron_item, HarvestFlags};
use notary_core::{
    Account, AccountId, BoxType, Error, InstrumentDefinitionId, Ledger, LedgerKey, Message,
    MessageType, Result, Transaction, TransactionNumber, TransactionResponse, TransactionType,
    UnitDefinition,
};
use std::collections::HashMap;

/// One reply being reconciled against its request
#[derive(Debug)]
pub struct Exchange<'a> {
    /// Locked context of the (notary, nym) pair
    pub context: &'a mut ContextGuard,
    sent: Option<&'a Message>,
    /// Verified reply
    pub reply: &'a Message,
    scan_nymbox: bool,
}

impl<'a> Exchange<'a> {
    /// Reply to `sent`, which is `None` for unbuffered commands
    pub fn new(context: &'a mut ContextGuard, sent: Option<&'a Message>, reply: &'a Message) -> Self {
        Self {
            context,
            sent,
            reply,
            scan_nymbox: false,
        }
    }

    /// The request this reply answers
    pub fn sent(&self) -> Result<&'a Message> {
        self.sent.ok_or(Error::ReplyNotFound(self.reply.request_number))
    }

    /// Process reply notices in the local nymbox once the context is released
    pub fn scan_nymbox(&mut self) {
        self.scan_nymbox = true;
    }

    /// Whether a nymbox scan was requested
    pub fn scans_nymbox(&self) -> bool {
        self.scan_nymbox
    }
}

/// Client-side behavior for one reply type
pub trait ReplyHandler: Send + Sync {
    /// Apply the reply to local state
    fn handle(&self, client: &Client, exchange: &mut Exchange<'_>) -> Result<()>;
}

pub(crate) fn handler_for(command: MessageType) -> Box<dyn ReplyHandler> {
    match command {
        MessageType::GetRequestNumber => Box::new(GetRequestNumber),
        MessageType::GetTransactionNumbers => Box::new(GetTransactionNumbers),
        MessageType::UnregisterNym => Box::new(UnregisterNym),
        MessageType::CheckNym => Box::new(CheckNym),
        MessageType::RegisterInstrumentDefinition | MessageType::RegisterAccount => Box::new(StoreAccount),
        MessageType::QueryInstrumentDefinitions => Box::new(QueryInstrumentDefinitions),
        MessageType::GetInstrumentDefinition => Box::new(GetInstrumentDefinition),
        MessageType::UnregisterAccount => Box::new(UnregisterAccount),
        MessageType::GetAccountData => Box::new(GetAccountData),
        MessageType::GetBoxReceipt => Box::new(GetBoxReceipt),
        MessageType::GetNymbox => Box::new(GetNymbox),
        MessageType::ProcessNymbox => Box::new(ProcessNymbox),
        MessageType::ProcessInbox => Box::new(ProcessInbox),
        MessageType::NotarizeTransaction => Box::new(NotarizeTransaction),
        MessageType::PingNotary
        | MessageType::RegisterNym
        | MessageType::SendNymMessage
        | MessageType::SendNymInstrument
        | MessageType::TriggerClause
        | MessageType::RegisterContract
        | MessageType::IssueBasket
        | MessageType::GetMint
        | MessageType::GetMarketList
        | MessageType::GetMarketOffers
        | MessageType::GetMarketRecentTrades
        | MessageType::GetNymMarketOffers
        | MessageType::RequestAdmin
        | MessageType::AddClaim
        | MessageType::UsageCredits => Box::new(LogOnly),
    }
}

/// Handler for every reply
pub(crate) fn dispatch_table() -> HashMap<MessageType, Box<dyn ReplyHandler>> {
    MessageType::ALL
        .iter()
        .map(|command| (*command, handler_for(*command)))
        .collect()
}

fn require_account_id(message: &Message) -> Result<AccountId> {
    message
        .account_id
        .ok_or_else(|| Error::Protocol(format!("{} without an account", message.command_name())))
}

fn record_harvest(client: &Client, exchange: &mut Exchange<'_>, flags: HarvestFlags) -> Result<()> {
    let sent = exchange.sent()?;
    let harvested = harvest_transaction_numbers(exchange.context, sent, flags)?;
    client.metrics().record_harvested(harvested.restored);
    for _ in 0..harvested.closed {
        client.metrics().record_closed();
    }
    Ok(())
}

fn close_numbers(client: &Client, exchange: &mut Exchange<'_>, numbers: &[TransactionNumber]) -> usize {
    let mut closed = 0;
    for number in numbers {
        if exchange.context.pool_mut().close(*number) {
            client.metrics().record_closed();
            closed += 1;
        }
    }
    closed
}

struct LogOnly;

impl ReplyHandler for LogOnly {
    fn handle(&self, _client: &Client, exchange: &mut Exchange<'_>) -> Result<()> {
        tracing::debug!(
            command = %exchange.reply.command_name(),
            success = exchange.reply.success,
            "Reply received"
        );
        Ok(())
    }
}

struct GetRequestNumber;

impl ReplyHandler for GetRequestNumber {
    fn handle(&self, _client: &Client, exchange: &mut Exchange<'_>) -> Result<()> {
        if exchange.reply.success {
            exchange.context.update_request_number(exchange.reply.new_request_number);
        }
        Ok(())
    }
}

struct GetTransactionNumbers;

impl ReplyHandler for GetTransactionNumbers {
    fn handle(&self, client: &Client, exchange: &mut Exchange<'_>) -> Result<()> {
        if !exchange.reply.success {
            return Ok(());
        }
        let numbers: Vec<TransactionNumber> = exchange.reply.payload.decode()?;
        let issued = exchange.context.pool_mut().issue(numbers.iter().copied());
        client.metrics().record_issued(issued);

        tracing::info!(
            nym_id = %exchange.context.nym_id(),
            granted = numbers.len(),
            issued,
            available = exchange.context.pool().count(),
            "Transaction numbers received"
        );
        Ok(())
    }
}

struct UnregisterNym;

impl ReplyHandler for UnregisterNym {
    fn handle(&self, client: &Client, exchange: &mut Exchange<'_>) -> Result<()> {
        if !exchange.reply.success {
            return Ok(());
        }
        let notary_id = *exchange.context.notary_id();
        let nym_id = *exchange.context.nym_id();
        for box_type in [
            BoxType::Nymbox,
            BoxType::PaymentInbox,
            BoxType::RecordBox,
            BoxType::ExpiredBox,
        ] {
            client
                .storage()
                .delete_ledger(&LedgerKey::nym_box(notary_id, nym_id, box_type))?;
        }
        exchange.context.delete();

        tracing::info!(nym_id = %nym_id, notary_id = %notary_id, "Nym unregistered");
        Ok(())
    }
}

struct CheckNym;

impl ReplyHandler for CheckNym {
    fn handle(&self, client: &Client, exchange: &mut Exchange<'_>) -> Result<()> {
        if !exchange.reply.success {
            return Ok(());
        }
        match (exchange.reply.nym_id2, exchange.reply.public_key) {
            (Some(nym_id), Some(public_key)) => client.storage().put_nym(&nym_id, &public_key),
            _ => Err(Error::Protocol("checkNym reply without a public key".to_string())),
        }
    }
}

/// registerInstrumentDefinition and registerAccount both return the new account
struct StoreAccount;

impl ReplyHandler for StoreAccount {
    fn handle(&self, client: &Client, exchange: &mut Exchange<'_>) -> Result<()> {
        if !exchange.reply.success {
            return Ok(());
        }
        let account: Account = exchange.reply.payload.decode()?;
        client.storage().put_account(&account)?;

        tracing::info!(
            account_id = %account.account_id,
            unit = %account.instrument_definition_id,
            is_issuer = account.is_issuer,
            "Account opened"
        );
        Ok(())
    }
}

struct QueryInstrumentDefinitions;

impl ReplyHandler for QueryInstrumentDefinitions {
    fn handle(&self, _client: &Client, exchange: &mut Exchange<'_>) -> Result<()> {
        if exchange.reply.success {
            let answers: Vec<(InstrumentDefinitionId, bool)> = exchange.reply.payload.decode()?;
            let known = answers.iter().filter(|(_, known)| *known).count();
            tracing::debug!(queried = answers.len(), known, "Instrument definitions queried");
        }
        Ok(())
    }
}

struct GetInstrumentDefinition;

impl ReplyHandler for GetInstrumentDefinition {
    fn handle(&self, client: &Client, exchange: &mut Exchange<'_>) -> Result<()> {
        if exchange.reply.success {
            let unit: UnitDefinition = exchange.reply.payload.decode()?;
            client.storage().put_unit(&unit)?;
        }
        Ok(())
    }
}

struct UnregisterAccount;

impl ReplyHandler for UnregisterAccount {
    fn handle(&self, client: &Client, exchange: &mut Exchange<'_>) -> Result<()> {
        if !exchange.reply.success {
            return Ok(());
        }
        let account_id = require_account_id(exchange.sent()?)?;
        let notary_id = *exchange.context.notary_id();
        let nym_id = *exchange.context.nym_id();

        client.storage().delete_account(&account_id)?;
        for box_type in [BoxType::Inbox, BoxType::Outbox, BoxType::RecordBox] {
            client
                .storage()
                .delete_ledger(&LedgerKey::account_box(notary_id, nym_id, account_id, box_type))?;
        }
        tracing::info!(account_id = %account_id, "Account closed");
        Ok(())
    }
}

struct GetAccountData;

impl ReplyHandler for GetAccountData {
    fn handle(&self, client: &Client, exchange: &mut Exchange<'_>) -> Result<()> {
        if !exchange.reply.success {
            return Ok(());
        }
        let notary_nym = client.notary_nym(exchange.context.notary_id())?;
        let account: Account = exchange.reply.payload.decode()?;
        let inbox: Ledger = exchange.reply.payload2.decode()?;
        let outbox: Ledger = exchange.reply.payload3.decode()?;
        inbox.verify_signer(&notary_nym)?;
        outbox.verify_signer(&notary_nym)?;

        client.storage().put_account(&account)?;
        let inbox = client.merge_box(&inbox)?;
        let outbox = client.merge_box(&outbox)?;

        tracing::debug!(
            account_id = %account.account_id,
            balance = account.balance,
            inbox = inbox.len(),
            outbox = outbox.len(),
            "Account data received"
        );
        Ok(())
    }
}

struct GetBoxReceipt;

impl ReplyHandler for GetBoxReceipt {
    fn handle(&self, client: &Client, exchange: &mut Exchange<'_>) -> Result<()> {
        if !exchange.reply.success {
            return Ok(());
        }
        let sent = exchange.sent()?;
        let box_type = u8::try_from(sent.depth)
            .ok()
            .and_then(BoxType::from_u8)
            .ok_or_else(|| Error::Protocol(format!("Invalid box type {}", sent.depth)))?;

        let notary_id = *exchange.context.notary_id();
        let nym_id = *exchange.context.nym_id();
        let key = if box_type.is_account_box() {
            LedgerKey::account_box(notary_id, nym_id, require_account_id(sent)?, box_type)
        } else {
            LedgerKey::nym_box(notary_id, nym_id, box_type)
        };

        let receipt: Transaction = exchange.reply.payload.decode()?;
        receipt.verify_signer(&client.notary_nym(&notary_id)?)?;
        if receipt.number != sent.transaction_number {
            return Err(Error::Protocol(format!(
                "Asked for receipt {} and got {}",
                sent.transaction_number, receipt.number
            )));
        }

        let mut ledger = client.local_box(&key)?.reopen();
        ledger.hydrate(receipt)?;
        ledger.save(client.storage())?;

        if box_type == BoxType::Nymbox {
            exchange.scan_nymbox();
        }
        tracing::debug!(key = %key, number = sent.transaction_number, "Box receipt stored");
        Ok(())
    }
}

struct GetNymbox;

impl ReplyHandler for GetNymbox {
    fn handle(&self, client: &Client, exchange: &mut Exchange<'_>) -> Result<()> {
        if !exchange.reply.success {
            return Ok(());
        }
        let nymbox: Ledger = exchange.reply.payload.decode()?;
        nymbox.verify_signer(&client.notary_nym(exchange.context.notary_id())?)?;
        let expected = LedgerKey::nymbox(*exchange.context.notary_id(), *exchange.context.nym_id());
        if *nymbox.key() != expected {
            return Err(Error::Protocol(format!("Expected {} and got {}", expected, nymbox.key())));
        }

        let hash = nymbox.hash()?;
        client.merge_box(&nymbox)?;
        exchange.context.set_local_nymbox_hash(hash);
        exchange.context.allow_flush(exchange.reply.request_number);
        exchange.scan_nymbox();

        tracing::debug!(
            nym_id = %exchange.context.nym_id(),
            entries = nymbox.len(),
            missing = nymbox.abbreviated_numbers().len(),
            "Nymbox received"
        );
        Ok(())
    }
}

struct ProcessNymbox;

impl ProcessNymbox {
    /// Settle the numbers behind an activation notice
    fn settle_notice(client: &Client, exchange: &mut Exchange<'_>, notice: &Transaction) {
        if notice.success {
            if exchange.context.remove_unsent_cron_item(notice.reference).is_some() {
                tracing::info!(opening_number = notice.reference, "Cron item activated");
            }
            return;
        }

        let restored = if exchange.context.unsent_cron_item(notice.reference).is_some() {
            harvest_unsent_cron_item(exchange.context, notice.reference)
        } else {
            let numbers = [Some(notice.reference), notice.closing_number];
            exchange
                .context
                .pool_mut()
                .harvest(numbers.into_iter().flatten(), true)
        };
        client.metrics().record_harvested(restored);
        tracing::info!(opening_number = notice.reference, restored, "Cron item was not activated");
    }
}

impl ReplyHandler for ProcessNymbox {
    fn handle(&self, client: &Client, exchange: &mut Exchange<'_>) -> Result<()> {
        if !exchange.reply.success {
            return Ok(());
        }
        let response: Ledger = exchange.sent()?.payload.decode()?;
        let notary_id = *exchange.context.notary_id();
        let nym_id = *exchange.context.nym_id();

        let mut nymbox = client.local_box(response.key())?.reopen();
        let mut payments = client
            .local_box(&LedgerKey::nym_box(notary_id, nym_id, BoxType::PaymentInbox))?
            .reopen();

        for entry in response.entries() {
            match nymbox.remove(entry.reference()) {
                Ok(_) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            // A nymbox downloaded since sending no longer holds what was accepted
            let original: Transaction = match entry.as_full() {
                Some(item) if !item.attachment.is_empty() => item.attachment.decode()?,
                _ => continue,
            };

            match original.kind {
                TransactionType::InstrumentNotice => {
                    if !payments.contains(original.number) {
                        payments.add_transaction(original.clone())?;
                    }
                }
                TransactionType::Notice => Self::settle_notice(client, exchange, &original),
                TransactionType::MessageNotice => {
                    tracing::info!(
                        from = ?original.sender.as_ref().map(|party| party.nym_id),
                        number = original.number,
                        "Message accepted"
                    );
                }
                other => tracing::debug!(number = original.number, kind = %other, "Nymbox entry accepted"),
            }
        }

        nymbox.save(client.storage())?;
        payments.save(client.storage())?;
        Ok(())
    }
}

struct ProcessInbox;

impl ReplyHandler for ProcessInbox {
    fn handle(&self, client: &Client, exchange: &mut Exchange<'_>) -> Result<()> {
        if !exchange.reply.success {
            return record_harvest(client, exchange, HarvestFlags::reply_failed());
        }
        let outcome: TransactionResponse = exchange.reply.payload.decode()?;
        if !outcome.success {
            tracing::warn!(
                opening_number = outcome.number,
                reason = ?outcome.reason,
                balance_agreement = outcome.balance_agreement_success,
                "Inbox processing refused"
            );
            return record_harvest(client, exchange, HarvestFlags::transaction_failed());
        }

        let response: Ledger = exchange.sent()?.payload.decode()?;
        let opening = response
            .statement()
            .and_then(|statement| statement.opening_number)
            .ok_or_else(|| Error::Protocol("Inbox response without an opening number".to_string()))?;
        let account_id = response
            .key()
            .account_id
            .ok_or_else(|| Error::Protocol("Inbox response without an account".to_string()))?;

        let mut inbox = client.local_box(response.key())?.reopen();
        let record_key = LedgerKey::account_box(
            *exchange.context.notary_id(),
            *exchange.context.nym_id(),
            account_id,
            BoxType::RecordBox,
        );
        let mut record = client.local_box(&record_key)?.reopen();

        let mut closes = vec![opening];
        for item in response.entries() {
            let entry = match inbox.remove(item.reference()) {
                Ok(entry) => entry,
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if item.kind() != TransactionType::AcceptItem {
                continue;
            }
            if let Some(original) = entry.as_full() {
                match original.kind {
                    TransactionType::TransferReceipt | TransactionType::ChequeReceipt => {
                        closes.push(original.reference);
                    }
                    TransactionType::FinalReceipt => {
                        closes.push(original.reference);
                        closes.extend(original.closing_number);
                    }
                    _ => {}
                }
            }
            if !record.contains(entry.number()) {
                record.add_entry(entry)?;
            }
        }

        let closed = close_numbers(client, exchange, &closes);
        inbox.save(client.storage())?;
        record.save(client.storage())?;
        if let Some(account) = outcome.account {
            client.storage().put_account(&account)?;
        }

        tracing::info!(
            account_id = %account_id,
            processed = response.len(),
            closed,
            "Inbox processed"
        );
        Ok(())
    }
}

struct NotarizeTransaction;

impl ReplyHandler for NotarizeTransaction {
    fn handle(&self, client: &Client, exchange: &mut Exchange<'_>) -> Result<()> {
        if !exchange.reply.success {
            return record_harvest(client, exchange, HarvestFlags::reply_failed());
        }
        let transaction: Transaction = exchange.sent()?.payload.decode()?;
        let outcome: TransactionResponse = exchange.reply.payload.decode()?;

        if !outcome.success {
            tracing::warn!(
                opening_number = transaction.number,
                kind = %transaction.kind,
                reason = ?outcome.reason,
                balance_agreement = outcome.balance_agreement_success,
                "Transaction refused"
            );
            record_harvest(client, exchange, HarvestFlags::transaction_failed())?;
            if transaction.kind == TransactionType::ActivateCronItem {
                exchange.context.remove_unsent_cron_item(transaction.number);
            }
            return Ok(());
        }

        match transaction.kind {
            TransactionType::CancelCronItem => {
                close_numbers(client, exchange, &[transaction.number]);
            }
            TransactionType::ActivateCronItem => {
                exchange.context.remove_unsent_cron_item(transaction.number);
            }
            _ => {}
        }
        if let Some(account) = outcome.account {
            client.storage().put_account(&account)?;
        }

        tracing::info!(
            opening_number = transaction.number,
            kind = %transaction.kind,
            amount = transaction.amount,
            "Transaction accepted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_command_has_a_handler() {
        let table = dispatch_table();
        assert_eq!(table.len(), MessageType::ALL.len());
        for command in MessageType::ALL.iter() {
            assert!(table.contains_key(command), "missing handler for {}", command);
        }
    }
}
