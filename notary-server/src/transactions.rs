//! Transaction processing for notarizeTransaction and processInbox
//!
//! Every transaction carries a balance statement: the issued set (and, for
//! account transactions, the balance) as it will stand once the transaction
//! completes. The notary computes the same statement independently and
//! refuses the transaction unless both agree.
//!
//! # Number accounting
//!
//! - Message-level failure (bad signature, unknown nym, replay): nothing
//!   is consumed and the client may harvest its numbers.
//! - Transaction failure: the opening number is burned (closed).
//! - Transfer and cron activation consume their numbers, which stay issued
//!   until the closing receipts are processed.
//! - Cancellation and inbox processing close their opening number at once.

use crate::context::Editor;
use crate::handlers::{require_context, CommandHandler};
use crate::notary::Notary;
use crate::reply::ReplyMessage;
use notary_core::{
    Account, AccountId, Amount, Armored, BalanceStatement, BoxType, CronItem, Error, Ledger,
    LedgerRole, Message, Party, Result, Transaction, TransactionNumber, TransactionResponse,
    TransactionType,
};
use std::collections::{BTreeMap, BTreeSet};

/// Result of a transaction that passed message-level checks
#[derive(Debug)]
enum Outcome {
    Done(Option<Account>),
    Rejected { balance_agreement: bool, reason: String },
}

fn rejected(balance_agreement: bool, reason: impl Into<String>) -> Outcome {
    Outcome::Rejected {
        balance_agreement,
        reason: reason.into(),
    }
}

/// Invalid or missing objects fail the transaction; anything else fails the message
fn classify(result: Result<Outcome>) -> Result<Outcome> {
    match result {
        Err(Error::InvalidTransaction(reason)) => Ok(rejected(false, reason)),
        Err(Error::NotFound(reason)) => Ok(rejected(false, format!("Not found: {}", reason))),
        other => other,
    }
}

fn check_statement(claimed: Option<&BalanceStatement>, expected: &BalanceStatement) -> Option<Outcome> {
    match claimed {
        Some(statement) if statement == expected => None,
        Some(statement) => {
            tracing::warn!(
                nym_id = %expected.nym_id,
                opening_number = ?expected.opening_number,
                claimed_issued = statement.issued.len(),
                expected_issued = expected.issued.len(),
                claimed_balance = ?statement.balance,
                expected_balance = ?expected.balance,
                "Balance statement mismatch"
            );
            Some(rejected(false, "Balance statement does not match the notary's records"))
        }
        None => Some(rejected(false, "Missing balance statement")),
    }
}

/// Turn an outcome into the reply payload, burning the opening number on failure
fn settle(notary: &Notary, context: &mut Editor, opening: TransactionNumber, outcome: Outcome) -> Result<TransactionResponse> {
    match outcome {
        Outcome::Done(account) => Ok(TransactionResponse {
            number: opening,
            balance_agreement_success: true,
            success: true,
            account,
            reason: None,
        }),
        Outcome::Rejected {
            balance_agreement,
            reason,
        } => {
            let burned = notary.close_number(context, opening)?;
            tracing::warn!(
                nym_id = %context.nym_id(),
                opening_number = opening,
                burned,
                reason = %reason,
                "Transaction failed"
            );
            Ok(TransactionResponse {
                number: opening,
                balance_agreement_success: balance_agreement,
                success: false,
                account: None,
                reason: Some(reason),
            })
        }
    }
}

pub(crate) struct NotarizeTransaction;

impl CommandHandler for NotarizeTransaction {
    fn handle(&self, notary: &Notary, request: &Message, reply: &mut ReplyMessage<'_>) -> Result<()> {
        let transaction: Transaction = request.payload.decode()?;
        transaction.verify_signer(&request.nym_id)?;
        if transaction.notary_id != *notary.notary_id() || transaction.nym_id != request.nym_id {
            return Err(Error::InvalidTransaction(
                "Transaction addressed to another nym or notary".to_string(),
            ));
        }
        if transaction.number != request.transaction_number {
            return Err(Error::InvalidTransaction(format!(
                "Transaction {} sent as {}",
                transaction.number, request.transaction_number
            )));
        }

        let opening = transaction.number;
        let context = require_context(reply)?;
        let outcome = if !context.pool().is_available(opening) {
            rejected(false, format!("Transaction number {} is not available", opening))
        } else {
            let result = match transaction.kind {
                TransactionType::Transfer => transfer(notary, context, &transaction),
                TransactionType::ActivateCronItem => activate_cron_item(notary, context, &transaction),
                TransactionType::CancelCronItem => cancel_cron_item(notary, context, &transaction),
                other => Ok(rejected(false, format!("{} cannot be notarized", other))),
            };
            classify(result)?
        };

        let response = settle(notary, context, opening, outcome)?;
        reply.message_mut().transaction_number = opening;
        reply.set_payload(&response)?;
        reply.set_success(true);
        Ok(())
    }
}

fn transfer(notary: &Notary, context: &mut Editor, transaction: &Transaction) -> Result<Outcome> {
    let account_id = transaction
        .account_id
        .ok_or_else(|| Error::InvalidTransaction("Transfer without a source account".to_string()))?;
    let mut account = notary.owned_account(&transaction.nym_id, &account_id)?;

    let recipient_id = transaction
        .recipient
        .as_ref()
        .and_then(|party| party.account_id)
        .ok_or_else(|| Error::InvalidTransaction("Transfer without a recipient account".to_string()))?;
    let recipient = notary
        .storage()
        .get_account(&recipient_id)?
        .ok_or_else(|| Error::NotFound(format!("Account {}", recipient_id)))?;

    if recipient.account_id == account.account_id {
        return Ok(rejected(false, "Transfer to the source account"));
    }
    if recipient.instrument_definition_id != account.instrument_definition_id {
        return Ok(rejected(false, "Accounts hold different instrument definitions"));
    }
    if transaction.amount <= 0 {
        return Ok(rejected(false, format!("Invalid amount {}", transaction.amount)));
    }

    let balance = account.debited(transaction.amount)?;
    let expected = BalanceStatement {
        notary_id: *notary.notary_id(),
        nym_id: transaction.nym_id,
        account_id: Some(account_id),
        opening_number: Some(transaction.number),
        issued: context.pool().issued().clone(),
        balance: Some(balance),
    };
    if let Some(rejection) = check_statement(transaction.statement.as_ref(), &expected) {
        return Ok(rejection);
    }
    if !account.can_debit(transaction.amount) {
        return Ok(rejected(true, "Insufficient funds"));
    }

    let mut outgoing = Transaction::new(
        *notary.notary_id(),
        transaction.nym_id,
        TransactionType::Pending,
        transaction.number,
    );
    outgoing.account_id = Some(account_id);
    outgoing.reference = transaction.number;
    outgoing.sender = Some(Party {
        nym_id: transaction.nym_id,
        account_id: Some(account_id),
    });
    outgoing.recipient = Some(Party {
        nym_id: recipient.nym_id,
        account_id: Some(recipient.account_id),
    });
    outgoing.amount = transaction.amount;
    outgoing.attachment = Armored::encode(transaction)?;

    let mut incoming = outgoing.clone();
    incoming.nym_id = recipient.nym_id;
    incoming.account_id = Some(recipient.account_id);
    incoming.number = notary.storage().allocate_unowned_number()?;

    account.balance = balance;
    notary.storage().put_account(&account)?;
    notary.add_receipt(&notary.account_box_key(&account, BoxType::Outbox), outgoing)?;
    notary.add_receipt(&notary.account_box_key(&recipient, BoxType::Inbox), incoming)?;
    // The pool changes only once storage is written
    context.pool_mut().consume(transaction.number)?;

    tracing::info!(
        from = %account.account_id,
        to = %recipient.account_id,
        amount = transaction.amount,
        opening_number = transaction.number,
        "Transfer pending"
    );
    Ok(Outcome::Done(Some(account)))
}

fn activate_cron_item(notary: &Notary, context: &mut Editor, transaction: &Transaction) -> Result<Outcome> {
    let item: CronItem = transaction.attachment.decode()?;
    let item_id = item
        .id()
        .ok_or_else(|| Error::InvalidTransaction("Activator is not a party".to_string()))?;
    if item.notary_id != *notary.notary_id() || item.activator != transaction.nym_id || item_id != transaction.number {
        return Err(Error::InvalidTransaction(format!(
            "Cron item {} does not match its activation",
            item_id
        )));
    }

    let result = classify(try_activate(notary, context, transaction, &item, item_id));
    let success = matches!(result, Ok(Outcome::Done(_)));

    // The other parties learn the outcome through their nymboxes
    for party in item.non_activators() {
        let mut notice = Transaction::new(*notary.notary_id(), party.nym_id, TransactionType::Notice, 0);
        notice.account_id = Some(party.account_id);
        notice.reference = party.opening_number;
        notice.closing_number = Some(party.closing_number);
        notice.success = success;
        notice.origin = item.kind.origin();
        notice.attachment = Armored::encode(&item)?;
        notary.drop_notice(&party.nym_id, notice)?;
    }

    result
}

fn try_activate(
    notary: &Notary,
    context: &mut Editor,
    transaction: &Transaction,
    item: &CronItem,
    item_id: TransactionNumber,
) -> Result<Outcome> {
    item.verify_parties()?;
    if notary.storage().get_cron_item(item_id)?.is_some() {
        return Ok(rejected(false, format!("Cron item {} is already active", item_id)));
    }

    let activator = item
        .party(&transaction.nym_id)
        .ok_or_else(|| Error::InvalidTransaction("Activator is not a party".to_string()))?;
    if !context.pool().is_available(activator.closing_number) {
        return Ok(rejected(false, format!("Closing number {} is not available", activator.closing_number)));
    }
    let account = notary.owned_account(&transaction.nym_id, &activator.account_id)?;
    if transaction.account_id != Some(account.account_id) {
        return Ok(rejected(false, "Activation names another account"));
    }

    let expected = BalanceStatement {
        notary_id: *notary.notary_id(),
        nym_id: transaction.nym_id,
        account_id: Some(account.account_id),
        opening_number: Some(transaction.number),
        issued: context.pool().issued().clone(),
        balance: Some(account.balance),
    };
    if let Some(rejection) = check_statement(transaction.statement.as_ref(), &expected) {
        return Ok(rejection);
    }

    // Every party is checked before any number is consumed
    let mut others = Vec::new();
    for party in item.non_activators() {
        let editor = notary
            .contexts()
            .edit(&party.nym_id)?
            .ok_or_else(|| Error::NotFound(format!("Nym {}", party.nym_id)))?;
        notary.owned_account(&party.nym_id, &party.account_id)?;
        if let Some(number) = party.numbers().into_iter().find(|n| !editor.pool().is_available(*n)) {
            return Ok(rejected(true, format!("Party {} cannot use number {}", party.nym_id, number)));
        }
        others.push((editor, party));
    }

    notary.storage().put_cron_item(item_id, item)?;
    for number in activator.numbers() {
        context.pool_mut().consume(number)?;
    }
    for (editor, party) in &mut others {
        for number in party.numbers() {
            editor.pool_mut().consume(number)?;
        }
    }

    tracing::info!(item = item_id, kind = ?item.kind, parties = item.parties.len(), "Cron item activated");
    Ok(Outcome::Done(Some(account)))
}

fn cancel_cron_item(notary: &Notary, context: &mut Editor, transaction: &Transaction) -> Result<Outcome> {
    let item_id = transaction.reference;
    let item = notary
        .storage()
        .get_cron_item(item_id)?
        .ok_or_else(|| Error::NotFound(format!("Cron item {}", item_id)))?;
    if !item.is_party(&transaction.nym_id) {
        return Ok(rejected(false, format!("{} is not a party to {}", transaction.nym_id, item_id)));
    }

    let account = match transaction.account_id {
        Some(account_id) => Some(notary.owned_account(&transaction.nym_id, &account_id)?),
        None => None,
    };
    let party_accounts = item
        .parties
        .iter()
        .map(|party| {
            notary
                .storage()
                .get_account(&party.account_id)?
                .ok_or_else(|| Error::NotFound(format!("Account {}", party.account_id)))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut issued = context.pool().issued().clone();
    issued.remove(&transaction.number);
    let expected = BalanceStatement {
        notary_id: *notary.notary_id(),
        nym_id: transaction.nym_id,
        account_id: transaction.account_id,
        opening_number: Some(transaction.number),
        issued,
        balance: account.as_ref().map(|account| account.balance),
    };
    if let Some(rejection) = check_statement(transaction.statement.as_ref(), &expected) {
        return Ok(rejection);
    }

    notary.storage().delete_cron_item(item_id)?;
    for (party, party_account) in item.parties.iter().zip(&party_accounts) {
        let number = notary.storage().allocate_unowned_number()?;
        let mut receipt = Transaction::new(*notary.notary_id(), party.nym_id, TransactionType::FinalReceipt, number);
        receipt.account_id = Some(party.account_id);
        receipt.reference = party.opening_number;
        receipt.closing_number = Some(party.closing_number);
        receipt.cancelled = true;
        receipt.origin = item.kind.origin();
        receipt.attachment = Armored::encode(&item)?;
        notary.add_receipt(&notary.account_box_key(party_account, BoxType::Inbox), receipt)?;
    }
    notary.close_number(context, transaction.number)?;

    tracing::info!(item = item_id, by = %transaction.nym_id, "Cron item cancelled");
    Ok(Outcome::Done(account))
}

pub(crate) struct ProcessInbox;

impl CommandHandler for ProcessInbox {
    fn handle(&self, notary: &Notary, request: &Message, reply: &mut ReplyMessage<'_>) -> Result<()> {
        let response: Ledger = request.payload.decode()?;
        response.verify_signer(&request.nym_id)?;

        let key = *response.key();
        if response.role() != LedgerRole::Response
            || key.box_type != BoxType::Inbox
            || key.nym_id != request.nym_id
            || key.notary_id != *notary.notary_id()
        {
            return Err(Error::InvalidTransaction("Not a response to an inbox".to_string()));
        }
        let opening = response
            .statement()
            .and_then(|statement| statement.opening_number)
            .ok_or_else(|| Error::InvalidTransaction("Inbox response without an opening number".to_string()))?;
        if opening != request.transaction_number {
            return Err(Error::InvalidTransaction(format!(
                "Inbox response opened by {} sent as {}",
                opening, request.transaction_number
            )));
        }

        let context = require_context(reply)?;
        let outcome = if !context.pool().is_available(opening) {
            rejected(false, format!("Transaction number {} is not available", opening))
        } else {
            classify(process_inbox(notary, context, &response, opening))?
        };

        let response = settle(notary, context, opening, outcome)?;
        reply.message_mut().transaction_number = opening;
        reply.set_payload(&response)?;
        reply.set_success(true);
        Ok(())
    }
}

fn process_inbox(notary: &Notary, context: &mut Editor, response: &Ledger, opening: TransactionNumber) -> Result<Outcome> {
    let account_id = response
        .key()
        .account_id
        .ok_or_else(|| Error::InvalidTransaction("Inbox response without an account".to_string()))?;
    let mut account = notary.owned_account(context.nym_id(), &account_id)?;
    let inbox_key = notary.account_box_key(&account, BoxType::Inbox);
    let inbox = notary.load_box(&inbox_key)?;

    let mut closes = BTreeSet::new();
    let mut credit: Amount = 0;
    let mut senders: BTreeMap<AccountId, Account> = BTreeMap::new();
    let mut settled: Vec<(Transaction, bool)> = Vec::new();

    for entry in response.entries() {
        let item = entry
            .as_full()
            .ok_or_else(|| Error::InvalidTransaction(format!("Response item {} is abbreviated", entry.number())))?;
        let accept = match item.kind {
            TransactionType::AcceptItem => true,
            TransactionType::RejectItem => false,
            other => return Err(Error::InvalidTransaction(format!("{} is not a response item", other))),
        };
        if !inbox.contains(item.reference) {
            return Err(Error::InvalidTransaction(format!("Inbox has no entry {}", item.reference)));
        }
        if settled.iter().any(|(original, _)| original.number == item.reference) {
            return Err(Error::InvalidTransaction(format!("Inbox entry {} answered twice", item.reference)));
        }

        let original = notary.box_receipt(&inbox_key, item.reference)?;
        match original.kind {
            TransactionType::Pending => {
                let sender_id = original
                    .sender
                    .as_ref()
                    .and_then(|party| party.account_id)
                    .ok_or_else(|| Error::InvalidTransaction(format!("Pending {} has no sender", original.number)))?;
                if !senders.contains_key(&sender_id) {
                    let sender = notary
                        .storage()
                        .get_account(&sender_id)?
                        .ok_or_else(|| Error::NotFound(format!("Account {}", sender_id)))?;
                    senders.insert(sender_id, sender);
                }
                if accept {
                    credit = credit.checked_add(original.amount).ok_or_else(|| {
                        Error::InvalidTransaction(format!("Credits to {} overflow", account_id))
                    })?;
                } else if let Some(sender) = senders.get_mut(&sender_id) {
                    // Refund
                    sender.balance = sender.credited(original.amount)?;
                }
            }
            TransactionType::TransferReceipt | TransactionType::ChequeReceipt if accept => {
                if context.pool().is_issued(original.reference) {
                    closes.insert(original.reference);
                }
            }
            TransactionType::FinalReceipt if accept => {
                for number in [Some(original.reference), original.closing_number].into_iter().flatten() {
                    if context.pool().is_issued(number) {
                        closes.insert(number);
                    }
                }
            }
            TransactionType::PaymentReceipt if accept => {}
            other => {
                return Err(Error::InvalidTransaction(format!("A {} cannot be rejected", other)));
            }
        }
        settled.push((original, accept));
    }
    let balance = account.credited(credit)?;

    let mut issued = context.pool().issued().clone();
    for number in &closes {
        issued.remove(number);
    }
    issued.remove(&opening);
    let expected = BalanceStatement {
        notary_id: *notary.notary_id(),
        nym_id: *context.nym_id(),
        account_id: Some(account_id),
        opening_number: Some(opening),
        issued,
        balance: Some(balance),
    };
    if let Some(rejection) = check_statement(response.statement(), &expected) {
        return Ok(rejection);
    }

    account.balance = balance;
    notary.storage().put_account(&account)?;
    for sender in senders.values() {
        notary.storage().put_account(sender)?;
    }
    for (original, accept) in settled {
        notary.remove_receipt(&inbox_key, original.number)?;
        if original.kind == TransactionType::Pending {
            settle_transfer(notary, original, accept, &senders)?;
        }
    }

    notary.close_number(context, opening)?;
    for number in &closes {
        notary.close_number(context, *number)?;
    }

    tracing::info!(
        account_id = %account_id,
        closed = closes.len(),
        credit,
        opening_number = opening,
        "Inbox processed"
    );
    Ok(Outcome::Done(Some(account)))
}

/// Clear the sender's outbox and tell the sender how the transfer ended
fn settle_transfer(
    notary: &Notary,
    pending: Transaction,
    accepted: bool,
    senders: &BTreeMap<AccountId, Account>,
) -> Result<()> {
    let sender_account = pending
        .sender
        .as_ref()
        .and_then(|party| party.account_id)
        .and_then(|sender_id| senders.get(&sender_id))
        .ok_or_else(|| Error::InvalidTransaction(format!("Pending {} has no sender", pending.number)))?;
    notary.remove_receipt(&notary.account_box_key(sender_account, BoxType::Outbox), pending.reference)?;

    let number = notary.storage().allocate_unowned_number()?;
    let mut receipt = Transaction::new(
        *notary.notary_id(),
        sender_account.nym_id,
        TransactionType::TransferReceipt,
        number,
    );
    receipt.account_id = Some(sender_account.account_id);
    receipt.reference = pending.reference;
    receipt.amount = pending.amount;
    receipt.success = accepted;
    receipt.sender = pending.sender.clone();
    receipt.recipient = pending.recipient.clone();
    receipt.attachment = Armored::encode(&pending)?;
    notary.add_receipt(&notary.account_box_key(sender_account, BoxType::Inbox), receipt)
}
