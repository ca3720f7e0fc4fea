//! Transaction-number harvesting
//!
//! A sent message may commit transaction numbers: the opening number of a
//! notarized transaction or an inbox response, and for a cron activation
//! the activator's closing number too. Once the fate of the message is
//! known, the numbers it committed are returned to the pool, closed, or
//! left alone:
//!
//! | what is known                          | opening              | closing              |
//! |----------------------------------------|----------------------|----------------------|
//! | reply failed                           | available again      | available again      |
//! | no reply (flushed after a nymbox)      | per `for_retry`      | per `for_retry`      |
//! | reply succeeded, transaction failed    | closed (burned)      | per `for_retry`      |
//! | reply and transaction succeeded        | untouched            | untouched            |
//!
//! Numbers this nym does not hold as issued are never touched, so a cron
//! party can only ever harvest its own numbers.

use crate::context::ServerContext;
use notary_core::{
    CronItem, Ledger, Message, MessageType, Result, Transaction, TransactionNumber,
    TransactionType,
};

/// What is known about the exchange a message belonged to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HarvestFlags {
    /// Make harvested numbers available again
    pub for_retry: bool,
    /// The notary processed the message
    pub reply_was_success: bool,
    /// The notary refused the message
    pub reply_was_failure: bool,
    /// The transaction inside the message succeeded
    pub transaction_was_success: bool,
    /// The transaction inside the message failed
    pub transaction_was_failure: bool,
}

impl HarvestFlags {
    /// No reply was ever seen
    pub fn no_reply(for_retry: bool) -> Self {
        Self {
            for_retry,
            ..Self::default()
        }
    }

    /// The notary replied with failure
    pub fn reply_failed() -> Self {
        Self {
            for_retry: true,
            reply_was_failure: true,
            ..Self::default()
        }
    }

    /// The message went through but its transaction was refused
    pub fn transaction_failed() -> Self {
        Self {
            for_retry: true,
            reply_was_success: true,
            transaction_was_failure: true,
            ..Self::default()
        }
    }

    /// Both the message and its transaction succeeded
    pub fn transaction_succeeded() -> Self {
        Self {
            reply_was_success: true,
            transaction_was_success: true,
            ..Self::default()
        }
    }
}

/// Transaction numbers a message commits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommittedNumbers {
    /// Opening number of the transaction
    pub opening: Option<TransactionNumber>,
    /// Closing numbers of the sender
    pub closing: Vec<TransactionNumber>,
}

impl CommittedNumbers {
    /// Whether nothing is committed
    pub fn is_empty(&self) -> bool {
        self.opening.is_none() && self.closing.is_empty()
    }
}

/// Numbers committed by a request
pub fn committed_numbers(message: &Message) -> Result<CommittedNumbers> {
    match message.command {
        MessageType::NotarizeTransaction => {
            let transaction: Transaction = message.payload.decode()?;
            let mut numbers = CommittedNumbers {
                opening: Some(transaction.number),
                closing: Vec::new(),
            };
            if transaction.kind == TransactionType::ActivateCronItem {
                let item: CronItem = transaction.attachment.decode()?;
                if let Some(party) = item.party(&message.nym_id) {
                    numbers.closing.push(party.closing_number);
                }
            }
            Ok(numbers)
        }
        MessageType::ProcessInbox => {
            let response: Ledger = message.payload.decode()?;
            Ok(CommittedNumbers {
                opening: response.statement().and_then(|statement| statement.opening_number),
                closing: Vec::new(),
            })
        }
        _ => Ok(CommittedNumbers::default()),
    }
}

/// Outcome of a harvest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Harvested {
    /// Numbers made available again
    pub restored: usize,
    /// Numbers closed because the notary burned them
    pub closed: usize,
}

/// Settle the numbers of `message` according to what is known about it
pub fn harvest_transaction_numbers(
    context: &mut ServerContext,
    message: &Message,
    flags: HarvestFlags,
) -> Result<Harvested> {
    let numbers = committed_numbers(message)?;
    if numbers.is_empty() {
        return Ok(Harvested::default());
    }

    let mut harvested = Harvested::default();
    if flags.reply_was_success {
        if !flags.transaction_was_failure {
            tracing::debug!(request_number = message.request_number, "Transaction succeeded, nothing to harvest");
            return Ok(harvested);
        }
        if let Some(opening) = numbers.opening {
            if context.pool_mut().close(opening) {
                harvested.closed += 1;
            }
        }
        harvested.restored = context
            .pool_mut()
            .harvest(numbers.closing.iter().copied(), flags.for_retry);
    } else {
        // The notary never consumed anything
        let for_retry = flags.for_retry || flags.reply_was_failure;
        harvested.restored = context
            .pool_mut()
            .harvest(numbers.opening.into_iter().chain(numbers.closing.iter().copied()), for_retry);
    }

    tracing::info!(
        nym_id = %context.nym_id(),
        request_number = message.request_number,
        command = %message.command,
        opening_number = ?numbers.opening,
        restored = harvested.restored,
        closed = harvested.closed,
        "Harvested transaction numbers"
    );
    Ok(harvested)
}

/// Give back the numbers of a cron item this nym signed that never ran
pub fn harvest_unsent_cron_item(context: &mut ServerContext, opening_number: TransactionNumber) -> usize {
    let item = match context.remove_unsent_cron_item(opening_number) {
        Some(item) => item,
        None => return 0,
    };
    let numbers = match item.party(context.nym_id()) {
        Some(party) => party.numbers(),
        None => return 0,
    };

    let restored = context.pool_mut().harvest(numbers, true);
    tracing::info!(nym_id = %context.nym_id(), opening_number, restored, "Harvested unsent cron item");
    restored
}

#[cfg(test)]
mod tests {
    use super::*;
    use notary_core::{AccountId, Armored, CronItemKind, CronParty, NotaryId, NymId};

    fn context_with(numbers: &[TransactionNumber]) -> ServerContext {
        let mut context = ServerContext::new(NotaryId::digest(b"notary"), NymId::digest(b"alice"));
        context.pool_mut().issue(numbers.iter().copied());
        context
    }

    fn notarize(context: &ServerContext, transaction: &Transaction) -> Message {
        let mut message = Message::request(
            MessageType::NotarizeTransaction,
            *context.notary_id(),
            *context.nym_id(),
            4,
        );
        message.transaction_number = transaction.number;
        message.payload = Armored::encode(transaction).unwrap();
        message
    }

    fn transfer(context: &mut ServerContext) -> Message {
        let opening = *context.pool_mut().reserve(1).unwrap().iter().next().unwrap();
        let transaction = Transaction::new(*context.notary_id(), *context.nym_id(), TransactionType::Transfer, opening);
        notarize(context, &transaction)
    }

    fn activation(context: &mut ServerContext, other: NymId) -> Message {
        let reserved: Vec<_> = context.pool_mut().reserve(2).unwrap().into_iter().collect();
        let mut item = CronItem::new(CronItemKind::PaymentPlan, *context.notary_id(), *context.nym_id(), "terms");
        item.add_party(CronParty::new(*context.nym_id(), AccountId::digest(b"a"), reserved[0], reserved[1]))
            .unwrap();
        item.add_party(CronParty::new(other, AccountId::digest(b"b"), 90, 91)).unwrap();

        let mut transaction = Transaction::new(
            *context.notary_id(),
            *context.nym_id(),
            TransactionType::ActivateCronItem,
            reserved[0],
        );
        transaction.attachment = Armored::encode(&item).unwrap();
        notarize(context, &transaction)
    }

    #[test]
    fn test_reply_failure_restores_opening() {
        let mut context = context_with(&[5, 6, 7]);
        let message = transfer(&mut context);
        assert!(!context.pool().is_available(5));

        let harvested = harvest_transaction_numbers(&mut context, &message, HarvestFlags::reply_failed()).unwrap();
        assert_eq!(harvested.restored, 1);
        assert!(context.pool().is_available(5));
        assert!(context.pool().is_issued(5));
        assert!(context.pool().check_invariant());
    }

    #[test]
    fn test_transaction_failure_burns_opening() {
        let mut context = context_with(&[5, 6, 7]);
        let message = transfer(&mut context);

        let harvested = harvest_transaction_numbers(&mut context, &message, HarvestFlags::transaction_failed()).unwrap();
        assert_eq!(harvested, Harvested { restored: 0, closed: 1 });
        assert!(!context.pool().is_issued(5));
        assert_eq!(context.pool().issued_count(), 2);
    }

    #[test]
    fn test_transaction_success_keeps_numbers_issued() {
        let mut context = context_with(&[5, 6, 7]);
        let message = transfer(&mut context);

        let harvested =
            harvest_transaction_numbers(&mut context, &message, HarvestFlags::transaction_succeeded()).unwrap();
        assert_eq!(harvested, Harvested::default());
        assert!(context.pool().is_issued(5));
        assert!(!context.pool().is_available(5));
    }

    #[test]
    fn test_no_reply_without_retry_leaves_numbers_reserved() {
        let mut context = context_with(&[5, 6]);
        let message = transfer(&mut context);

        let harvested = harvest_transaction_numbers(&mut context, &message, HarvestFlags::no_reply(false)).unwrap();
        assert_eq!(harvested.restored, 0);
        assert!(context.pool().is_issued(5));
        assert!(!context.pool().is_available(5));

        harvest_transaction_numbers(&mut context, &message, HarvestFlags::no_reply(true)).unwrap();
        assert!(context.pool().is_available(5));
    }

    #[test]
    fn test_failed_activation_harvests_only_own_closing_number() {
        let mut context = context_with(&[5, 6, 7]);
        let message = activation(&mut context, NymId::digest(b"bob"));
        assert_eq!(
            committed_numbers(&message).unwrap(),
            CommittedNumbers {
                opening: Some(5),
                closing: vec![6],
            }
        );

        let harvested = harvest_transaction_numbers(&mut context, &message, HarvestFlags::transaction_failed()).unwrap();
        assert_eq!(harvested, Harvested { restored: 1, closed: 1 });
        assert!(!context.pool().is_issued(5));
        assert!(context.pool().is_available(6));
        // Bob's numbers are nothing to do with us
        assert!(!context.pool().is_issued(90));
    }

    #[test]
    fn test_unsent_cron_item() {
        let mut context = context_with(&[20, 21, 22]);
        let reserved: Vec<_> = context.pool_mut().reserve(2).unwrap().into_iter().collect();
        let mut item = CronItem::new(
            CronItemKind::SmartContract,
            *context.notary_id(),
            NymId::digest(b"activator"),
            "terms",
        );
        let own = CronParty::new(*context.nym_id(), AccountId::digest(b"a"), reserved[0], reserved[1]);
        item.add_party(own).unwrap();
        context.add_unsent_cron_item(reserved[0], item);

        assert_eq!(harvest_unsent_cron_item(&mut context, reserved[0]), 2);
        assert_eq!(context.pool().count(), 3);
        assert!(context.unsent_cron_item(reserved[0]).is_none());
        assert_eq!(harvest_unsent_cron_item(&mut context, reserved[0]), 0);
    }

    #[test]
    fn test_messages_without_numbers() {
        let mut context = context_with(&[5]);
        let message = Message::request(MessageType::GetNymbox, *context.notary_id(), *context.nym_id(), 2);
        let harvested = harvest_transaction_numbers(&mut context, &message, HarvestFlags::reply_failed()).unwrap();
        assert_eq!(harvested, Harvested::default());
    }
}
