//! Client against an in-process notary
//!
//! The transport is a direct call to `Notary::process`; tests that lose a
//! request or a reply simply skip that call or ignore its result.

use notary_client::{Client, ClientConfig, UserCommand};
use notary_core::{
    AccountId, BoxType, CronItem, CronItemKind, Error, KeyPair, LedgerKey, Message, NotaryId, NymId,
    Party, StorageConfig, TransactionNumber, TransactionResponse, UnitDefinition,
};
use notary_server::{Notary, NotaryConfig};
use std::collections::BTreeSet;
use tempfile::TempDir;

struct Harness {
    notary: Notary,
    client: Client,
    notary_id: NotaryId,
    _dirs: (TempDir, TempDir),
}

fn harness() -> Harness {
    let notary_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();

    let notary = Notary::open(NotaryConfig {
        storage: StorageConfig {
            data_dir: notary_dir.path().to_path_buf(),
            ..StorageConfig::default()
        },
        numbers_per_request: 5,
        ..NotaryConfig::default()
    })
    .unwrap();
    let client = Client::open(ClientConfig {
        storage: StorageConfig {
            data_dir: client_dir.path().to_path_buf(),
            ..StorageConfig::default()
        },
        numbers_per_request: 5,
        low_water_mark: 2,
        ..ClientConfig::default()
    })
    .unwrap();
    let notary_id = client.add_notary(notary.public_key());
    assert_eq!(notary_id, *notary.notary_id());

    Harness {
        notary,
        client,
        notary_id,
        _dirs: (notary_dir, client_dir),
    }
}

impl Harness {
    fn request(&self, nym: &NymId, command: UserCommand) -> Message {
        self.client.process_user_command(&self.notary_id, nym, command).unwrap()
    }

    fn deliver(&self, request: &Message) -> Message {
        let reply = self.notary.process(request).unwrap();
        assert!(self.client.process_server_reply(&reply, None).unwrap());
        reply
    }

    fn exchange(&self, nym: &NymId, command: UserCommand) -> Message {
        let request = self.request(nym, command);
        self.deliver(&request)
    }

    fn register(&self, keys: KeyPair) -> NymId {
        let nym = self.client.add_nym(keys);
        assert!(self.exchange(&nym, UserCommand::RegisterNym).success);
        assert!(self.exchange(&nym, UserCommand::GetTransactionNumbers).success);
        nym
    }

    fn issue_unit(&self, nym: &NymId) -> AccountId {
        let unit = UnitDefinition {
            name: "Test gold".to_string(),
            symbol: "TGLD".to_string(),
            issuer: *nym,
        };
        let reply = self.exchange(nym, UserCommand::RegisterInstrumentDefinition { unit });
        assert!(reply.success);
        reply.account_id.unwrap()
    }

    fn open_account(&self, nym: &NymId, issuer_account: &AccountId) -> AccountId {
        let unit = self.client.account(issuer_account).unwrap().instrument_definition_id;
        let reply = self.exchange(
            nym,
            UserCommand::RegisterAccount {
                instrument_definition_id: unit,
            },
        );
        assert!(reply.success);
        reply.account_id.unwrap()
    }

    fn transfer(&self, nym: &NymId, from: &AccountId, to_nym: &NymId, to: &AccountId, amount: i64) -> Message {
        self.request(
            nym,
            UserCommand::Transfer {
                account_id: *from,
                recipient: Party {
                    nym_id: *to_nym,
                    account_id: Some(*to),
                },
                amount,
            },
        )
    }

    fn sync_nymbox(&self, nym: &NymId) {
        assert!(self.exchange(nym, UserCommand::GetNymbox).success);
        for number in self
            .client
            .missing_box_receipts(&self.notary_id, nym, None, BoxType::Nymbox)
            .unwrap()
        {
            let command = UserCommand::GetBoxReceipt {
                account_id: None,
                box_type: BoxType::Nymbox,
                number,
            };
            assert!(self.exchange(nym, command).success);
        }
    }

    fn sync_account(&self, nym: &NymId, account_id: &AccountId) {
        let reply = self.exchange(nym, UserCommand::GetAccountData { account_id: *account_id });
        assert!(reply.success);
        for number in self
            .client
            .missing_box_receipts(&self.notary_id, nym, Some(*account_id), BoxType::Inbox)
            .unwrap()
        {
            let command = UserCommand::GetBoxReceipt {
                account_id: Some(*account_id),
                box_type: BoxType::Inbox,
                number,
            };
            assert!(self.exchange(nym, command).success);
        }
    }

    fn accept_inbox(&self, nym: &NymId, account_id: &AccountId) -> Message {
        let request = self
            .client
            .accept_inbox(&self.notary_id, nym, account_id)
            .unwrap()
            .expect("inbox has receipts");
        let reply = self.deliver(&request);
        assert!(reply.success);
        reply
    }

    fn issued(&self, nym: &NymId) -> BTreeSet<TransactionNumber> {
        self.client.context(&self.notary_id, nym).unwrap().pool().issued().clone()
    }

    fn notary_issued(&self, nym: &NymId) -> BTreeSet<TransactionNumber> {
        let editor = self.notary.contexts().edit(nym).unwrap().unwrap();
        editor.pool().issued().clone()
    }

    fn available(&self, nym: &NymId, number: TransactionNumber) -> bool {
        self.client
            .context(&self.notary_id, nym)
            .unwrap()
            .pool()
            .is_available(number)
    }
}

fn outcome(reply: &Message) -> TransactionResponse {
    reply.payload.decode().unwrap()
}

#[test]
fn test_numbers_are_issued_and_reserved() {
    let h = harness();
    let alice = h.register(KeyPair::generate());

    assert_eq!(h.issued(&alice).len(), 5);
    assert_eq!(h.issued(&alice), h.notary_issued(&alice));
    assert!(!h.client.needs_numbers(&h.notary_id, &alice).unwrap());

    let gold = h.issue_unit(&alice);
    let bob = h.register(KeyPair::generate());
    let bob_gold = h.open_account(&bob, &gold);

    let request = h.transfer(&alice, &gold, &bob, &bob_gold, 10);
    let opening = request.transaction_number;
    assert_eq!(opening, *h.issued(&alice).iter().next().unwrap());
    assert!(!h.available(&alice, opening));
    assert!(h.issued(&alice).contains(&opening));
}

#[test]
fn test_transfer_round_trip() {
    let h = harness();
    let alice = h.register(KeyPair::generate());
    let bob = h.register(KeyPair::generate());
    let gold = h.issue_unit(&alice);
    let bob_gold = h.open_account(&bob, &gold);

    let request = h.transfer(&alice, &gold, &bob, &bob_gold, 40);
    let opening = request.transaction_number;
    let reply = h.deliver(&request);
    assert!(outcome(&reply).success);
    assert_eq!(h.client.account(&gold).unwrap().balance, -40);

    // Bob accepts the pending transfer
    h.sync_account(&bob, &bob_gold);
    h.accept_inbox(&bob, &bob_gold);
    assert_eq!(h.client.account(&bob_gold).unwrap().balance, 40);
    assert_eq!(h.issued(&bob), h.notary_issued(&bob));

    // The transfer receipt closes Alice's opening number
    assert!(h.issued(&alice).contains(&opening));
    h.sync_account(&alice, &gold);
    h.accept_inbox(&alice, &gold);
    assert!(!h.issued(&alice).contains(&opening));
    assert_eq!(h.issued(&alice), h.notary_issued(&alice));

    let record = h
        .client
        .local_box(&LedgerKey::account_box(h.notary_id, alice, gold, BoxType::RecordBox))
        .unwrap();
    assert_eq!(record.len(), 1);
    assert!(h.client.sent_messages().is_empty());
}

#[test]
fn test_rejected_transfer_refunds_sender() {
    let h = harness();
    let alice = h.register(KeyPair::generate());
    let bob = h.register(KeyPair::generate());
    let gold = h.issue_unit(&alice);
    let bob_gold = h.open_account(&bob, &gold);

    let reply = h.deliver(&h.transfer(&alice, &gold, &bob, &bob_gold, 15));
    assert!(outcome(&reply).success);

    h.sync_account(&bob, &bob_gold);
    let pending = h
        .client
        .local_box(&LedgerKey::account_box(h.notary_id, bob, bob_gold, BoxType::Inbox))
        .unwrap()
        .entries()
        .map(|entry| entry.number())
        .collect::<BTreeSet<_>>();
    let request = h.request(
        &bob,
        UserCommand::ProcessInbox {
            account_id: bob_gold,
            reject: pending,
        },
    );
    assert!(outcome(&h.deliver(&request)).success);
    assert_eq!(h.client.account(&bob_gold).unwrap().balance, 0);

    h.sync_account(&alice, &gold);
    assert_eq!(h.client.account(&gold).unwrap().balance, 0);
}

#[test]
fn test_reply_failure_restores_opening() {
    let h = harness();
    let seed = [7u8; 32];
    let alice = h.register(KeyPair::from_seed(&seed));
    let bob = h.register(KeyPair::generate());
    let gold = h.issue_unit(&alice);
    let bob_gold = h.open_account(&bob, &gold);

    let request = h.transfer(&alice, &gold, &bob, &bob_gold, 5);
    let opening = request.transaction_number;

    // The notary sees a request whose transaction does not match the message
    let mut tampered = request.clone();
    tampered.transaction_number = opening + 1000;
    tampered.sign(&KeyPair::from_seed(&seed)).unwrap();
    let reply = h.deliver(&tampered);
    assert!(!reply.success);

    assert!(h.available(&alice, opening));
    assert!(h.client.sent_messages().is_empty());

    // The number is still good at the notary
    let retry = h.transfer(&alice, &gold, &bob, &bob_gold, 5);
    assert_eq!(retry.transaction_number, opening);
    assert!(outcome(&h.deliver(&retry)).success);
}

#[test]
fn test_transaction_failure_burns_opening() {
    let h = harness();
    let alice = h.register(KeyPair::generate());
    let gold = h.issue_unit(&alice);

    let nowhere = AccountId::digest(b"no such account");
    let request = h.transfer(&alice, &gold, &NymId::digest(b"nobody"), &nowhere, 5);
    let opening = request.transaction_number;
    let reply = h.deliver(&request);

    assert!(reply.success);
    assert!(!outcome(&reply).success);
    assert!(!h.issued(&alice).contains(&opening));
    assert_eq!(h.issued(&alice), h.notary_issued(&alice));
    assert_eq!(h.client.account(&gold).unwrap().balance, 0);
}

#[test]
fn test_lost_request_is_flushed_after_nymbox() {
    let h = harness();
    let alice = h.register(KeyPair::generate());
    let bob = h.register(KeyPair::generate());
    let gold = h.issue_unit(&alice);
    let bob_gold = h.open_account(&bob, &gold);

    // Never reaches the notary
    let lost = h.transfer(&alice, &gold, &bob, &bob_gold, 5);
    let opening = lost.transaction_number;
    assert!(matches!(
        h.client.flush_sent_messages(&h.notary_id, &alice, true),
        Err(Error::StaleNymbox(_))
    ));

    assert!(h.exchange(&alice, UserCommand::GetNymbox).success);
    assert_eq!(h.client.flush_sent_messages(&h.notary_id, &alice, true).unwrap(), 1);
    assert!(h.client.sent_messages().is_empty());
    assert!(h.available(&alice, opening));

    // Permission is spent
    assert!(h.client.flush_sent_messages(&h.notary_id, &alice, true).is_err());

    let retry = h.transfer(&alice, &gold, &bob, &bob_gold, 5);
    assert_eq!(retry.transaction_number, opening);
    assert!(outcome(&h.deliver(&retry)).success);
}

#[test]
fn test_lost_reply_is_recovered_from_reply_notice() {
    let h = harness();
    let alice = h.register(KeyPair::generate());
    let bob = h.register(KeyPair::generate());
    let gold = h.issue_unit(&alice);
    let bob_gold = h.open_account(&bob, &gold);

    let request = h.transfer(&alice, &gold, &bob, &bob_gold, 25);
    let request_number = request.request_number;
    let _lost = h.notary.process(&request).unwrap();

    assert!(h.exchange(&alice, UserCommand::GetNymbox).success);
    let context = h.client.context(&h.notary_id, &alice).unwrap();
    assert!(!context.nymbox_is_stale());

    // The notice keeps the request out of the flush
    assert_eq!(h.client.flush_sent_messages(&h.notary_id, &alice, false).unwrap(), 0);
    assert!(h.client.sent_messages().contains(request_number, &h.notary_id, &alice));

    let missing = h
        .client
        .missing_box_receipts(&h.notary_id, &alice, None, BoxType::Nymbox)
        .unwrap();
    assert_eq!(missing.len(), 1);
    h.exchange(
        &alice,
        UserCommand::GetBoxReceipt {
            account_id: None,
            box_type: BoxType::Nymbox,
            number: missing[0],
        },
    );

    assert!(!h.client.sent_messages().contains(request_number, &h.notary_id, &alice));
    assert_eq!(h.client.account(&gold).unwrap().balance, -25);
    assert!(h
        .client
        .context(&h.notary_id, &alice)
        .unwrap()
        .has_seen_reply(request_number));

    // The next request acknowledges the reply and the notice goes away
    h.sync_nymbox(&alice);
    assert!(h
        .client
        .local_box(&LedgerKey::nymbox(h.notary_id, alice))
        .unwrap()
        .find_reply_notice(request_number)
        .is_none());
}

#[test]
fn test_lost_nymbox_reply_still_settles_notices() {
    let h = harness();
    let alice = h.register(KeyPair::generate());
    let bob = h.register(KeyPair::generate());
    let gold = h.issue_unit(&alice);
    let bob_gold = h.open_account(&bob, &gold);

    let item = CronItem::new(CronItemKind::SmartContract, h.notary_id, alice, "terms");
    let item = h.client.sign_cron_item(&bob, item, &bob_gold).unwrap();
    let item = h.client.sign_cron_item(&alice, item, &gold).unwrap();
    let [alice_opening, _] = item.party(&alice).unwrap().numbers();
    let [bob_opening, bob_closing] = item.party(&bob).unwrap().numbers();

    assert!(h.exchange(&bob, UserCommand::UnregisterAccount { account_id: bob_gold }).success);
    let reply = h.exchange(
        &alice,
        UserCommand::ActivateCronItem {
            opening_number: alice_opening,
        },
    );
    assert!(!outcome(&reply).success);

    // The notary removes the failure notice but Bob never hears back
    h.sync_nymbox(&bob);
    let request = h.client.accept_entire_nymbox(&h.notary_id, &bob).unwrap().unwrap();
    let request_number = request.request_number;
    assert!(h.notary.process(&request).unwrap().success);
    assert!(!h.available(&bob, bob_opening));

    // The fresh nymbox holds the reply notice instead of the failure notice
    assert!(h.exchange(&bob, UserCommand::GetNymbox).success);
    assert_eq!(h.client.flush_sent_messages(&h.notary_id, &bob, false).unwrap(), 0);
    assert!(h.client.sent_messages().contains(request_number, &h.notary_id, &bob));

    for number in h
        .client
        .missing_box_receipts(&h.notary_id, &bob, None, BoxType::Nymbox)
        .unwrap()
    {
        let command = UserCommand::GetBoxReceipt {
            account_id: None,
            box_type: BoxType::Nymbox,
            number,
        };
        assert!(h.exchange(&bob, command).success);
    }

    assert!(!h.client.sent_messages().contains(request_number, &h.notary_id, &bob));
    assert!(h.available(&bob, bob_opening));
    assert!(h.available(&bob, bob_closing));
    assert!(h
        .client
        .context(&h.notary_id, &bob)
        .unwrap()
        .unsent_cron_item(bob_opening)
        .is_none());
    assert_eq!(h.issued(&bob), h.notary_issued(&bob));
}

#[test]
fn test_cron_item_lifecycle_closes_numbers() {
    let h = harness();
    let alice = h.register(KeyPair::generate());
    let bob = h.register(KeyPair::generate());
    let gold = h.issue_unit(&alice);
    let bob_gold = h.open_account(&bob, &gold);

    // Bob signs first, Alice activates
    let item = CronItem::new(CronItemKind::PaymentPlan, h.notary_id, alice, "10 per month");
    let item = h.client.sign_cron_item(&bob, item, &bob_gold).unwrap();
    let item = h.client.sign_cron_item(&alice, item, &gold).unwrap();
    let [alice_opening, alice_closing] = item.party(&alice).unwrap().numbers();
    let [bob_opening, bob_closing] = item.party(&bob).unwrap().numbers();
    assert_eq!(item.id(), Some(alice_opening));

    let reply = h.exchange(
        &alice,
        UserCommand::ActivateCronItem {
            opening_number: alice_opening,
        },
    );
    assert!(outcome(&reply).success);
    assert!(h
        .client
        .context(&h.notary_id, &alice)
        .unwrap()
        .unsent_cron_item(alice_opening)
        .is_none());

    // Bob learns of the activation through his nymbox
    h.sync_nymbox(&bob);
    let request = h.client.accept_entire_nymbox(&h.notary_id, &bob).unwrap().unwrap();
    assert!(h.deliver(&request).success);
    assert!(h
        .client
        .context(&h.notary_id, &bob)
        .unwrap()
        .unsent_cron_item(bob_opening)
        .is_none());
    assert!(h.client.accept_entire_nymbox(&h.notary_id, &bob).unwrap().is_none());

    let reply = h.exchange(
        &alice,
        UserCommand::CancelCronItem {
            item_id: alice_opening,
            account_id: Some(gold),
        },
    );
    assert!(outcome(&reply).success);
    assert_eq!(h.issued(&alice), h.notary_issued(&alice));

    // Final receipts close both parties' numbers
    for (nym, account, opening, closing) in [
        (alice, gold, alice_opening, alice_closing),
        (bob, bob_gold, bob_opening, bob_closing),
    ] {
        assert!(h.issued(&nym).contains(&closing));
        h.sync_account(&nym, &account);
        h.accept_inbox(&nym, &account);

        let issued = h.issued(&nym);
        assert!(!issued.contains(&opening));
        assert!(!issued.contains(&closing));
        assert_eq!(issued, h.notary_issued(&nym));
    }
}

#[test]
fn test_failed_activation_returns_party_numbers() {
    let h = harness();
    let alice = h.register(KeyPair::generate());
    let bob = h.register(KeyPair::generate());
    let gold = h.issue_unit(&alice);
    let bob_gold = h.open_account(&bob, &gold);

    let item = CronItem::new(CronItemKind::SmartContract, h.notary_id, alice, "terms");
    let item = h.client.sign_cron_item(&bob, item, &bob_gold).unwrap();
    let item = h.client.sign_cron_item(&alice, item, &gold).unwrap();
    let [alice_opening, alice_closing] = item.party(&alice).unwrap().numbers();
    let [bob_opening, bob_closing] = item.party(&bob).unwrap().numbers();

    // Bob walks away from the account he committed
    assert!(h.exchange(&bob, UserCommand::UnregisterAccount { account_id: bob_gold }).success);

    let reply = h.exchange(
        &alice,
        UserCommand::ActivateCronItem {
            opening_number: alice_opening,
        },
    );
    assert!(reply.success);
    assert!(!outcome(&reply).success);

    // Alice's opening is burned, her closing number comes back
    assert!(!h.issued(&alice).contains(&alice_opening));
    assert!(h.available(&alice, alice_closing));
    assert_eq!(h.issued(&alice), h.notary_issued(&alice));

    // Bob harvests both numbers from the failure notice
    assert!(!h.available(&bob, bob_opening));
    h.sync_nymbox(&bob);
    let request = h.client.accept_entire_nymbox(&h.notary_id, &bob).unwrap().unwrap();
    assert!(h.deliver(&request).success);

    assert!(h.available(&bob, bob_opening));
    assert!(h.available(&bob, bob_closing));
    assert!(h
        .client
        .context(&h.notary_id, &bob)
        .unwrap()
        .unsent_cron_item(bob_opening)
        .is_none());
    assert_eq!(h.issued(&bob), h.notary_issued(&bob));
}

#[test]
fn test_payment_instruments_move_to_record_box() {
    let h = harness();
    let alice = h.register(KeyPair::generate());
    let bob = h.register(KeyPair::generate());
    let gold = h.issue_unit(&alice);
    let bob_gold = h.open_account(&bob, &gold);

    let item = CronItem::new(CronItemKind::PaymentPlan, h.notary_id, alice, "5 per week");
    let item = h.client.sign_cron_item(&bob, item, &bob_gold).unwrap();
    let reply = h.exchange(&bob, UserCommand::SendNymInstrument { recipient: alice, item });
    assert!(reply.success);
    let reply = h.exchange(
        &bob,
        UserCommand::SendNymMessage {
            recipient: alice,
            text: "please sign".to_string(),
        },
    );
    assert!(reply.success);

    h.sync_nymbox(&alice);
    let request = h.client.accept_entire_nymbox(&h.notary_id, &alice).unwrap().unwrap();
    assert!(h.deliver(&request).success);

    let payments = h
        .client
        .local_box(&LedgerKey::nym_box(h.notary_id, alice, BoxType::PaymentInbox))
        .unwrap();
    assert_eq!(payments.len(), 1);
    let number = payments.entries().next().unwrap().number();

    let moved = h.client.record_payment(&h.notary_id, &alice, number, true).unwrap();
    assert_eq!(moved, BoxType::RecordBox);
    let record = h
        .client
        .local_box(&LedgerKey::nym_box(h.notary_id, alice, BoxType::RecordBox))
        .unwrap();
    assert!(record.contains(number));
    assert!(h
        .client
        .local_box(&LedgerKey::nym_box(h.notary_id, alice, BoxType::PaymentInbox))
        .unwrap()
        .is_empty());
}

#[test]
fn test_unregister_account_and_nym() {
    let h = harness();
    let alice = h.register(KeyPair::generate());
    let bob = h.register(KeyPair::generate());
    let gold = h.issue_unit(&alice);
    let bob_gold = h.open_account(&bob, &gold);

    assert!(h.exchange(&bob, UserCommand::UnregisterAccount { account_id: bob_gold }).success);
    assert!(matches!(h.client.account(&bob_gold), Err(Error::NotFound(_))));

    assert!(h.exchange(&bob, UserCommand::CheckNym { nym_id: alice }).success);
    assert!(h.client.storage().get_nym(&alice).unwrap().is_some());

    assert!(h.exchange(&bob, UserCommand::UnregisterNym).success);
    let context = h.client.context(&h.notary_id, &bob).unwrap();
    assert_eq!(context.pool().issued_count(), 0);
    assert_eq!(context.request_number(), 1);
}
