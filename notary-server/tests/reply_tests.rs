//! Notary request pipeline tests
//!
//! Requests are built and signed by hand so each test controls exactly what
//! the notary sees.

use notary_core::{
    Account, Armored, BalanceStatement, CronItem, CronItemKind, CronParty, KeyPair, LedgerKey,
    Message, MessageType, NymId, Signer, StorageConfig, Transaction, TransactionNumber,
    TransactionResponse, TransactionType, UnitDefinition, InstrumentDefinitionId, Party,
};
use notary_server::{Notary, NotaryConfig};
use tempfile::TempDir;

struct TestNym {
    keys: KeyPair,
    request_number: i64,
}

impl TestNym {
    fn new() -> Self {
        Self {
            keys: KeyPair::generate(),
            request_number: 1,
        }
    }

    fn id(&self) -> NymId {
        self.keys.nym_id()
    }

    fn request(&mut self, notary: &Notary, command: MessageType) -> Message {
        let request_number = if command.is_unbuffered() {
            0
        } else {
            let current = self.request_number;
            self.request_number += 1;
            current
        };
        Message::request(command, *notary.notary_id(), self.id(), request_number)
    }

    fn send(&self, notary: &Notary, mut request: Message) -> Message {
        request.sign(&self.keys).unwrap();
        let reply = notary.process(&request).unwrap();
        reply.verify_with(&notary.public_key()).unwrap();
        reply
    }

    fn register(&mut self, notary: &Notary) {
        let mut request = self.request(notary, MessageType::RegisterNym);
        request.public_key = Some(self.keys.public_key());
        assert!(self.send(notary, request).success);
    }
}

fn test_notary() -> (Notary, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = NotaryConfig {
        storage: StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..StorageConfig::default()
        },
        numbers_per_request: 5,
        ..NotaryConfig::default()
    };
    (Notary::open(config).unwrap(), temp_dir)
}

fn register_unit(notary: &Notary, nym: &mut TestNym) -> (InstrumentDefinitionId, Account) {
    let unit = UnitDefinition {
        name: "Test gold".to_string(),
        symbol: "TGLD".to_string(),
        issuer: nym.id(),
    };
    let mut request = nym.request(notary, MessageType::RegisterInstrumentDefinition);
    request.payload = Armored::encode(&unit).unwrap();
    let reply = nym.send(notary, request);
    assert!(reply.success);
    (reply.payload2.decode().unwrap(), reply.payload.decode().unwrap())
}

fn get_numbers(notary: &Notary, nym: &mut TestNym) -> Vec<TransactionNumber> {
    let request = nym.request(notary, MessageType::GetTransactionNumbers);
    let reply = nym.send(notary, request);
    assert!(reply.success);
    reply.payload.decode().unwrap()
}

#[test]
fn test_register_account_reply_is_signed_cleared_and_silent() {
    let (notary, _temp) = test_notary();
    let mut alice = TestNym::new();
    alice.register(&notary);
    let (unit_id, _) = register_unit(&notary, &mut alice);

    let nymbox_key = LedgerKey::nymbox(*notary.notary_id(), alice.id());
    let before = notary.load_box(&nymbox_key).unwrap().len();

    let mut request = alice.request(&notary, MessageType::RegisterAccount);
    request.payload = Armored::encode(&unit_id).unwrap();
    let reply = alice.send(&notary, request);

    assert!(reply.success);
    assert!(reply.is_signed());
    assert!(reply.in_reference_to.is_empty());
    assert_eq!(notary.load_box(&nymbox_key).unwrap().len(), before);

    let account: Account = reply.payload.decode().unwrap();
    assert_eq!(account.nym_id, alice.id());
    assert_eq!(reply.account_id, Some(account.account_id));
}

#[test]
fn test_failed_register_account_keeps_echo() {
    let (notary, _temp) = test_notary();
    let mut alice = TestNym::new();
    alice.register(&notary);

    let mut request = alice.request(&notary, MessageType::RegisterAccount);
    request.payload = Armored::encode(&InstrumentDefinitionId::digest(b"unknown")).unwrap();
    let reply = alice.send(&notary, request.clone());

    assert!(!reply.success);
    let echoed: Message = reply.in_reference_to.decode().unwrap();
    assert_eq!(echoed.request_number, request.request_number);
    assert_eq!(echoed.command, MessageType::RegisterAccount);
}

#[test]
fn test_transaction_numbers_drop_reply_notice() {
    let (notary, _temp) = test_notary();
    let mut alice = TestNym::new();
    alice.register(&notary);

    let request = alice.request(&notary, MessageType::GetTransactionNumbers);
    let request_number = request.request_number;
    let reply = alice.send(&notary, request);
    let numbers: Vec<TransactionNumber> = reply.payload.decode().unwrap();
    assert_eq!(numbers.len(), 5);

    let nymbox = notary
        .load_box(&LedgerKey::nymbox(*notary.notary_id(), alice.id()))
        .unwrap();
    let notice = nymbox.find_reply_notice(request_number).unwrap();
    assert!(notice.is_abbreviated());
    assert_eq!(reply.nymbox_hash, Some(nymbox.hash().unwrap()));

    // The notice carries the very reply that was returned
    let mut request = alice.request(&notary, MessageType::GetBoxReceipt);
    request.transaction_number = notice.number();
    request.depth = 0;
    let receipt_reply = alice.send(&notary, request);
    let receipt: Transaction = receipt_reply.payload.decode().unwrap();
    let carried: Message = receipt.attachment.decode().unwrap();
    assert_eq!(carried.payload, reply.payload);
    assert_eq!(carried.request_number, request_number);
}

#[test]
fn test_balance_mismatch_burns_opening_number() {
    let (notary, _temp) = test_notary();
    let mut alice = TestNym::new();
    let mut bob = TestNym::new();
    alice.register(&notary);
    bob.register(&notary);

    let (unit_id, issuer_account) = register_unit(&notary, &mut alice);
    let mut request = bob.request(&notary, MessageType::RegisterAccount);
    request.payload = Armored::encode(&unit_id).unwrap();
    let bob_account: Account = bob.send(&notary, request).payload.decode().unwrap();

    let numbers = get_numbers(&notary, &mut alice);
    let opening = numbers[0];

    let mut transfer = Transaction::new(*notary.notary_id(), alice.id(), TransactionType::Transfer, opening);
    transfer.account_id = Some(issuer_account.account_id);
    transfer.recipient = Some(Party {
        nym_id: bob.id(),
        account_id: Some(bob_account.account_id),
    });
    transfer.amount = 25;
    transfer.statement = Some(BalanceStatement {
        notary_id: *notary.notary_id(),
        nym_id: alice.id(),
        account_id: Some(issuer_account.account_id),
        opening_number: Some(opening),
        issued: numbers.iter().copied().collect(),
        // Wrong: should be -25
        balance: Some(0),
    });
    transfer.sign(&alice.keys).unwrap();

    let mut request = alice.request(&notary, MessageType::NotarizeTransaction);
    request.transaction_number = opening;
    request.payload = Armored::encode(&transfer).unwrap();
    let reply = alice.send(&notary, request);

    // Message succeeded, transaction did not
    assert!(reply.success);
    let response: TransactionResponse = reply.payload.decode().unwrap();
    assert!(!response.success);
    assert!(!response.balance_agreement_success);

    // Resending the same number fails: it was burned
    let mut retry = alice.request(&notary, MessageType::NotarizeTransaction);
    retry.transaction_number = opening;
    retry.payload = Armored::encode(&transfer).unwrap();
    let response: TransactionResponse = alice.send(&notary, retry).payload.decode().unwrap();
    assert!(!response.success);
    assert_eq!(notary.storage().number_owner(opening).unwrap(), None);

    // No funds moved
    let account = notary.storage().get_account(&issuer_account.account_id).unwrap().unwrap();
    assert_eq!(account.balance, 0);
}

fn activate(notary: &Notary, nym: &mut TestNym, account: &Account, item: &CronItem) -> TransactionResponse {
    let opening = item.id().unwrap();
    let issued = {
        let editor = notary.contexts().edit(&nym.id()).unwrap().unwrap();
        editor.pool().issued().clone()
    };

    let mut transaction = Transaction::new(*notary.notary_id(), nym.id(), TransactionType::ActivateCronItem, opening);
    transaction.account_id = Some(account.account_id);
    transaction.attachment = Armored::encode(item).unwrap();
    transaction.statement = Some(BalanceStatement {
        notary_id: *notary.notary_id(),
        nym_id: nym.id(),
        account_id: Some(account.account_id),
        opening_number: Some(opening),
        issued,
        balance: Some(account.balance),
    });
    transaction.sign(&nym.keys).unwrap();

    let mut request = nym.request(notary, MessageType::NotarizeTransaction);
    request.transaction_number = opening;
    request.payload = Armored::encode(&transaction).unwrap();
    let reply = nym.send(notary, request);
    assert!(reply.success);
    reply.payload.decode().unwrap()
}

#[test]
fn test_malformed_cron_parties_leave_numbers_untouched() {
    let (notary, _temp) = test_notary();
    let mut alice = TestNym::new();
    let mut bob = TestNym::new();
    alice.register(&notary);
    bob.register(&notary);

    let (unit_id, alice_account) = register_unit(&notary, &mut alice);
    let mut request = bob.request(&notary, MessageType::RegisterAccount);
    request.payload = Armored::encode(&unit_id).unwrap();
    let bob_account: Account = bob.send(&notary, request).payload.decode().unwrap();

    let alice_numbers = get_numbers(&notary, &mut alice);
    let bob_numbers = get_numbers(&notary, &mut bob);

    // Bob commits the same number twice
    let mut repeated = CronItem::new(CronItemKind::SmartContract, *notary.notary_id(), alice.id(), "terms");
    repeated.parties.push(CronParty::new(alice.id(), alice_account.account_id, alice_numbers[0], alice_numbers[1]));
    repeated.parties.push(CronParty::new(bob.id(), bob_account.account_id, bob_numbers[0], bob_numbers[0]));
    repeated.sign_as(&bob.keys).unwrap();
    repeated.sign_as(&alice.keys).unwrap();

    // Bob appears twice, each record signed
    let mut twice = CronItem::new(CronItemKind::SmartContract, *notary.notary_id(), alice.id(), "terms");
    twice.parties.push(CronParty::new(alice.id(), alice_account.account_id, alice_numbers[2], alice_numbers[3]));
    twice.parties.push(CronParty::new(bob.id(), bob_account.account_id, bob_numbers[2], bob_numbers[3]));
    twice.sign_as(&bob.keys).unwrap();
    twice.parties.insert(1, CronParty::new(bob.id(), bob_account.account_id, bob_numbers[0], bob_numbers[1]));
    twice.sign_as(&bob.keys).unwrap();
    twice.sign_as(&alice.keys).unwrap();
    assert!(twice.parties.iter().all(|party| party.signature.is_some()));

    for (item, closing) in [(&repeated, alice_numbers[1]), (&twice, alice_numbers[3])] {
        let opening = item.id().unwrap();
        let response = activate(&notary, &mut alice, &alice_account, item);
        assert!(!response.success);

        // Opening burned, closing still usable
        assert_eq!(notary.storage().number_owner(opening).unwrap(), None);
        assert_eq!(notary.storage().number_owner(closing).unwrap(), Some(alice.id()));
        assert!(notary.storage().get_cron_item(opening).unwrap().is_none());
        let editor = notary.contexts().edit(&alice.id()).unwrap().unwrap();
        assert!(editor.pool().is_available(closing));
    }

    // Bob gave nothing up
    let editor = notary.contexts().edit(&bob.id()).unwrap().unwrap();
    for number in &bob_numbers {
        assert!(editor.pool().is_available(*number));
    }
}

#[test]
fn test_unsupported_command_fails_cleanly() {
    let (notary, _temp) = test_notary();
    let mut alice = TestNym::new();
    alice.register(&notary);

    let request = alice.request(&notary, MessageType::GetMarketList);
    let reply = alice.send(&notary, request);
    assert!(!reply.success);
    assert_eq!(reply.command_name(), "getMarketListResponse");
}

#[test]
fn test_locked_notary_refuses_non_admin() {
    let temp_dir = TempDir::new().unwrap();
    let admin = KeyPair::generate();
    let config = NotaryConfig {
        storage: StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..StorageConfig::default()
        },
        locked: true,
        admin_nym: Some(admin.nym_id().identifier().to_hex()),
        ..NotaryConfig::default()
    };
    let notary = Notary::open(config).unwrap();

    let mut alice = TestNym::new();
    let mut request = alice.request(&notary, MessageType::RegisterNym);
    request.public_key = Some(alice.keys.public_key());
    assert!(!alice.send(&notary, request).success);

    let mut admin_nym = TestNym { keys: admin, request_number: 1 };
    admin_nym.register(&notary);
}
